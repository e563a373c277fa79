use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use porter::transfer::adapters::{Importer, MockImporter};
use porter::transfer::executor::ExecutorBackend;
use porter::transfer::registry::{ProviderContext, MOCK_DESTINATION, MOCK_SOURCE};
use porter::transfer::{
    AuthData, AuthorizationState, ContainerResource, CredentialCipher, DataType,
    IdempotentImportExecutor, ImportResult, InMemoryJobStore, JobCoordinator, JobId, JobState,
    JobStore, JobWorker, PassthroughCipher, PortabilityJob, ProviderError, ProviderRegistry,
    RetryStrategy, SledExecutorBackend, SledJobStore, WorkerConfig,
};

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval_ms: 5,
        auth_timeout_ms: 5_000,
        cancel_check_ms: 5,
        heartbeat_interval_ms: 5,
        lease_timeout_ms: 60_000,
    }
}

struct Harness {
    coordinator: Arc<JobCoordinator>,
    registry: Arc<ProviderRegistry>,
    cipher: Arc<dyn CredentialCipher>,
    shutdown: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Harness {
    fn new(store: Arc<dyn JobStore>, registry: ProviderRegistry) -> Self {
        let registry = Arc::new(registry);
        let cipher: Arc<dyn CredentialCipher> = Arc::new(PassthroughCipher);
        let coordinator = Arc::new(JobCoordinator::new(store, registry.clone(), cipher.clone()));

        Self {
            coordinator,
            registry,
            cipher,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    fn start(
        store: Arc<dyn JobStore>,
        backend: Option<Arc<dyn ExecutorBackend>>,
        workers: usize,
    ) -> Self {
        let mut harness = Self::new(store, ProviderRegistry::with_mock_providers());
        for _ in 0..workers {
            let handle = harness.spawn_worker(fast_config(), backend.clone());
            harness.handles.push(handle);
        }
        harness
    }

    fn spawn_worker(
        &self,
        config: WorkerConfig,
        backend: Option<Arc<dyn ExecutorBackend>>,
    ) -> tokio::task::JoinHandle<()> {
        let mut worker = JobWorker::new(
            self.coordinator.clone(),
            self.registry.clone(),
            self.cipher.clone(),
            config,
        )
        .with_retry(RetryStrategy::Uniform {
            max_attempts: 2,
            interval_ms: 1,
        });
        if let Some(backend) = backend {
            worker = worker.with_executor_backend(backend);
        }
        Arc::new(worker).spawn(self.shutdown.clone())
    }

    async fn stop(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            handle.await.unwrap();
        }
    }

    async fn submit(&self, data_type: DataType) -> JobId {
        self.submit_to(MOCK_DESTINATION, data_type).await
    }

    async fn submit_to(&self, import_service: &str, data_type: DataType) -> JobId {
        let job_id = self
            .coordinator
            .create_job(MOCK_SOURCE, import_service, data_type)
            .await
            .unwrap();
        self.coordinator.request_worker(job_id).await.unwrap();
        job_id
    }

    async fn wait_for(&self, job_id: JobId, done: impl Fn(&PortabilityJob) -> bool) -> PortabilityJob {
        for _ in 0..1000 {
            let job = self.coordinator.get(job_id).await.unwrap();
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} did not reach the expected state", job_id);
    }

    async fn authorize(&self, job_id: JobId) {
        self.wait_for(job_id, |job| {
            job.authorization_state() == AuthorizationState::AssignedWithoutAuthData
        })
        .await;
        self.coordinator
            .store_auth_data(job_id, &token("export"), &token("import"))
            .await
            .unwrap();
    }
}

fn token(t: &str) -> AuthData {
    AuthData::Token { token: t.to_string() }
}

const SLOW_DESTINATION: &str = "slow-dest";

/// Every importer the slow destination handed out, across workers
static SLOW_IMPORTERS: Mutex<Vec<Arc<MockImporter>>> = Mutex::new(Vec::new());

/// Mock destination that takes a while per import call
struct SlowImporter {
    inner: Arc<MockImporter>,
}

#[async_trait]
impl Importer for SlowImporter {
    async fn import_item(
        &self,
        job_id: JobId,
        executor: &IdempotentImportExecutor,
        auth_data: &AuthData,
        data: ContainerResource,
    ) -> Result<ImportResult, ProviderError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.inner.import_item(job_id, executor, auth_data, data).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

fn slow_importer(ctx: &ProviderContext) -> Arc<dyn Importer> {
    let inner = Arc::new(MockImporter::new(&ctx.service_id));
    SLOW_IMPORTERS.lock().unwrap().push(inner.clone());
    Arc::new(SlowImporter { inner })
}

fn slow_imported() -> Vec<String> {
    SLOW_IMPORTERS
        .lock()
        .unwrap()
        .iter()
        .flat_map(|importer| importer.imported())
        .collect()
}

#[tokio::test]
async fn test_calendar_job_end_to_end() {
    let harness = Harness::start(Arc::new(InMemoryJobStore::new()), None, 1);

    let job_id = harness.submit(DataType::Calendar).await;
    harness.authorize(job_id).await;

    let job = harness.wait_for(job_id, |job| job.state.is_terminal()).await;
    assert_eq!(job.state, JobState::Complete);
    assert!(job.failure_reason.is_none());
    assert_eq!(job.authorization_state(), AuthorizationState::AssignedWithAuthData);

    let counts = harness.coordinator.counts(job_id).await.unwrap();
    assert_eq!(counts.items["calendars"], 2);
    assert_eq!(counts.items["events"], 4);
    assert!(harness.coordinator.errors(job_id).await.unwrap().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_each_job_is_claimed_by_one_worker() {
    let harness = Harness::start(Arc::new(InMemoryJobStore::new()), None, 3);

    let calendar = harness.submit(DataType::Calendar).await;
    let photos = harness.submit(DataType::Photos).await;
    harness.authorize(calendar).await;
    harness.authorize(photos).await;

    for job_id in [calendar, photos] {
        let job = harness.wait_for(job_id, |job| job.state.is_terminal()).await;
        assert_eq!(job.state, JobState::Complete);
    }

    let counts = harness.coordinator.counts(photos).await.unwrap();
    assert_eq!(counts.items["albums"], 1);
    assert_eq!(counts.items["photos"], 2);
    assert_eq!(counts.bytes, 2048);

    harness.stop().await;
}

#[tokio::test]
async fn test_job_on_sled_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let store: Arc<dyn JobStore> = Arc::new(SledJobStore::open(&db).unwrap());
    let backend: Arc<dyn ExecutorBackend> = Arc::new(SledExecutorBackend::open(&db).unwrap());
    let harness = Harness::start(store, Some(backend), 1);

    let job_id = harness.submit(DataType::Photos).await;
    harness.authorize(job_id).await;

    let job = harness.wait_for(job_id, |job| job.state.is_terminal()).await;
    assert_eq!(job.state, JobState::Complete);
    assert_eq!(harness.coordinator.counts(job_id).await.unwrap().items["photos"], 2);

    harness.stop().await;
}

#[tokio::test]
async fn test_dead_worker_job_resumes_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let store: Arc<dyn JobStore> = Arc::new(SledJobStore::open(&db).unwrap());
    let backend: Arc<dyn ExecutorBackend> = Arc::new(SledExecutorBackend::open(&db).unwrap());

    let mut registry = ProviderRegistry::with_mock_providers();
    registry.register_importer(SLOW_DESTINATION, DataType::Calendar, slow_importer);
    let mut harness = Harness::new(store, registry);

    let first = harness.spawn_worker(fast_config(), Some(backend.clone()));
    let job_id = harness.submit_to(SLOW_DESTINATION, DataType::Calendar).await;
    harness.authorize(job_id).await;

    // kill the worker once the first page made it across
    for _ in 0..1000 {
        if !slow_imported().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    let job = harness.coordinator.get(job_id).await.unwrap();
    assert_eq!(job.state, JobState::InProgress);
    assert!(slow_imported().len() < 6);

    let config = WorkerConfig {
        lease_timeout_ms: 200,
        ..fast_config()
    };
    let second = harness.spawn_worker(config, Some(backend));
    harness.handles.push(second);

    // the new worker holds fresh keys, so credentials are stored again
    harness.authorize(job_id).await;
    let job = harness.wait_for(job_id, |job| job.state.is_terminal()).await;
    assert_eq!(job.state, JobState::Complete);

    let imported = slow_imported();
    let distinct: HashSet<&String> = imported.iter().collect();
    assert_eq!(distinct.len(), imported.len(), "items imported twice: {:?}", imported);
    assert_eq!(imported.len(), 6);
    assert!(harness.coordinator.errors(job_id).await.unwrap().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_cancel_before_credentials() {
    let harness = Harness::start(Arc::new(InMemoryJobStore::new()), None, 1);

    let job_id = harness.submit(DataType::Calendar).await;
    harness
        .wait_for(job_id, |job| {
            job.authorization_state() == AuthorizationState::AssignedWithoutAuthData
        })
        .await;

    assert_eq!(harness.coordinator.cancel_job(job_id).await.unwrap(), JobState::Canceled);

    // the worker gives up on the job and stays canceled
    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = harness.coordinator.get(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Canceled);
    assert!(harness.coordinator.counts(job_id).await.unwrap().items.is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_route_is_rejected() {
    let harness = Harness::start(Arc::new(InMemoryJobStore::new()), None, 0);

    let result = harness
        .coordinator
        .create_job(MOCK_SOURCE, "nowhere", DataType::Calendar)
        .await;
    assert!(result.is_err());

    harness.stop().await;
}
