//! Background Worker for Job Processing
//!
//! Claims jobs waiting for a worker, waits for the request tier to store
//! credentials, then runs the copy and records the outcome. While it holds
//! a job the worker beats on it; jobs whose worker stopped beating are put
//! back up for claiming and resume from their export checkpoint.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::transfer::coordinator::{JobCoordinator, ERRORS_KEY};
use crate::transfer::copier::DataCopier;
use crate::transfer::crypto::{CredentialCipher, KeyMaterialGenerator, RandomKeyGenerator};
use crate::transfer::db::{JobStore, JobStoreExt};
use crate::transfer::error::{FailureReason, Result, TransferError};
use crate::transfer::executor::{ExecutorBackend, IdempotentImportExecutor, InMemoryBackend};
use crate::transfer::job::PortabilityJob;
use crate::transfer::registry::ProviderRegistry;
use crate::transfer::retry::RetryStrategy;
use crate::transfer::state::{AuthorizationState, JobState, WorkerKeys};
use crate::transfer::types::{AuthData, ErrorDetail, JobId};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Delay between scans for claimable jobs (ms)
    pub poll_interval_ms: u64,
    /// How long a claimed job may wait for auth data (ms)
    pub auth_timeout_ms: u64,
    /// Interval of the store check for cancellation (ms)
    pub cancel_check_ms: u64,
    /// Interval of the liveness beat on a held job (ms)
    pub heartbeat_interval_ms: u64,
    /// Silence after which a held job is given to another worker (ms)
    pub lease_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,   // 1 second
            auth_timeout_ms: 300_000, // 5 minutes
            cancel_check_ms: 1000,
            heartbeat_interval_ms: 10_000,
            lease_timeout_ms: 60_000,
        }
    }
}

/// Background worker; processes one job at a time
pub struct JobWorker {
    coordinator: Arc<JobCoordinator>,
    store: Arc<dyn JobStore>,
    registry: Arc<ProviderRegistry>,
    cipher: Arc<dyn CredentialCipher>,
    key_generator: Arc<dyn KeyMaterialGenerator>,
    executor_backend: Arc<dyn ExecutorBackend>,
    retry: RetryStrategy,
    config: WorkerConfig,
}

impl JobWorker {
    pub fn new(
        coordinator: Arc<JobCoordinator>,
        registry: Arc<ProviderRegistry>,
        cipher: Arc<dyn CredentialCipher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store: coordinator.store().clone(),
            coordinator,
            registry,
            cipher,
            key_generator: Arc::new(RandomKeyGenerator),
            executor_backend: Arc::new(InMemoryBackend),
            retry: RetryStrategy::default(),
            config,
        }
    }

    pub fn with_key_generator(mut self, key_generator: Arc<dyn KeyMaterialGenerator>) -> Self {
        self.key_generator = key_generator;
        self
    }

    pub fn with_executor_backend(mut self, backend: Arc<dyn ExecutorBackend>) -> Self {
        self.executor_backend = backend;
        self
    }

    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    /// Run the worker loop until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        log::info!(
            "Job worker started (poll_interval={}ms, auth_timeout={}ms, lease_timeout={}ms)",
            self.config.poll_interval_ms,
            self.config.auth_timeout_ms,
            self.config.lease_timeout_ms
        );

        while !shutdown.is_cancelled() {
            match self.run_once().await {
                // look for more work right away
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => log::error!("Error processing job: {}", e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
            }
        }

        log::info!("Job worker stopped");
    }

    /// Start the worker in a background task
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    /// Claim and process at most one job
    ///
    /// Jobs held by a silent worker are released first. Returns the id of
    /// the processed job, or `None` when nothing was claimable or another
    /// worker won the claim.
    pub async fn run_once(&self) -> Result<Option<JobId>> {
        self.release_stale_jobs().await?;

        let Some(job_id) = self
            .store
            .find_first_job(AuthorizationState::PendingWorkerAssignment)
            .await?
        else {
            return Ok(None);
        };

        let keys = self.key_generator.generate();
        if !self.coordinator.claim_job(job_id, keys.clone()).await? {
            log::debug!("Job {}: claimed by another worker", job_id);
            return Ok(None);
        }

        self.process(job_id, &keys).await?;
        Ok(Some(job_id))
    }

    async fn release_stale_jobs(&self) -> Result<()> {
        let Some(deadline) = self.lease_deadline() else {
            return Ok(());
        };
        for job_id in self.store.find_stale_jobs(deadline).await? {
            if let Err(e) = self.coordinator.release_stale(job_id, deadline).await {
                log::warn!("Job {}: could not release stale lease: {}", job_id, e);
            }
        }
        Ok(())
    }

    fn lease_deadline(&self) -> Option<DateTime<Utc>> {
        let lease = chrono::Duration::from_std(Duration::from_millis(self.config.lease_timeout_ms)).ok()?;
        Utc::now().checked_sub_signed(lease)
    }

    async fn process(&self, job_id: JobId, keys: &WorkerKeys) -> Result<()> {
        let job = match self.wait_for_auth_data(job_id, keys).await {
            Ok(job) => job,
            Err(TransferError::AuthorizationTimedOut(_)) => {
                log::warn!("Job {}: no auth data after {}ms", job_id, self.config.auth_timeout_ms);
                let reason = FailureReason::AuthorizationTimedOut.to_string();
                self.coordinator.mark_failed(job_id, &reason).await?;
                return Ok(());
            }
            Err(TransferError::Canceled(_)) => {
                log::info!("Job {}: canceled before auth data arrived", job_id);
                return Ok(());
            }
            Err(TransferError::LeaseLost(_)) => {
                log::warn!("Job {}: lease lost before auth data arrived", job_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let executor = Arc::new(IdempotentImportExecutor::new(self.executor_backend.clone()));
        let outcome = self.execute(&job, keys, executor.clone()).await;
        if let Err(TransferError::LeaseLost(_)) = outcome {
            log::warn!("Job {}: lease lost, leaving the job to its new worker", job_id);
            return Ok(());
        }

        let errors: Vec<ErrorDetail> = executor.get_errors();
        self.store.store_json(job_id, ERRORS_KEY, &errors).await?;

        match outcome {
            Ok(_) => {
                self.coordinator.mark_complete(job_id).await?;
                log::info!("Job {}: completed with {} item errors", job_id, errors.len());
            }
            Err(TransferError::Canceled(_)) => {
                log::info!("Job {}: canceled, committed imports kept", job_id);
            }
            Err(e) => {
                let reason = FailureReason::from_error(&e);
                log::error!("Job {}: failed ({}): {}", job_id, reason, e);
                self.coordinator.mark_failed(job_id, &reason.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn wait_for_auth_data(&self, job_id: JobId, keys: &WorkerKeys) -> Result<PortabilityJob> {
        let deadline = Instant::now() + Duration::from_millis(self.config.auth_timeout_ms);
        let mut last_beat = Instant::now();

        loop {
            let job = self.poll_job(job_id, keys, &mut last_beat).await?;
            if job.state.is_terminal() {
                return Err(TransferError::Canceled(job_id));
            }
            if job.job_authorization.encrypted_public_key() != Some(keys.public_key.as_str()) {
                return Err(TransferError::LeaseLost(job_id));
            }
            if job.authorization_state() == AuthorizationState::AssignedWithAuthData {
                return Ok(job);
            }
            if Instant::now() >= deadline {
                return Err(TransferError::AuthorizationTimedOut(job_id));
            }
            sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }

    async fn execute(
        &self,
        job: &PortabilityJob,
        keys: &WorkerKeys,
        executor: Arc<IdempotentImportExecutor>,
    ) -> Result<Vec<ErrorDetail>> {
        let export_auth = self.decrypt_auth(job.job_authorization.encrypted_export_auth_data(), keys)?;
        let import_auth = self.decrypt_auth(job.job_authorization.encrypted_import_auth_data(), keys)?;

        if self.coordinator.mark_in_progress(job.id).await? != JobState::InProgress {
            return Err(TransferError::Canceled(job.id));
        }

        let data_type = job.transfer_data_type;
        let exporter = self.registry.exporter(&job.export_service, data_type)?;
        let importer = self.registry.importer(&job.import_service, data_type)?;
        executor.bind_to_job(job.id)?;

        log::info!(
            "Job {}: copying {} from {} to {}",
            job.id,
            data_type,
            job.export_service,
            job.import_service
        );
        let cancel = CancellationToken::new();
        let copier = DataCopier::new(job.id, exporter, importer, executor, self.store.clone())
            .with_retry(self.retry.clone())
            .with_cancellation(cancel.clone());

        let copy = copier.copy(&export_auth, &import_auth);
        let watch = self.watch(job.id, keys, cancel);
        tokio::pin!(copy);
        tokio::pin!(watch);

        let stop = tokio::select! {
            result = &mut copy => return result,
            stop = &mut watch => stop,
        };

        // the traversal stops at its next cancellation check
        match copy.await {
            Err(TransferError::Canceled(_)) => Err(stop),
            other => other,
        }
    }

    /// Read the job, beating on it when a beat is due
    async fn poll_job(
        &self,
        job_id: JobId,
        keys: &WorkerKeys,
        last_beat: &mut Instant,
    ) -> Result<PortabilityJob> {
        if last_beat.elapsed() < Duration::from_millis(self.config.heartbeat_interval_ms) {
            return self.coordinator.get(job_id).await;
        }
        *last_beat = Instant::now();
        self.coordinator.heartbeat(job_id, &keys.public_key).await
    }

    /// Keep the lease alive; fire `cancel` once the job ends or is taken over
    ///
    /// Returns the reason the copy has to stop.
    async fn watch(&self, job_id: JobId, keys: &WorkerKeys, cancel: CancellationToken) -> TransferError {
        let interval = Duration::from_millis(self.config.cancel_check_ms);
        let mut last_beat = Instant::now();

        let stop = loop {
            sleep(interval).await;
            match self.poll_job(job_id, keys, &mut last_beat).await {
                Ok(job) if job.state.is_terminal() => {
                    log::info!("Job {}: {} while running, stopping", job_id, job.state);
                    break TransferError::Canceled(job_id);
                }
                Ok(_) => {}
                Err(TransferError::LeaseLost(_)) => break TransferError::LeaseLost(job_id),
                Err(TransferError::JobNotFound(_)) => {
                    log::warn!("Job {}: removed while running", job_id);
                    break TransferError::Canceled(job_id);
                }
                Err(e) => log::warn!("Job {}: liveness check failed: {}", job_id, e),
            }
        };
        cancel.cancel();
        stop
    }

    fn decrypt_auth(&self, blob: Option<&str>, keys: &WorkerKeys) -> Result<AuthData> {
        let blob = blob.ok_or_else(|| TransferError::Crypto("job has no auth data".to_string()))?;
        let plaintext = self.cipher.decrypt(&keys.private_key, blob)?;
        Ok(serde_json::from_str(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::adapters::{Importer, MockImporter};
    use crate::transfer::crypto::PassthroughCipher;
    use crate::transfer::db::InMemoryJobStore;
    use crate::transfer::registry::{ProviderContext, MOCK_DESTINATION, MOCK_SOURCE};
    use crate::transfer::types::DataType;

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval_ms: 5,
            auth_timeout_ms: 2_000,
            cancel_check_ms: 5,
            heartbeat_interval_ms: 5,
            lease_timeout_ms: 60_000,
        }
    }

    fn setup(registry: ProviderRegistry, config: WorkerConfig) -> (Arc<JobCoordinator>, Arc<JobWorker>) {
        let registry = Arc::new(registry);
        let cipher: Arc<dyn CredentialCipher> = Arc::new(PassthroughCipher);
        let coordinator = Arc::new(JobCoordinator::new(
            Arc::new(InMemoryJobStore::new()),
            registry.clone(),
            cipher.clone(),
        ));
        let worker = JobWorker::new(coordinator.clone(), registry, cipher, config).with_retry(
            RetryStrategy::Uniform {
                max_attempts: 2,
                interval_ms: 1,
            },
        );
        (coordinator, Arc::new(worker))
    }

    fn token(t: &str) -> AuthData {
        AuthData::Token { token: t.to_string() }
    }

    async fn wait_for_claim(coordinator: &JobCoordinator, job_id: JobId) {
        for _ in 0..400 {
            let job = coordinator.get(job_id).await.unwrap();
            if job.authorization_state() == AuthorizationState::AssignedWithoutAuthData {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} was never claimed", job_id);
    }

    async fn create_requested(coordinator: &JobCoordinator, data_type: DataType) -> JobId {
        let job_id = coordinator
            .create_job(MOCK_SOURCE, MOCK_DESTINATION, data_type)
            .await
            .unwrap();
        coordinator.request_worker(job_id).await.unwrap();
        job_id
    }

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();

        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.auth_timeout_ms, 300_000);
        assert_eq!(config.cancel_check_ms, 1000);
        assert!(config.heartbeat_interval_ms < config.lease_timeout_ms);
    }

    #[tokio::test]
    async fn test_run_once_without_jobs() {
        let (_, worker) = setup(ProviderRegistry::with_mock_providers(), fast_config());
        assert_eq!(worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_claims_and_completes_job() {
        let (coordinator, worker) = setup(ProviderRegistry::with_mock_providers(), fast_config());
        let job_id = create_requested(&coordinator, DataType::Calendar).await;

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run_once().await }
        });

        wait_for_claim(&coordinator, job_id).await;
        coordinator
            .store_auth_data(job_id, &token("export"), &token("import"))
            .await
            .unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), Some(job_id));

        let job = coordinator.get(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Complete);
        assert!(job.failure_reason.is_none());

        let counts = coordinator.counts(job_id).await.unwrap();
        assert_eq!(counts.items["calendars"], 2);
        assert_eq!(counts.items["events"], 4);
        assert!(coordinator.errors(job_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auth_timeout_fails_job() {
        let config = WorkerConfig {
            auth_timeout_ms: 30,
            ..fast_config()
        };
        let (coordinator, worker) = setup(ProviderRegistry::with_mock_providers(), config);
        let job_id = create_requested(&coordinator, DataType::Photos).await;

        assert_eq!(worker.run_once().await.unwrap(), Some(job_id));

        let job = coordinator.get(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Error);
        assert_eq!(job.failure_reason.as_deref(), Some("authorization_timed_out"));
    }

    #[tokio::test]
    async fn test_canceled_while_waiting_for_auth() {
        let (coordinator, worker) = setup(ProviderRegistry::with_mock_providers(), fast_config());
        let job_id = create_requested(&coordinator, DataType::Photos).await;

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run_once().await }
        });

        wait_for_claim(&coordinator, job_id).await;
        coordinator.cancel_job(job_id).await.unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), Some(job_id));
        assert_eq!(coordinator.get(job_id).await.unwrap().state, JobState::Canceled);
    }

    fn full_importer(ctx: &ProviderContext) -> Arc<dyn Importer> {
        let importer = MockImporter::new(&ctx.service_id);
        importer.set_quota(1);
        Arc::new(importer)
    }

    #[tokio::test]
    async fn test_destination_full_reason() {
        let mut registry = ProviderRegistry::with_mock_providers();
        registry.register_importer(MOCK_DESTINATION, DataType::Calendar, full_importer);
        let (coordinator, worker) = setup(registry, fast_config());
        let job_id = create_requested(&coordinator, DataType::Calendar).await;

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run_once().await }
        });
        wait_for_claim(&coordinator, job_id).await;
        coordinator
            .store_auth_data(job_id, &token("export"), &token("import"))
            .await
            .unwrap();
        handle.await.unwrap().unwrap();

        let job = coordinator.get(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Error);
        assert_eq!(
            job.failure_reason.as_deref(),
            Some("destination_full: storage quota exceeded")
        );
    }

    #[tokio::test]
    async fn test_reclaims_job_from_silent_worker() {
        let config = WorkerConfig {
            lease_timeout_ms: 30,
            ..fast_config()
        };
        let (coordinator, worker) = setup(ProviderRegistry::with_mock_providers(), config);
        let job_id = create_requested(&coordinator, DataType::Calendar).await;

        // claimed by a worker that never beats again
        let silent = RandomKeyGenerator.generate();
        assert!(coordinator.claim_job(job_id, silent.clone()).await.unwrap());
        sleep(Duration::from_millis(60)).await;

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run_once().await }
        });

        for _ in 0..400 {
            let job = coordinator.get(job_id).await.unwrap();
            let key = job.job_authorization.encrypted_public_key();
            if job.authorization_state() == AuthorizationState::AssignedWithoutAuthData
                && key != Some(silent.public_key.as_str())
            {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        coordinator
            .store_auth_data(job_id, &token("export"), &token("import"))
            .await
            .unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), Some(job_id));
        assert_eq!(coordinator.get(job_id).await.unwrap().state, JobState::Complete);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_, worker) = setup(ProviderRegistry::with_mock_providers(), fast_config());
        let shutdown = CancellationToken::new();
        let handle = worker.clone().spawn(shutdown.clone());

        sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
