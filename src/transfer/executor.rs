//! Idempotent import executor
//!
//! Runs each unit of import work at most once per idempotent id, caching the
//! result so retries of a whole import call skip everything that already
//! succeeded. Failures are recorded as [`ErrorDetail`]s until a later
//! attempt for the same id succeeds.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::transfer::error::{ProviderError, Result, TransferError};
use crate::transfer::types::{ErrorDetail, ImportableItem, ItemImportResult, JobId};

/// Results and errors previously persisted for one job
#[derive(Debug, Default)]
pub struct PersistedState {
    pub results: HashMap<String, Value>,
    pub errors: HashMap<String, ErrorDetail>,
}

/// Where the executor keeps its records between runs
pub trait ExecutorBackend: Send + Sync {
    /// Whether `bind_to_job` must be called before executing work
    fn requires_binding(&self) -> bool;

    /// `None` when the backend keeps nothing beyond the executor itself
    fn load(&self, job_id: JobId) -> Result<Option<PersistedState>>;

    fn store_result(&self, job_id: Option<JobId>, id: &str, value: &Value) -> Result<()>;

    fn store_error(&self, job_id: Option<JobId>, error: &ErrorDetail) -> Result<()>;

    fn clear_error(&self, job_id: Option<JobId>, id: &str) -> Result<()>;
}

/// Keeps everything in the executor's own maps; binding is a no-op
#[derive(Debug, Default)]
pub struct InMemoryBackend;

impl ExecutorBackend for InMemoryBackend {
    fn requires_binding(&self) -> bool {
        false
    }

    fn load(&self, _job_id: JobId) -> Result<Option<PersistedState>> {
        Ok(None)
    }

    fn store_result(&self, _job_id: Option<JobId>, _id: &str, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn store_error(&self, _job_id: Option<JobId>, _error: &ErrorDetail) -> Result<()> {
        Ok(())
    }

    fn clear_error(&self, _job_id: Option<JobId>, _id: &str) -> Result<()> {
        Ok(())
    }
}

const RESULTS_TREE: &str = "executor_results";
const ERRORS_TREE: &str = "executor_errors";

/// Persists results and errors in sled, keyed by `{job_id}/{idempotent_id}`
pub struct SledExecutorBackend {
    results: sled::Tree,
    errors: sled::Tree,
}

impl SledExecutorBackend {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            results: db.open_tree(RESULTS_TREE)?,
            errors: db.open_tree(ERRORS_TREE)?,
        })
    }

    fn key(job_id: Option<JobId>, id: &str) -> Result<String> {
        let job_id = job_id.ok_or(TransferError::ExecutorNotBound)?;
        Ok(format!("{}/{}", job_id, id))
    }

    fn scan<T: DeserializeOwned>(tree: &sled::Tree, job_id: JobId) -> Result<HashMap<String, T>> {
        let prefix = format!("{}/", job_id);
        let mut out = HashMap::new();
        for entry in tree.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            out.insert(id, serde_json::from_slice(&value)?);
        }
        Ok(out)
    }
}

impl ExecutorBackend for SledExecutorBackend {
    fn requires_binding(&self) -> bool {
        true
    }

    fn load(&self, job_id: JobId) -> Result<Option<PersistedState>> {
        Ok(Some(PersistedState {
            results: Self::scan(&self.results, job_id)?,
            errors: Self::scan(&self.errors, job_id)?,
        }))
    }

    fn store_result(&self, job_id: Option<JobId>, id: &str, value: &Value) -> Result<()> {
        let key = Self::key(job_id, id)?;
        self.results.insert(key.as_bytes(), serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn store_error(&self, job_id: Option<JobId>, error: &ErrorDetail) -> Result<()> {
        let key = Self::key(job_id, &error.id)?;
        self.errors.insert(key.as_bytes(), serde_json::to_vec(error)?)?;
        Ok(())
    }

    fn clear_error(&self, job_id: Option<JobId>, id: &str) -> Result<()> {
        let key = Self::key(job_id, id)?;
        self.errors.remove(key.as_bytes())?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ExecutorState {
    job_id: Option<JobId>,
    results: HashMap<String, Value>,
    errors: HashMap<String, ErrorDetail>,
    recent_errors: HashMap<String, ErrorDetail>,
}

/// At-most-once executor for import side effects
///
/// Each id gets its own async lock, so the check/execute/store sequence is
/// atomic per id while different ids run concurrently.
pub struct IdempotentImportExecutor {
    backend: Arc<dyn ExecutorBackend>,
    state: Mutex<ExecutorState>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdempotentImportExecutor {
    pub fn new(backend: Arc<dyn ExecutorBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(ExecutorState::default()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend))
    }

    /// Attach to a job, loading whatever the backend kept for it
    pub fn bind_to_job(&self, job_id: JobId) -> Result<()> {
        let persisted = self.backend.load(job_id)?;

        let mut state = self.state();
        state.job_id = Some(job_id);
        if let Some(persisted) = persisted {
            log::debug!(
                "Job {}: executor loaded {} results and {} errors",
                job_id,
                persisted.results.len(),
                persisted.errors.len()
            );
            state.results = persisted.results;
            state.errors = persisted.errors;
            state.recent_errors.clear();
        }
        Ok(())
    }

    /// Run `work` unless `id` already succeeded; failures are recorded and
    /// reported as `Ok(None)`
    pub async fn execute_and_swallow_errors<T, F, Fut>(
        &self,
        id: &str,
        display_name: &str,
        work: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        Ok(self.execute(id, display_name, true, work).await?.ok())
    }

    /// Run `work` unless `id` already succeeded; failures are recorded and
    /// returned
    pub async fn execute_or_throw<T, F, Fut>(&self, id: &str, display_name: &str, work: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        self.execute(id, display_name, false, work)
            .await?
            .map_err(TransferError::from)
    }

    /// Import one item keyed by its idempotent id; an `Error` status is
    /// recorded like a failed call
    pub async fn import_and_swallow_errors<I, T, F, Fut>(&self, item: &I, work: F) -> Result<Option<T>>
    where
        I: ImportableItem + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<ItemImportResult<T>, ProviderError>>,
    {
        let id = item.idempotent_id();
        let name = item.name();
        self.execute_and_swallow_errors(&id, &name, || async move {
            let result = work().await?;
            if result.is_success() {
                result.into_data().ok_or_else(|| {
                    ProviderError::Other(anyhow::anyhow!("import reported success without data"))
                })
            } else {
                let message = result.error_message().unwrap_or("import failed").to_string();
                Err(ProviderError::Other(anyhow::anyhow!(message)))
            }
        })
        .await
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.state().results.contains_key(id)
    }

    pub fn get_cached_value<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        let value = self
            .state()
            .results
            .get(id)
            .cloned()
            .ok_or_else(|| TransferError::NotCached(id.to_string()))?;
        Ok(serde_json::from_value(value)?)
    }

    /// All unresolved failures
    pub fn get_errors(&self) -> Vec<ErrorDetail> {
        sorted(self.state().errors.values().cloned().collect())
    }

    /// Failures recorded since the last reset
    pub fn get_recent_errors(&self) -> Vec<ErrorDetail> {
        sorted(self.state().recent_errors.values().cloned().collect())
    }

    pub fn reset_recent_errors(&self) {
        self.state().recent_errors.clear();
    }

    async fn execute<T, F, Fut>(
        &self,
        id: &str,
        display_name: &str,
        can_skip: bool,
        work: F,
    ) -> Result<std::result::Result<T, ProviderError>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let job_id = self.state().job_id;
        if job_id.is_none() && self.backend.requires_binding() {
            return Err(TransferError::ExecutorNotBound);
        }

        let lock = self.lock_for(id);
        let outcome = {
            let _guard = lock.lock().await;
            self.execute_locked(job_id, id, display_name, can_skip, work)
                .await
        };
        self.release_lock(id, lock);
        outcome
    }

    /// Check, run and record `id`; the caller holds the id's lock
    async fn execute_locked<T, F, Fut>(
        &self,
        job_id: Option<JobId>,
        id: &str,
        display_name: &str,
        can_skip: bool,
        work: F,
    ) -> Result<std::result::Result<T, ProviderError>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let cached = self.state().results.get(id).cloned();
        if let Some(value) = cached {
            log::debug!("Skipping {} ({}): already imported", id, display_name);
            return Ok(Ok(serde_json::from_value(value)?));
        }

        match work().await {
            Ok(result) => {
                let value = serde_json::to_value(&result)?;
                self.backend.store_result(job_id, id, &value)?;
                self.backend.clear_error(job_id, id)?;

                let mut state = self.state();
                state.results.insert(id.to_string(), value);
                state.errors.remove(id);
                state.recent_errors.remove(id);
                Ok(Ok(result))
            }
            Err(err) => {
                log::warn!("Import of {} ({}) failed: {}", id, display_name, err);
                let detail = ErrorDetail {
                    id: id.to_string(),
                    title: display_name.to_string(),
                    exception: render_chain(&err),
                    can_skip,
                };
                self.backend.store_error(job_id, &detail)?;

                let mut state = self.state();
                state.errors.insert(id.to_string(), detail.clone());
                state.recent_errors.insert(id.to_string(), detail);
                Ok(Err(err))
            }
        }
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Drop the map entry for `id` once no other caller holds or waits on it
    fn release_lock(&self, id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // one reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
    }

    fn state(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sorted(mut errors: Vec<ErrorDetail>) -> Vec<ErrorDetail> {
    errors.sort_by(|a, b| a.id.cmp(&b.id));
    errors
}

fn render_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
