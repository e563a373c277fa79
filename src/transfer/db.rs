//! Job store
//!
//! Persists portability jobs plus opaque per-job data blobs. The
//! whole-record compare-and-swap (`swap_job`) is the only serialization
//! point between the request tier and the workers.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::transfer::error::{Result, TransferError};
use crate::transfer::job::PortabilityJob;
use crate::transfer::state::AuthorizationState;
use crate::transfer::types::JobId;

/// Storage for jobs and their working data
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job; fails with `JobExists` if the id is taken
    async fn create_job(&self, job: &PortabilityJob) -> Result<()>;

    /// Unconditionally overwrite an existing job
    async fn update_job(&self, job: &PortabilityJob) -> Result<()>;

    /// Replace `current` with `next` only if the stored record still equals
    /// `current` (returns true if applied)
    async fn swap_job(&self, current: &PortabilityJob, next: &PortabilityJob) -> Result<bool>;

    async fn find_job(&self, job_id: JobId) -> Result<Option<PortabilityJob>>;

    /// Remove a job and all of its data; missing jobs are ignored
    async fn remove_job(&self, job_id: JobId) -> Result<()>;

    /// Oldest non-terminal job whose authorization is in `state`
    async fn find_first_job(&self, state: AuthorizationState) -> Result<Option<JobId>>;

    /// Non-terminal jobs held by a worker that was last seen before `deadline`
    async fn find_stale_jobs(&self, deadline: DateTime<Utc>) -> Result<Vec<JobId>>;

    async fn create_data(&self, job_id: JobId, key: &str, data: Vec<u8>) -> Result<()>;

    async fn find_data(&self, job_id: JobId, key: &str) -> Result<Option<Vec<u8>>>;

    async fn update_data(&self, job_id: JobId, key: &str, data: Vec<u8>) -> Result<()>;

    async fn remove_data(&self, job_id: JobId, key: &str) -> Result<()>;

    async fn create_stream(&self, job_id: JobId, key: &str, data: Bytes) -> Result<()>;

    async fn get_stream(&self, job_id: JobId, key: &str) -> Result<Option<Bytes>>;
}

/// Typed JSON helpers over the opaque data blobs
#[async_trait]
pub trait JobStoreExt: JobStore {
    /// Create or replace the blob under `key`
    async fn store_json<T: Serialize + Sync>(&self, job_id: JobId, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        if self.find_data(job_id, key).await?.is_some() {
            self.update_data(job_id, key, bytes).await
        } else {
            self.create_data(job_id, key, bytes).await
        }
    }

    async fn load_json<T: DeserializeOwned + Send>(&self, job_id: JobId, key: &str) -> Result<Option<T>> {
        match self.find_data(job_id, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<S: JobStore + ?Sized> JobStoreExt for S {}

type DataKey = (JobId, String);

fn is_held_and_stale(job: &PortabilityJob, deadline: DateTime<Utc>) -> bool {
    let held = matches!(
        job.authorization_state(),
        AuthorizationState::AssignedWithoutAuthData | AuthorizationState::AssignedWithAuthData
    );
    held && !job.state.is_terminal() && job.last_seen() < deadline
}

#[derive(Default)]
struct MemoryTables {
    jobs: HashMap<JobId, PortabilityJob>,
    data: HashMap<DataKey, Vec<u8>>,
    streams: HashMap<DataKey, Bytes>,
}

/// Job store kept entirely in memory, for tests and single-process runs
#[derive(Default)]
pub struct InMemoryJobStore {
    tables: RwLock<MemoryTables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: &PortabilityJob) -> Result<()> {
        job.job_authorization.validate()?;
        let mut tables = self.tables.write().await;
        if tables.jobs.contains_key(&job.id) {
            return Err(TransferError::JobExists(job.id));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &PortabilityJob) -> Result<()> {
        job.job_authorization.validate()?;
        let mut tables = self.tables.write().await;
        match tables.jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(TransferError::JobNotFound(job.id)),
        }
    }

    async fn swap_job(&self, current: &PortabilityJob, next: &PortabilityJob) -> Result<bool> {
        next.job_authorization.validate()?;
        let mut tables = self.tables.write().await;
        let stored = tables
            .jobs
            .get_mut(&current.id)
            .ok_or(TransferError::JobNotFound(current.id))?;

        if stored != current {
            return Ok(false);
        }
        *stored = next.clone();
        Ok(true)
    }

    async fn find_job(&self, job_id: JobId) -> Result<Option<PortabilityJob>> {
        Ok(self.tables.read().await.jobs.get(&job_id).cloned())
    }

    async fn remove_job(&self, job_id: JobId) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.jobs.remove(&job_id);
        tables.data.retain(|(id, _), _| *id != job_id);
        tables.streams.retain(|(id, _), _| *id != job_id);
        Ok(())
    }

    async fn find_first_job(&self, state: AuthorizationState) -> Result<Option<JobId>> {
        let tables = self.tables.read().await;
        Ok(tables
            .jobs
            .values()
            .filter(|job| job.authorization_state() == state && !job.state.is_terminal())
            .min_by_key(|job| job.created_at)
            .map(|job| job.id))
    }

    async fn find_stale_jobs(&self, deadline: DateTime<Utc>) -> Result<Vec<JobId>> {
        let tables = self.tables.read().await;
        Ok(tables
            .jobs
            .values()
            .filter(|job| is_held_and_stale(job, deadline))
            .map(|job| job.id)
            .collect())
    }

    async fn create_data(&self, job_id: JobId, key: &str, data: Vec<u8>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let key = (job_id, key.to_string());
        if tables.data.contains_key(&key) {
            return Err(TransferError::Store(format!("data {} already exists for job {}", key.1, job_id)));
        }
        tables.data.insert(key, data);
        Ok(())
    }

    async fn find_data(&self, job_id: JobId, key: &str) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read().await;
        Ok(tables.data.get(&(job_id, key.to_string())).cloned())
    }

    async fn update_data(&self, job_id: JobId, key: &str, data: Vec<u8>) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.data.get_mut(&(job_id, key.to_string())) {
            Some(stored) => {
                *stored = data;
                Ok(())
            }
            None => Err(TransferError::Store(format!("no data {} for job {}", key, job_id))),
        }
    }

    async fn remove_data(&self, job_id: JobId, key: &str) -> Result<()> {
        self.tables.write().await.data.remove(&(job_id, key.to_string()));
        Ok(())
    }

    async fn create_stream(&self, job_id: JobId, key: &str, data: Bytes) -> Result<()> {
        self.tables
            .write()
            .await
            .streams
            .insert((job_id, key.to_string()), data);
        Ok(())
    }

    async fn get_stream(&self, job_id: JobId, key: &str) -> Result<Option<Bytes>> {
        let tables = self.tables.read().await;
        Ok(tables.streams.get(&(job_id, key.to_string())).cloned())
    }
}

const JOBS_TREE: &str = "jobs";
const DATA_TREE: &str = "job_data";
const STREAMS_TREE: &str = "job_streams";

/// Job store backed by an embedded sled database
///
/// Conditional updates use sled's compare-and-swap, so concurrent workers
/// in one process race safely on the same job.
pub struct SledJobStore {
    jobs: sled::Tree,
    data: sled::Tree,
    streams: sled::Tree,
}

impl SledJobStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            jobs: db.open_tree(JOBS_TREE)?,
            data: db.open_tree(DATA_TREE)?,
            streams: db.open_tree(STREAMS_TREE)?,
        })
    }

    fn job_key(job_id: JobId) -> String {
        job_id.to_string()
    }

    fn data_key(job_id: JobId, key: &str) -> String {
        format!("{}/{}", job_id, key)
    }

    fn decode(bytes: &[u8]) -> Result<PortabilityJob> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
impl JobStore for SledJobStore {
    async fn create_job(&self, job: &PortabilityJob) -> Result<()> {
        job.job_authorization.validate()?;
        let bytes = serde_json::to_vec(job)?;
        match self
            .jobs
            .compare_and_swap(Self::job_key(job.id), None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(TransferError::JobExists(job.id)),
        }
    }

    async fn update_job(&self, job: &PortabilityJob) -> Result<()> {
        job.job_authorization.validate()?;
        let key = Self::job_key(job.id);
        if !self.jobs.contains_key(&key)? {
            return Err(TransferError::JobNotFound(job.id));
        }
        self.jobs.insert(key, serde_json::to_vec(job)?)?;
        Ok(())
    }

    async fn swap_job(&self, current: &PortabilityJob, next: &PortabilityJob) -> Result<bool> {
        next.job_authorization.validate()?;
        let key = Self::job_key(current.id);
        let bytes = serde_json::to_vec(next)?;

        loop {
            let raw = self
                .jobs
                .get(&key)?
                .ok_or(TransferError::JobNotFound(current.id))?;
            if Self::decode(&raw)? != *current {
                return Ok(false);
            }

            match self
                .jobs
                .compare_and_swap(&key, Some(&raw), Some(bytes.clone()))?
            {
                Ok(()) => return Ok(true),
                Err(_) => continue,
            }
        }
    }

    async fn find_job(&self, job_id: JobId) -> Result<Option<PortabilityJob>> {
        match self.jobs.get(Self::job_key(job_id))? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn remove_job(&self, job_id: JobId) -> Result<()> {
        self.jobs.remove(Self::job_key(job_id))?;
        let prefix = format!("{}/", job_id);
        for tree in [&self.data, &self.streams] {
            for entry in tree.scan_prefix(prefix.as_bytes()) {
                let (key, _) = entry?;
                tree.remove(key)?;
            }
        }
        Ok(())
    }

    async fn find_first_job(&self, state: AuthorizationState) -> Result<Option<JobId>> {
        let mut first: Option<PortabilityJob> = None;
        for entry in self.jobs.iter() {
            let (_, bytes) = entry?;
            let job = Self::decode(&bytes)?;
            if job.authorization_state() != state || job.state.is_terminal() {
                continue;
            }
            if first.as_ref().map_or(true, |f| job.created_at < f.created_at) {
                first = Some(job);
            }
        }
        Ok(first.map(|job| job.id))
    }

    async fn find_stale_jobs(&self, deadline: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut stale = Vec::new();
        for entry in self.jobs.iter() {
            let (_, bytes) = entry?;
            let job = Self::decode(&bytes)?;
            if is_held_and_stale(&job, deadline) {
                stale.push(job.id);
            }
        }
        Ok(stale)
    }

    async fn create_data(&self, job_id: JobId, key: &str, data: Vec<u8>) -> Result<()> {
        match self
            .data
            .compare_and_swap(Self::data_key(job_id, key), None as Option<&[u8]>, Some(data))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(TransferError::Store(format!("data {} already exists for job {}", key, job_id))),
        }
    }

    async fn find_data(&self, job_id: JobId, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .data
            .get(Self::data_key(job_id, key))?
            .map(|v| v.to_vec()))
    }

    async fn update_data(&self, job_id: JobId, key: &str, data: Vec<u8>) -> Result<()> {
        let data_key = Self::data_key(job_id, key);
        if !self.data.contains_key(&data_key)? {
            return Err(TransferError::Store(format!("no data {} for job {}", key, job_id)));
        }
        self.data.insert(data_key, data)?;
        Ok(())
    }

    async fn remove_data(&self, job_id: JobId, key: &str) -> Result<()> {
        self.data.remove(Self::data_key(job_id, key))?;
        Ok(())
    }

    async fn create_stream(&self, job_id: JobId, key: &str, data: Bytes) -> Result<()> {
        self.streams.insert(Self::data_key(job_id, key), data.to_vec())?;
        Ok(())
    }

    async fn get_stream(&self, job_id: JobId, key: &str) -> Result<Option<Bytes>> {
        Ok(self
            .streams
            .get(Self::data_key(job_id, key))?
            .map(|v| Bytes::copy_from_slice(&v)))
    }
}
