//! Job Coordinator
//!
//! Request-tier operations on a job. Every step re-reads the job and
//! swaps it only if the stored record is unchanged, so two callers racing
//! on the same job cannot both win and a cancel is never overwritten.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::transfer::copier::{TransferCounts, COUNTS_KEY};
use crate::transfer::crypto::CredentialCipher;
use crate::transfer::db::{JobStore, JobStoreExt};
use crate::transfer::error::{Result, TransferError};
use crate::transfer::job::PortabilityJob;
use crate::transfer::registry::ProviderRegistry;
use crate::transfer::state::{AuthorizationState, JobAuthorization, JobState, WorkerKeys};
use crate::transfer::types::{AuthData, DataType, ErrorDetail, JobId};

/// Job-store data key holding the final error report of a job
pub const ERRORS_KEY: &str = "errors";

/// Job Coordinator - drives jobs through their authorization handoff
pub struct JobCoordinator {
    store: Arc<dyn JobStore>,
    registry: Arc<ProviderRegistry>,
    cipher: Arc<dyn CredentialCipher>,
}

impl JobCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<ProviderRegistry>,
        cipher: Arc<dyn CredentialCipher>,
    ) -> Self {
        Self {
            store,
            registry,
            cipher,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Create a new job in state New with an INITIAL authorization
    pub async fn create_job(
        &self,
        export_service: &str,
        import_service: &str,
        data_type: DataType,
    ) -> Result<JobId> {
        if !self.registry.has_exporter(export_service, data_type) {
            return Err(TransferError::UnknownProvider {
                role: "exporter",
                service: export_service.to_string(),
                data_type: data_type.to_string(),
            });
        }
        if !self.registry.has_importer(import_service, data_type) {
            return Err(TransferError::UnknownProvider {
                role: "importer",
                service: import_service.to_string(),
                data_type: data_type.to_string(),
            });
        }

        let job = PortabilityJob::new(export_service, import_service, data_type);
        self.store.create_job(&job).await?;
        log::info!(
            "Created job: {} ({} -> {}, {})",
            job.id,
            export_service,
            import_service,
            data_type
        );

        Ok(job.id)
    }

    pub async fn get(&self, job_id: JobId) -> Result<PortabilityJob> {
        self.store
            .find_job(job_id)
            .await?
            .ok_or(TransferError::JobNotFound(job_id))
    }

    /// Credentials collected; make the job claimable by a worker
    pub async fn request_worker(&self, job_id: JobId) -> Result<()> {
        self.update(job_id, |job| {
            expect_open(job)?;
            expect_authorization(job, AuthorizationState::Initial)?;
            Ok(Some(job.with_authorization(
                JobAuthorization::pending_worker_assignment(),
            )))
        })
        .await?;
        log::info!("Job {}: waiting for a worker", job_id);
        Ok(())
    }

    /// Publish a worker's keys on the job (returns true if this worker won)
    pub async fn claim_job(&self, job_id: JobId, keys: WorkerKeys) -> Result<bool> {
        let (_, applied) = self
            .update(job_id, |job| {
                if job.state.is_terminal()
                    || job.authorization_state() != AuthorizationState::PendingWorkerAssignment
                {
                    return Ok(None);
                }
                let assigned = JobAuthorization::assigned(keys.clone())?;
                Ok(Some(job.with_authorization(assigned).with_heartbeat(Utc::now())))
            })
            .await?;
        if applied {
            log::info!("Job {}: claimed by worker", job_id);
        }
        Ok(applied)
    }

    /// Encrypt both sides' credentials for the assigned worker
    pub async fn store_auth_data(
        &self,
        job_id: JobId,
        export_auth: &AuthData,
        import_auth: &AuthData,
    ) -> Result<()> {
        let export_json = serde_json::to_string(export_auth)?;
        let import_json = serde_json::to_string(import_auth)?;

        self.update(job_id, |job| {
            expect_open(job)?;
            expect_authorization(job, AuthorizationState::AssignedWithoutAuthData)?;

            // present whenever the state is ASSIGNED_WITHOUT_AUTH_DATA
            let public_key = job
                .job_authorization
                .encrypted_public_key()
                .ok_or_else(|| TransferError::Crypto("assigned job has no public key".to_string()))?;
            let export_blob = self.cipher.encrypt(public_key, &export_json)?;
            let import_blob = self.cipher.encrypt(public_key, &import_json)?;

            let sealed = job
                .job_authorization
                .with_auth_data(export_blob, import_blob)?;
            Ok(Some(job.with_authorization(sealed)))
        })
        .await?;
        log::info!("Job {}: auth data stored", job_id);
        Ok(())
    }

    /// Record that the worker holding `public_key` is still alive
    ///
    /// Returns the stored job; terminal jobs are returned without a beat.
    /// Fails with `LeaseLost` once the job was handed to another worker.
    pub async fn heartbeat(&self, job_id: JobId, public_key: &str) -> Result<PortabilityJob> {
        let (job, _) = self
            .update(job_id, |job| {
                if job.state.is_terminal() {
                    return Ok(None);
                }
                if job.job_authorization.encrypted_public_key() != Some(public_key) {
                    return Err(TransferError::LeaseLost(job_id));
                }
                Ok(Some(job.with_heartbeat(Utc::now())))
            })
            .await?;
        Ok(job)
    }

    /// Put a job whose worker went silent before `deadline` back up for claiming
    ///
    /// The silent worker's keys are dropped with it, so the new worker
    /// waits for the request tier to store auth data again. Checkpointed
    /// export progress and committed imports are kept.
    pub async fn release_stale(&self, job_id: JobId, deadline: DateTime<Utc>) -> Result<bool> {
        let (_, released) = self
            .update(job_id, |job| {
                let held = matches!(
                    job.authorization_state(),
                    AuthorizationState::AssignedWithoutAuthData
                        | AuthorizationState::AssignedWithAuthData
                );
                if !held || job.state.is_terminal() || job.last_seen() >= deadline {
                    return Ok(None);
                }
                Ok(Some(PortabilityJob {
                    heartbeat_at: None,
                    ..job.with_authorization(JobAuthorization::pending_worker_assignment())
                }))
            })
            .await?;
        if released {
            log::warn!("Job {}: worker lease expired, waiting for a new worker", job_id);
        }
        Ok(released)
    }

    /// Request cancellation; terminal jobs are left untouched
    pub async fn cancel_job(&self, job_id: JobId) -> Result<JobState> {
        self.transition(job_id, JobState::Canceled, None).await
    }

    pub async fn mark_in_progress(&self, job_id: JobId) -> Result<JobState> {
        self.transition(job_id, JobState::InProgress, None).await
    }

    pub async fn mark_complete(&self, job_id: JobId) -> Result<JobState> {
        self.transition(job_id, JobState::Complete, None).await
    }

    pub async fn mark_failed(&self, job_id: JobId, reason: &str) -> Result<JobState> {
        self.transition(job_id, JobState::Error, Some(reason.to_string()))
            .await
    }

    /// Item errors persisted when the job finished
    pub async fn errors(&self, job_id: JobId) -> Result<Vec<ErrorDetail>> {
        let errors: Option<Vec<ErrorDetail>> = self.store.load_json(job_id, ERRORS_KEY).await?;
        Ok(errors.unwrap_or_default())
    }

    /// Import totals recorded so far
    pub async fn counts(&self, job_id: JobId) -> Result<TransferCounts> {
        let counts: Option<TransferCounts> = self.store.load_json(job_id, COUNTS_KEY).await?;
        Ok(counts.unwrap_or_default())
    }

    /// Read-modify-write `job_id` until the write lands
    ///
    /// `change` sees the freshly stored job on every attempt and returns
    /// `None` to leave it alone. Returns the job as stored afterwards and
    /// whether it was changed.
    async fn update<F>(&self, job_id: JobId, mut change: F) -> Result<(PortabilityJob, bool)>
    where
        F: FnMut(&PortabilityJob) -> Result<Option<PortabilityJob>> + Send,
    {
        loop {
            let job = self.get(job_id).await?;
            let Some(next) = change(&job)? else {
                return Ok((job, false));
            };
            if self.store.swap_job(&job, &next).await? {
                return Ok((next, true));
            }
            log::debug!("Job {}: changed concurrently, retrying update", job_id);
        }
    }

    async fn transition(
        &self,
        job_id: JobId,
        state: JobState,
        failure_reason: Option<String>,
    ) -> Result<JobState> {
        let mut from = state;
        let (job, applied) = self
            .update(job_id, |job| {
                from = job.state;
                if job.state.is_terminal() {
                    return Ok(None);
                }
                Ok(Some(job.with_state(state, failure_reason.clone())))
            })
            .await?;

        if !applied {
            log::warn!(
                "Job {}: already {}, ignoring transition to {}",
                job_id,
                job.state,
                state
            );
            return Ok(job.state);
        }
        log::info!("Job {}: {} -> {}", job_id, from, state);
        Ok(state)
    }
}

fn expect_open(job: &PortabilityJob) -> Result<()> {
    if job.state.is_terminal() {
        return Err(TransferError::JobFinished {
            job_id: job.id,
            state: job.state,
        });
    }
    Ok(())
}

fn expect_authorization(job: &PortabilityJob, expected: AuthorizationState) -> Result<()> {
    let actual = job.authorization_state();
    if actual != expected {
        return Err(TransferError::UnexpectedAuthorizationState {
            job_id: job.id,
            expected,
            actual,
        });
    }
    Ok(())
}
