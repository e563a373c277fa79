//! Portability job record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transfer::state::{AuthorizationState, JobAuthorization, JobState};
use crate::transfer::types::{DataType, JobId};

/// One transfer request, as persisted in the job store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortabilityJob {
    pub id: JobId,
    pub state: JobState,
    pub export_service: String,
    pub import_service: String,
    pub transfer_data_type: DataType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
    /// Last sign of life from the worker holding the job
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub job_authorization: JobAuthorization,
}

impl PortabilityJob {
    pub fn new(
        export_service: impl Into<String>,
        import_service: impl Into<String>,
        transfer_data_type: DataType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            state: JobState::New,
            export_service: export_service.into(),
            import_service: import_service.into(),
            transfer_data_type,
            created_at: now,
            updated_at: now,
            failure_reason: None,
            heartbeat_at: None,
            job_authorization: JobAuthorization::initial(),
        }
    }

    pub fn authorization_state(&self) -> AuthorizationState {
        self.job_authorization.state()
    }

    /// Copy with a new authorization record and a fresh timestamp
    pub fn with_authorization(&self, job_authorization: JobAuthorization) -> Self {
        Self {
            job_authorization,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Copy with the worker heartbeat set to `at`
    pub fn with_heartbeat(&self, at: DateTime<Utc>) -> Self {
        Self {
            heartbeat_at: Some(at),
            ..self.clone()
        }
    }

    /// When the holding worker was last seen; the last update if it never beat
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.heartbeat_at.unwrap_or(self.updated_at)
    }

    /// Copy in a new lifecycle state
    pub fn with_state(&self, state: JobState, failure_reason: Option<String>) -> Self {
        Self {
            state,
            failure_reason,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::state::WorkerKeys;

    #[test]
    fn test_new_job_defaults() {
        let job = PortabilityJob::new("mock-calendar", "mock-calendar", DataType::Calendar);
        assert_eq!(job.state, JobState::New);
        assert_eq!(job.authorization_state(), AuthorizationState::Initial);
        assert!(job.failure_reason.is_none());
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn test_with_authorization_keeps_identity() {
        let job = PortabilityJob::new("a", "b", DataType::Photos);
        let keys = WorkerKeys {
            session_key: "s".to_string(),
            public_key: "pub".to_string(),
            private_key: "priv".to_string(),
        };
        let next = job.with_authorization(JobAuthorization::assigned(keys).unwrap());

        assert_eq!(next.id, job.id);
        assert_eq!(next.authorization_state(), AuthorizationState::AssignedWithoutAuthData);
        assert!(next.updated_at >= job.updated_at);
    }

    #[test]
    fn test_last_seen_prefers_heartbeat() {
        let job = PortabilityJob::new("a", "b", DataType::Calendar);
        assert_eq!(job.last_seen(), job.updated_at);

        let later = job.updated_at + chrono::Duration::seconds(30);
        let beating = job.with_heartbeat(later);
        assert_eq!(beating.last_seen(), later);
        assert_eq!(beating.updated_at, job.updated_at);
    }

    #[test]
    fn test_job_json_roundtrip() {
        let job = PortabilityJob::new("a", "b", DataType::Calendar)
            .with_state(JobState::Error, Some("destination_full: quota".to_string()));
        let bytes = serde_json::to_vec(&job).unwrap();
        let parsed: PortabilityJob = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, job);
    }
}
