//! Job state machines
//!
//! `JobState` tracks the overall outcome of a job. `AuthorizationState`
//! tracks the staged credential handoff, and `JobAuthorization` refuses any
//! combination of encrypted fields that does not match its state exactly.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::transfer::error::{Result, TransferError};

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Created, not yet picked up
    New,
    /// A worker is copying data
    InProgress,
    /// Transfer finished ✅
    Complete,
    /// Transfer failed ❌
    Error,
    /// Stopped on request, committed imports kept
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "NEW",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Complete => "COMPLETE",
            JobState::Error => "ERROR",
            JobState::Canceled => "CANCELED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(JobState::New),
            "IN_PROGRESS" => Some(JobState::InProgress),
            "COMPLETE" => Some(JobState::Complete),
            "ERROR" => Some(JobState::Error),
            "CANCELED" => Some(JobState::Canceled),
            _ => None,
        }
    }

    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error | JobState::Canceled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage of the credential handoff between request and worker tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthorizationState {
    /// Credentials are being collected by the request tier
    Initial,
    /// Credentials collected, waiting for a worker to claim the job
    PendingWorkerAssignment,
    /// A worker published its keys; auth data not stored yet
    AssignedWithoutAuthData,
    /// Auth data encrypted for the assigned worker is stored
    AssignedWithAuthData,
}

impl AuthorizationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationState::Initial => "INITIAL",
            AuthorizationState::PendingWorkerAssignment => "PENDING_WORKER_ASSIGNMENT",
            AuthorizationState::AssignedWithoutAuthData => "ASSIGNED_WITHOUT_AUTH_DATA",
            AuthorizationState::AssignedWithAuthData => "ASSIGNED_WITH_AUTH_DATA",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INITIAL" => Some(AuthorizationState::Initial),
            "PENDING_WORKER_ASSIGNMENT" => Some(AuthorizationState::PendingWorkerAssignment),
            "ASSIGNED_WITHOUT_AUTH_DATA" => Some(AuthorizationState::AssignedWithoutAuthData),
            "ASSIGNED_WITH_AUTH_DATA" => Some(AuthorizationState::AssignedWithAuthData),
            _ => None,
        }
    }

    /// Required presence of each blob, in [`BLOB_FIELDS`] order
    fn required_fields(&self) -> [bool; 5] {
        use AuthorizationState::*;

        // session_key, export_auth_data, import_auth_data, public_key, private_key
        match self {
            Initial | PendingWorkerAssignment => [false, false, false, false, false],
            AssignedWithoutAuthData => [true, false, false, true, true],
            AssignedWithAuthData => [true, true, true, true, true],
        }
    }
}

impl fmt::Display for AuthorizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const BLOB_FIELDS: [&str; 5] = [
    "encrypted_session_key",
    "encrypted_export_auth_data",
    "encrypted_import_auth_data",
    "encrypted_public_key",
    "encrypted_private_key",
];

/// Key material a worker publishes when it claims a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerKeys {
    pub session_key: String,
    pub public_key: String,
    pub private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobAuthorizationRecord {
    state: AuthorizationState,
    #[serde(default)]
    encrypted_export_auth_data: Option<String>,
    #[serde(default)]
    encrypted_import_auth_data: Option<String>,
    #[serde(default)]
    encrypted_session_key: Option<String>,
    #[serde(default)]
    encrypted_public_key: Option<String>,
    #[serde(default)]
    encrypted_private_key: Option<String>,
}

/// Encrypted credential record of one job
///
/// Every constructor, including deserialization, checks that the five
/// blobs are present or absent exactly as `state` requires. A blob counts
/// as present only when it is non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "JobAuthorizationRecord", into = "JobAuthorizationRecord")]
pub struct JobAuthorization {
    state: AuthorizationState,
    encrypted_export_auth_data: Option<String>,
    encrypted_import_auth_data: Option<String>,
    encrypted_session_key: Option<String>,
    encrypted_public_key: Option<String>,
    encrypted_private_key: Option<String>,
}

impl JobAuthorization {
    /// Build and validate a record
    pub fn new(
        state: AuthorizationState,
        encrypted_session_key: Option<String>,
        encrypted_export_auth_data: Option<String>,
        encrypted_import_auth_data: Option<String>,
        encrypted_public_key: Option<String>,
        encrypted_private_key: Option<String>,
    ) -> Result<Self> {
        let auth = Self {
            state,
            encrypted_export_auth_data,
            encrypted_import_auth_data,
            encrypted_session_key,
            encrypted_public_key,
            encrypted_private_key,
        };
        auth.validate()?;
        Ok(auth)
    }

    pub fn initial() -> Self {
        Self::empty(AuthorizationState::Initial)
    }

    pub fn pending_worker_assignment() -> Self {
        Self::empty(AuthorizationState::PendingWorkerAssignment)
    }

    /// Record for a job whose worker has published its keys
    pub fn assigned(keys: WorkerKeys) -> Result<Self> {
        Self::new(
            AuthorizationState::AssignedWithoutAuthData,
            Some(keys.session_key),
            None,
            None,
            Some(keys.public_key),
            Some(keys.private_key),
        )
    }

    /// Next record: the current worker keys plus encrypted auth data
    pub fn with_auth_data(
        &self,
        encrypted_export_auth_data: String,
        encrypted_import_auth_data: String,
    ) -> Result<Self> {
        Self::new(
            AuthorizationState::AssignedWithAuthData,
            self.encrypted_session_key.clone(),
            Some(encrypted_export_auth_data),
            Some(encrypted_import_auth_data),
            self.encrypted_public_key.clone(),
            self.encrypted_private_key.clone(),
        )
    }

    fn empty(state: AuthorizationState) -> Self {
        Self {
            state,
            encrypted_export_auth_data: None,
            encrypted_import_auth_data: None,
            encrypted_session_key: None,
            encrypted_public_key: None,
            encrypted_private_key: None,
        }
    }

    /// Reject any field whose presence disagrees with the state's row
    pub fn validate(&self) -> Result<()> {
        let present = [
            is_set(&self.encrypted_session_key),
            is_set(&self.encrypted_export_auth_data),
            is_set(&self.encrypted_import_auth_data),
            is_set(&self.encrypted_public_key),
            is_set(&self.encrypted_private_key),
        ];

        let required = self.state.required_fields();
        for (i, field) in BLOB_FIELDS.into_iter().enumerate() {
            if present[i] != required[i] {
                return Err(TransferError::InvalidAuthorization {
                    state: self.state,
                    field,
                    expected: if required[i] { "present" } else { "absent" },
                });
            }
        }
        Ok(())
    }

    pub fn state(&self) -> AuthorizationState {
        self.state
    }

    pub fn encrypted_export_auth_data(&self) -> Option<&str> {
        self.encrypted_export_auth_data.as_deref()
    }

    pub fn encrypted_import_auth_data(&self) -> Option<&str> {
        self.encrypted_import_auth_data.as_deref()
    }

    pub fn encrypted_session_key(&self) -> Option<&str> {
        self.encrypted_session_key.as_deref()
    }

    pub fn encrypted_public_key(&self) -> Option<&str> {
        self.encrypted_public_key.as_deref()
    }

    pub fn encrypted_private_key(&self) -> Option<&str> {
        self.encrypted_private_key.as_deref()
    }
}

impl Default for JobAuthorization {
    fn default() -> Self {
        Self::initial()
    }
}

impl TryFrom<JobAuthorizationRecord> for JobAuthorization {
    type Error = TransferError;

    fn try_from(record: JobAuthorizationRecord) -> Result<Self> {
        Self::new(
            record.state,
            record.encrypted_session_key,
            record.encrypted_export_auth_data,
            record.encrypted_import_auth_data,
            record.encrypted_public_key,
            record.encrypted_private_key,
        )
    }
}

impl From<JobAuthorization> for JobAuthorizationRecord {
    fn from(auth: JobAuthorization) -> Self {
        Self {
            state: auth.state,
            encrypted_export_auth_data: auth.encrypted_export_auth_data,
            encrypted_import_auth_data: auth.encrypted_import_auth_data,
            encrypted_session_key: auth.encrypted_session_key,
            encrypted_public_key: auth.encrypted_public_key,
            encrypted_private_key: auth.encrypted_private_key,
        }
    }
}

fn is_set(field: &Option<String>) -> bool {
    field.as_deref().map_or(false, |s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> WorkerKeys {
        WorkerKeys {
            session_key: "session".to_string(),
            public_key: "public".to_string(),
            private_key: "private".to_string(),
        }
    }

    fn blob(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    // ===== State Property Tests =====

    #[test]
    fn test_terminal_job_states() {
        assert!(JobState::Complete.is_terminal());
        assert!(JobState::Error.is_terminal());
        assert!(JobState::Canceled.is_terminal());

        assert!(!JobState::New.is_terminal());
        assert!(!JobState::InProgress.is_terminal());
    }

    #[test]
    fn test_state_to_string_roundtrip() {
        let states = vec![
            AuthorizationState::Initial,
            AuthorizationState::PendingWorkerAssignment,
            AuthorizationState::AssignedWithoutAuthData,
            AuthorizationState::AssignedWithAuthData,
        ];

        for state in states {
            assert_eq!(AuthorizationState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(JobState::from_str("IN_PROGRESS"), Some(JobState::InProgress));
    }

    #[test]
    fn test_invalid_state_string() {
        assert!(AuthorizationState::from_str("initial").is_none());
        assert!(AuthorizationState::from_str("").is_none());
        assert!(JobState::from_str("DONE").is_none());
    }

    // ===== Field/State Validation =====

    #[test]
    fn test_initial_with_any_blob_fails() {
        for i in 0..5 {
            let mut fields: [Option<String>; 5] = Default::default();
            fields[i] = blob("x");
            let [session, export, import, public, private] = fields;
            let result = JobAuthorization::new(
                AuthorizationState::Initial,
                session,
                export,
                import,
                public,
                private,
            );
            assert!(result.is_err(), "blob {} should be rejected", BLOB_FIELDS[i]);
        }
    }

    #[test]
    fn test_assigned_with_auth_data_missing_import_fails() {
        let result = JobAuthorization::new(
            AuthorizationState::AssignedWithAuthData,
            blob("session"),
            blob("export"),
            None,
            blob("public"),
            blob("private"),
        );

        match result {
            Err(TransferError::InvalidAuthorization { field, expected, .. }) => {
                assert_eq!(field, "encrypted_import_auth_data");
                assert_eq!(expected, "present");
            }
            other => panic!("expected InvalidAuthorization, got {:?}", other),
        }
    }

    #[test]
    fn test_assigned_without_auth_data_succeeds() {
        let auth = JobAuthorization::new(
            AuthorizationState::AssignedWithoutAuthData,
            blob("session"),
            None,
            None,
            blob("public"),
            blob("private"),
        )
        .unwrap();
        assert_eq!(auth.state(), AuthorizationState::AssignedWithoutAuthData);
        assert_eq!(auth.encrypted_public_key(), Some("public"));
    }

    #[test]
    fn test_assigned_without_auth_data_rejects_auth_blob() {
        let result = JobAuthorization::new(
            AuthorizationState::AssignedWithoutAuthData,
            blob("session"),
            blob("export"),
            None,
            blob("public"),
            blob("private"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_session_key_without_keypair_fails() {
        let result = JobAuthorization::new(
            AuthorizationState::AssignedWithoutAuthData,
            blob("session"),
            None,
            None,
            None,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_string_counts_as_absent() {
        let auth = JobAuthorization::new(
            AuthorizationState::PendingWorkerAssignment,
            Some(String::new()),
            None,
            None,
            None,
            None,
        );
        assert!(auth.is_ok());

        let result = JobAuthorization::new(
            AuthorizationState::AssignedWithoutAuthData,
            blob("session"),
            None,
            None,
            Some(String::new()),
            blob("private"),
        );
        assert!(result.is_err());
    }

    // ===== Happy Path =====

    #[test]
    fn test_forward_handoff() {
        let initial = JobAuthorization::initial();
        assert_eq!(initial.state(), AuthorizationState::Initial);

        let pending = JobAuthorization::pending_worker_assignment();
        assert!(pending.validate().is_ok());

        let assigned = JobAuthorization::assigned(keys()).unwrap();
        let stored = assigned
            .with_auth_data("export".to_string(), "import".to_string())
            .unwrap();
        assert_eq!(stored.state(), AuthorizationState::AssignedWithAuthData);
        assert_eq!(stored.encrypted_session_key(), Some("session"));
        assert_eq!(stored.encrypted_import_auth_data(), Some("import"));
    }

    #[test]
    fn test_with_auth_data_requires_keys() {
        let pending = JobAuthorization::pending_worker_assignment();
        assert!(pending
            .with_auth_data("export".to_string(), "import".to_string())
            .is_err());
    }

    // ===== Serialization =====

    #[test]
    fn test_deserialize_validates() {
        let bad = r#"{"state":"INITIAL","encrypted_session_key":"leaked"}"#;
        assert!(serde_json::from_str::<JobAuthorization>(bad).is_err());

        let good = r#"{"state":"PENDING_WORKER_ASSIGNMENT"}"#;
        let auth: JobAuthorization = serde_json::from_str(good).unwrap();
        assert_eq!(auth.state(), AuthorizationState::PendingWorkerAssignment);
    }

    #[test]
    fn test_json_roundtrip() {
        let auth = JobAuthorization::assigned(keys()).unwrap();
        let json = serde_json::to_string(&auth).unwrap();
        assert!(json.contains("\"state\":\"ASSIGNED_WITHOUT_AUTH_DATA\""));
        let parsed: JobAuthorization = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, auth);
    }
}
