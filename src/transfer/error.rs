//! Error types for the transfer engine
//!
//! `ProviderError` is what exporters and importers return; `TransferError`
//! is the crate-wide error surfaced by the executor, the traversal engine,
//! the job store and the worker.

use thiserror::Error;

use crate::transfer::retry::EXPORT_CALL;
use crate::transfer::state::{AuthorizationState, JobState};
use crate::transfer::types::JobId;

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

/// Failure reported by a provider adapter call
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Timeouts, 5xx and other flaky failures
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// 401/403-class failures
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Destination has no room left for the data
    #[error("Destination full: {0}")]
    DestinationFull(String),

    /// Referenced resource does not exist on the provider side
    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    /// Upper bound on attempts this error allows, regardless of strategy
    ///
    /// `None` means the retry strategy decides.
    pub fn attempt_limit(&self) -> Option<u32> {
        match self {
            ProviderError::Transient(_) | ProviderError::Other(_) => None,
            // one credential refresh, then give up
            ProviderError::Unauthorized(_) => Some(2),
            ProviderError::DestinationFull(_) | ProviderError::NotFound(_) => Some(1),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.attempt_limit().map_or(true, |limit| limit > 1)
    }
}

/// Errors that can occur while orchestrating a transfer
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid authorization for state {state}: {field} must be {expected}")]
    InvalidAuthorization {
        state: AuthorizationState,
        field: &'static str,
        expected: &'static str,
    },

    #[error("Job {job_id} is in authorization state {actual}, expected {expected}")]
    UnexpectedAuthorizationState {
        job_id: JobId,
        expected: AuthorizationState,
        actual: AuthorizationState,
    },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {job_id} already finished in state {state}")]
    JobFinished { job_id: JobId, state: JobState },

    #[error("Job {0} is no longer held by this worker")]
    LeaseLost(JobId),

    #[error("Job already exists: {0}")]
    JobExists(JobId),

    #[error("{0} is not a known key")]
    NotCached(String),

    #[error("Executor used before being bound to a job")]
    ExecutorNotBound,

    #[error("No {role} registered for service '{service}' and data type '{data_type}'")]
    UnknownProvider {
        role: &'static str,
        service: String,
        data_type: String,
    },

    #[error("Cannot merge {from} container into {into} container")]
    IncompatibleContainers {
        from: &'static str,
        into: &'static str,
    },

    #[error("Export failed: {0}")]
    Export(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{label} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("Job {0} was canceled")]
    Canceled(JobId),

    #[error("Job {0} timed out waiting for auth data")]
    AuthorizationTimedOut(JobId),

    #[error("Credential error: {0}")]
    Crypto(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl TransferError {
    /// The provider error at the root of this failure, if any
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            TransferError::Provider(e) => Some(e),
            TransferError::RetriesExhausted { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<TransferError> for ProviderError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Provider(e) | TransferError::RetriesExhausted { source: e, .. } => e,
            other => ProviderError::Other(anyhow::Error::new(other)),
        }
    }
}

/// User-visible reason a job ended in the error state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    DestinationFull(String),
    NotFound(String),
    Unauthorized,
    AuthorizationTimedOut,
    ExportFailed,
    ImportFailed,
    Internal,
}

impl FailureReason {
    pub fn from_error(err: &TransferError) -> Self {
        match err.provider_error() {
            Some(ProviderError::DestinationFull(msg)) => FailureReason::DestinationFull(msg.clone()),
            Some(ProviderError::NotFound(msg)) => FailureReason::NotFound(msg.clone()),
            Some(ProviderError::Unauthorized(_)) => FailureReason::Unauthorized,
            Some(_) => match err {
                TransferError::RetriesExhausted { label, .. } if label == EXPORT_CALL => {
                    FailureReason::ExportFailed
                }
                _ => FailureReason::ImportFailed,
            },
            None => match err {
                TransferError::Export(_) => FailureReason::ExportFailed,
                TransferError::AuthorizationTimedOut(_) => FailureReason::AuthorizationTimedOut,
                _ => FailureReason::Internal,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::DestinationFull(_) => "destination_full",
            FailureReason::NotFound(_) => "not_found",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::AuthorizationTimedOut => "authorization_timed_out",
            FailureReason::ExportFailed => "export_failed",
            FailureReason::ImportFailed => "import_failed",
            FailureReason::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::DestinationFull(msg) | FailureReason::NotFound(msg) => {
                write!(f, "{}: {}", self.as_str(), msg)
            }
            _ => write!(f, "{}", self.as_str()),
        }
    }
}
