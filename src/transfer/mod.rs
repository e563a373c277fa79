//! Transfer module - main module file
//!
//! Job orchestration for moving a user's data between services: the export
//! traversal engine, the idempotent import executor, the job authorization
//! state machine, and the store, coordinator and worker around them.

pub mod error;
pub mod types;
pub mod resource;
pub mod state;
pub mod job;
pub mod executor;
pub mod retry;
pub mod db;
pub mod adapters;
pub mod registry;
pub mod crypto;
pub mod copier;
pub mod coordinator;
pub mod worker;

// Re-export commonly used types
pub use error::{FailureReason, ProviderError, Result, TransferError};
pub use types::{AuthData, DataType, ErrorDetail, ImportResult, ImportableItem, ItemImportResult, JobId};
pub use resource::{ContainerResource, ContinuationData, ExportInformation, ExportResult, PaginationData};
pub use state::{AuthorizationState, JobAuthorization, JobState, WorkerKeys};
pub use job::PortabilityJob;
pub use executor::{IdempotentImportExecutor, InMemoryBackend, SledExecutorBackend};
pub use retry::RetryStrategy;
pub use db::{InMemoryJobStore, JobStore, JobStoreExt, SledJobStore};
pub use registry::ProviderRegistry;
pub use crypto::{CredentialCipher, KeyMaterialGenerator, PassthroughCipher, RandomKeyGenerator};
pub use copier::{DataCopier, TransferCounts};
pub use coordinator::JobCoordinator;
pub use worker::{JobWorker, WorkerConfig};
