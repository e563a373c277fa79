//! Provider adapter traits
//!
//! Defines the two interfaces every service integration implements.

use async_trait::async_trait;

use crate::transfer::error::ProviderError;
use crate::transfer::executor::IdempotentImportExecutor;
use crate::transfer::resource::{ContainerResource, ExportInformation, ExportResult};
use crate::transfer::types::{AuthData, ImportResult, JobId};

/// Export side of a service
///
/// Called repeatedly by the traversal engine. `export_info` is `None` on
/// the root call; afterwards it carries one descriptor the adapter itself
/// emitted as continuation data.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(
        &self,
        job_id: JobId,
        auth_data: &AuthData,
        export_info: Option<ExportInformation>,
    ) -> Result<ExportResult, ProviderError>;

    /// Get service name for logging
    fn name(&self) -> &str;
}

/// Import side of a service
///
/// Implementations MUST route every side effect through `executor`, keyed
/// by the item's idempotent id, so that a retried call skips items that
/// already made it to the destination.
#[async_trait]
pub trait Importer: Send + Sync {
    async fn import_item(
        &self,
        job_id: JobId,
        executor: &IdempotentImportExecutor,
        auth_data: &AuthData,
        data: ContainerResource,
    ) -> Result<ImportResult, ProviderError>;

    /// Get service name for logging
    fn name(&self) -> &str;
}
