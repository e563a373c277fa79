//! Export traversal engine
//!
//! Walks a provider's resource tree breadth-first. The queue starts with
//! one empty descriptor (the root call); every export result may add a
//! next-page descriptor for the same container and one descriptor per child
//! container. Exported data is imported before continuations are queued,
//! so parents always reach the destination before their children are
//! exported.
//!
//! The remaining queue is checkpointed in the job store after every step,
//! so a restarted job picks up where it stopped.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::transfer::adapters::{Exporter, Importer};
use crate::transfer::db::{JobStore, JobStoreExt};
use crate::transfer::error::{ProviderError, Result, TransferError};
use crate::transfer::executor::IdempotentImportExecutor;
use crate::transfer::resource::{
    ContainerResource, DataContainer, ExportInformation, ExportResult, ResultType,
};
use crate::transfer::retry::{retry_call, RetryStrategy, EXPORT_CALL, IMPORT_CALL};
use crate::transfer::types::{AuthData, ErrorDetail, ImportResult, JobId};

/// Job-store data key holding the pending export descriptors
pub const EXPORT_QUEUE_KEY: &str = "export_queue";
/// Job-store data key holding the running import totals
pub const COUNTS_KEY: &str = "counts";

/// Running import totals of one job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCounts {
    pub items: BTreeMap<String, u64>,
    pub bytes: u64,
}

impl TransferCounts {
    fn add(&mut self, result: &ImportResult) {
        for (kind, n) in &result.counts {
            *self.items.entry(kind.clone()).or_insert(0) += n;
        }
        self.bytes += result.bytes.unwrap_or(0);
    }
}

/// Copies one job's data from an exporter into an importer
pub struct DataCopier {
    job_id: JobId,
    exporter: Arc<dyn Exporter>,
    importer: Arc<dyn Importer>,
    executor: Arc<IdempotentImportExecutor>,
    store: Arc<dyn JobStore>,
    retry: RetryStrategy,
    cancel: CancellationToken,
}

impl DataCopier {
    pub fn new(
        job_id: JobId,
        exporter: Arc<dyn Exporter>,
        importer: Arc<dyn Importer>,
        executor: Arc<IdempotentImportExecutor>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            job_id,
            exporter,
            importer,
            executor,
            store,
            retry: RetryStrategy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the traversal to completion
    ///
    /// Returns every unresolved item error. Any export or import failure
    /// aborts the traversal; imports already committed are kept, as is the
    /// checkpoint, so the job can be resumed.
    pub async fn copy(&self, export_auth: &AuthData, import_auth: &AuthData) -> Result<Vec<ErrorDetail>> {
        let saved: Option<VecDeque<ExportInformation>> =
            self.store.load_json(self.job_id, EXPORT_QUEUE_KEY).await?;
        let mut queue = match saved {
            Some(saved) => {
                log::info!(
                    "Job {}: resuming export with {} pending descriptors",
                    self.job_id,
                    saved.len()
                );
                saved
            }
            None => VecDeque::from([ExportInformation::default()]),
        };

        let mut export_calls = 0u64;
        // the front descriptor is only dropped once its data is imported
        while let Some(info) = queue.front().cloned() {
            let result = self.export(export_auth, &info).await?;
            export_calls += 1;

            if result.result_type == ResultType::Error {
                let message = result.error.unwrap_or_else(|| "unknown export error".to_string());
                log::error!("Job {}: export failed: {}", self.job_id, message);
                return Err(TransferError::Export(message));
            }

            if let Some(data) = result.exported_data {
                if !data.is_empty() {
                    self.import(import_auth, data).await?;
                }
            }

            queue.pop_front();
            if let Some(continuation) = result.continuation_data {
                if let Some(next_page) = continuation.pagination_data {
                    queue.push_back(ExportInformation::new(
                        Some(next_page),
                        info.container_resource.clone(),
                    ));
                }
                for child in continuation.container_resources {
                    queue.push_back(ExportInformation::new(None, Some(child)));
                }
            }

            self.store
                .store_json(self.job_id, EXPORT_QUEUE_KEY, &queue)
                .await?;
        }

        self.store.remove_data(self.job_id, EXPORT_QUEUE_KEY).await?;

        let errors = self.executor.get_errors();
        log::info!(
            "Job {}: export finished after {} calls with {} item errors",
            self.job_id,
            export_calls,
            errors.len()
        );
        Ok(errors)
    }

    async fn export(&self, auth: &AuthData, info: &ExportInformation) -> Result<ExportResult> {
        self.check_canceled()?;
        log::debug!("Job {}: exporting {:?}", self.job_id, info);

        let export_info = if info.is_root() { None } else { Some(info.clone()) };
        retry_call(&self.retry, EXPORT_CALL, || {
            self.exporter.export(self.job_id, auth, export_info.clone())
        })
        .await
    }

    async fn import(&self, auth: &AuthData, data: ContainerResource) -> Result<()> {
        self.check_canceled()?;

        let result = retry_call(&self.retry, IMPORT_CALL, || {
            self.importer
                .import_item(self.job_id, &self.executor, auth, data.clone())
        })
        .await?;

        if !result.is_ok() {
            let message = result.error.unwrap_or_else(|| "unknown import error".to_string());
            return Err(ProviderError::Other(anyhow::anyhow!(message)).into());
        }

        let saved: Option<TransferCounts> = self.store.load_json(self.job_id, COUNTS_KEY).await?;
        let mut counts = saved.unwrap_or_default();
        counts.add(&result);
        self.store.store_json(self.job_id, COUNTS_KEY, &counts).await
    }

    fn check_canceled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            log::info!("Job {}: traversal canceled", self.job_id);
            return Err(TransferError::Canceled(self.job_id));
        }
        Ok(())
    }
}
