use std::sync::Arc;

use folder_import_core::{StoredObject, is_supported_mime};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::aggregator::CompletionAggregator;
use super::model::{FileDescriptor, NewFileRecord};
use super::queue::FileTask;
use super::retry::{FileError, RetryPolicy};
use super::sources::{DestinationClient, SourceRegistry};
use super::store::{JobStore, JobStoreError};

#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            upload_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Imported,
    Failed(String),
    /// A previous delivery already settled this file.
    AlreadyRecorded,
}

/// Body of an `import_file` task.
pub struct FileProcessor {
    store: JobStore,
    sources: SourceRegistry,
    destination: Arc<dyn DestinationClient>,
    aggregator: CompletionAggregator,
    retry: RetryPolicy,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

impl FileProcessor {
    pub fn new(
        store: JobStore,
        sources: SourceRegistry,
        destination: Arc<dyn DestinationClient>,
        aggregator: CompletionAggregator,
        retry: RetryPolicy,
        limits: TransferLimits,
    ) -> Self {
        Self {
            store,
            sources,
            destination,
            aggregator,
            retry,
            download_limit: Arc::new(Semaphore::new(limits.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(limits.upload_concurrency.max(1))),
        }
    }

    /// Settles one file and then asks the aggregator whether the job is done.
    ///
    /// Store errors propagate so the queue redelivers the task; transfer
    /// errors become a counted failure.
    pub async fn process(&self, task: &FileTask) -> Result<FileOutcome, JobStoreError> {
        let outcome = self.settle(task).await?;
        self.aggregator.try_complete(&task.job_id).await?;
        Ok(outcome)
    }

    async fn settle(&self, task: &FileTask) -> Result<FileOutcome, JobStoreError> {
        let descriptor = &task.descriptor;
        if self
            .store
            .outcome_recorded(&task.job_id, &descriptor.native_id)
            .await?
        {
            debug!(
                job_id = %task.job_id,
                native_id = %descriptor.native_id,
                "file already settled"
            );
            return Ok(FileOutcome::AlreadyRecorded);
        }

        match self.transfer(task).await {
            Ok(stored) => {
                let record = NewFileRecord {
                    job_id: task.job_id.clone(),
                    native_id: descriptor.native_id.clone(),
                    source: task.source,
                    name: descriptor.name.clone(),
                    size: descriptor.size,
                    mime_type: descriptor.mime_type.clone(),
                    storage_path: stored.storage_path,
                    storage_url: stored.storage_url,
                };
                if self.store.record_success(&record).await? {
                    debug!(
                        job_id = %task.job_id,
                        native_id = %descriptor.native_id,
                        storage_path = %record.storage_path,
                        "file imported"
                    );
                    Ok(FileOutcome::Imported)
                } else {
                    Ok(FileOutcome::AlreadyRecorded)
                }
            }
            Err(err) => {
                warn!(
                    job_id = %task.job_id,
                    native_id = %descriptor.native_id,
                    error = %err,
                    "file import failed"
                );
                let reason = err.to_string();
                if self
                    .store
                    .record_failure(&task.job_id, &descriptor.native_id, &reason)
                    .await?
                {
                    Ok(FileOutcome::Failed(reason))
                } else {
                    Ok(FileOutcome::AlreadyRecorded)
                }
            }
        }
    }

    async fn transfer(&self, task: &FileTask) -> Result<StoredObject, FileError> {
        let descriptor = &task.descriptor;
        validate(descriptor)?;
        let source = self.sources.for_source(task.source);

        let content = {
            let _permit = self
                .download_limit
                .acquire()
                .await
                .map_err(|_| FileError::Transient("download limiter closed".into()))?;
            self.retry
                .run("download", || source.download(descriptor))
                .await?
        };

        let folder_hint = format!("{}/{}", task.source.as_str(), task.job_id);
        let _permit = self
            .upload_limit
            .acquire()
            .await
            .map_err(|_| FileError::Transient("upload limiter closed".into()))?;
        self.retry
            .run("upload", || {
                self.destination.upload(
                    content.clone(),
                    &descriptor.name,
                    &descriptor.mime_type,
                    &folder_hint,
                )
            })
            .await
    }
}

fn validate(descriptor: &FileDescriptor) -> Result<(), FileError> {
    if descriptor.native_id.trim().is_empty() || descriptor.name.trim().is_empty() {
        return Err(FileError::Permanent("descriptor has no id or name".into()));
    }
    if !is_supported_mime(&descriptor.mime_type) {
        return Err(FileError::Permanent(format!(
            "unsupported mime type {}",
            descriptor.mime_type
        )));
    }
    Ok(())
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
