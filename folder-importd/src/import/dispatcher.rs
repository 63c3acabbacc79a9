use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::aggregator::CompletionAggregator;
use super::model::{FileDescriptor, JobStatus};
use super::queue::{FileTask, QueueError, TaskKind, TaskQueue};
use super::retry::{FileError, RetryPolicy};
use super::sources::{SourceClient, SourceRegistry};
use super::store::{JobStore, JobStoreError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("could not encode file task: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The job left `pending` before this delivery; nothing was listed.
    AlreadyStarted(JobStatus),
    ListingFailed(String),
    Dispatched { total: usize, chunks: Vec<usize> },
}

/// Splits `files` into consecutive chunks of at most `chunk_size`, keeping order.
pub fn chunk_descriptors(
    files: Vec<FileDescriptor>,
    chunk_size: usize,
) -> Vec<Vec<FileDescriptor>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(files.len().div_ceil(chunk_size));
    let mut files = files.into_iter().peekable();
    while files.peek().is_some() {
        chunks.push(files.by_ref().take(chunk_size).collect());
    }
    chunks
}

/// Body of an `import_folder` task: list, fan out, record the total.
pub struct ChunkDispatcher {
    store: JobStore,
    queue: Arc<dyn TaskQueue>,
    sources: SourceRegistry,
    aggregator: CompletionAggregator,
    retry: RetryPolicy,
    chunk_size: usize,
}

impl ChunkDispatcher {
    pub fn new(
        store: JobStore,
        queue: Arc<dyn TaskQueue>,
        sources: SourceRegistry,
        aggregator: CompletionAggregator,
        retry: RetryPolicy,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            queue,
            sources,
            aggregator,
            retry,
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn dispatch(&self, job_id: &str) -> Result<DispatchOutcome, DispatchError> {
        let job = self.store.get(job_id).await?;
        if job.status != JobStatus::Pending {
            info!(job_id, status = job.status.as_str(), "folder task redelivered; skipping");
            return Ok(DispatchOutcome::AlreadyStarted(job.status));
        }

        let source = self.sources.for_source(job.source);
        let listing = self.list_all(source.as_ref(), &job.source_url).await;
        let files = match listing {
            Ok(files) => files,
            Err(err) => {
                let message = format!("could not list folder: {err}");
                warn!(job_id, error = %err, "folder listing failed");
                self.store
                    .mark_terminal(job_id, JobStatus::Failed, Some(&message))
                    .await?;
                return Ok(DispatchOutcome::ListingFailed(message));
            }
        };

        let total = files.len();
        let chunks = chunk_descriptors(files, self.chunk_size);
        let chunk_sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();

        // Tasks go out before the total is recorded. A crash in between leaves
        // the job pending, so the redelivered folder task lists again and the
        // outcome ledgers absorb the duplicate file tasks.
        for chunk in chunks {
            let payloads = chunk
                .into_iter()
                .map(|descriptor| {
                    serde_json::to_string(&FileTask {
                        job_id: job.id.clone(),
                        source: job.source,
                        descriptor,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.queue
                .enqueue_batch(TaskKind::ImportFile, &payloads, job.source.queue_name())
                .await?;
        }

        match self.store.set_total(job_id, total as i64).await {
            Ok(()) => {}
            Err(JobStoreError::InvalidState { status, .. }) => {
                info!(job_id, status = status.as_str(), "job was dispatched concurrently");
                return Ok(DispatchOutcome::AlreadyStarted(status));
            }
            Err(err) => return Err(err.into()),
        }
        info!(
            job_id,
            source = job.source.as_str(),
            total_files = total,
            chunks = chunk_sizes.len(),
            "import job dispatched"
        );

        // Files may all have finished before the total existed; an empty
        // folder finishes here as well.
        self.aggregator.try_complete(job_id).await?;

        Ok(DispatchOutcome::Dispatched {
            total,
            chunks: chunk_sizes,
        })
    }

    /// Fetches the listing page by page; each page gets its own timeout and retries.
    async fn list_all(
        &self,
        source: &dyn SourceClient,
        folder_ref: &str,
    ) -> Result<Vec<FileDescriptor>, FileError> {
        let mut files = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .retry
                .run("list page", || source.list_page(folder_ref, cursor.as_deref()))
                .await?;
            files.extend(page.files);
            match page.next {
                Some(next) => cursor = Some(next),
                None => return Ok(files),
            }
        }
    }
}
