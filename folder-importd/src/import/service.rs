use std::sync::Arc;

use folder_import_core::links::{LinkError, drive_folder_id, normalize_dropbox_link};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use super::aggregator::stall_cutoff;
use super::model::{FileRecord, Job, JobSource, JobStatus, now_unix};
use super::queue::{FolderTask, QueueDepth, QueueError, TaskKind, TaskQueue};
use super::store::{JobStore, JobStoreError};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    InvalidLink(#[from] LinkError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("could not encode folder task: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImagePage {
    pub items: Vec<FileRecord>,
    pub total: i64,
    pub page: u32,
    pub pages: i64,
    pub limit: u32,
}

/// Number of pages of `limit` items needed for `total` records.
pub fn page_count(total: i64, limit: u32) -> i64 {
    if total <= 0 {
        0
    } else {
        (total + i64::from(limit) - 1) / i64::from(limit.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub queue: QueueDepth,
    pub stalled_jobs: usize,
}

/// Entry points used by the HTTP surface.
#[derive(Clone)]
pub struct ImportService {
    store: JobStore,
    queue: Arc<dyn TaskQueue>,
}

impl ImportService {
    pub fn new(store: JobStore, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Validates the folder link, stores a pending job and schedules its
    /// listing on the source's queue.
    pub async fn submit(&self, source: JobSource, folder_url: &str) -> Result<Job, ServiceError> {
        let folder_url = folder_url.trim();
        match source {
            JobSource::DriveFolder => {
                drive_folder_id(folder_url)?;
            }
            JobSource::DropboxFolder => {
                normalize_dropbox_link(folder_url)?;
            }
        }

        let job = Job::new(source, folder_url);
        self.store.create(&job).await?;

        let payload = serde_json::to_string(&FolderTask {
            job_id: job.id.clone(),
        })?;
        if let Err(err) = self
            .queue
            .enqueue(TaskKind::ImportFolder, &payload, source.queue_name())
            .await
        {
            error!(job_id = %job.id, error = %err, "could not schedule import job");
            self.store
                .mark_terminal(&job.id, JobStatus::Failed, Some("could not schedule import"))
                .await?;
            return Err(err.into());
        }

        info!(job_id = %job.id, source = source.as_str(), "import job accepted");
        Ok(job)
    }

    pub async fn job(&self, job_id: &str) -> Result<Job, ServiceError> {
        Ok(self.store.get(job_id).await?)
    }

    /// Lists imported files, newest first. An unknown source name matches nothing.
    pub async fn images(
        &self,
        source: Option<&str>,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<ImagePage, ServiceError> {
        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let filter = match source.filter(|name| !name.is_empty()) {
            None => None,
            Some(name) => match JobSource::parse(name) {
                Some(source) => Some(source),
                None => {
                    return Ok(ImagePage {
                        items: Vec::new(),
                        total: 0,
                        page,
                        pages: 0,
                        limit,
                    });
                }
            },
        };

        let (items, total) = self.store.list_file_records(filter, page, limit).await?;
        Ok(ImagePage {
            items,
            total,
            page,
            pages: page_count(total, limit),
            limit,
        })
    }

    pub async fn image(&self, id: i64) -> Result<Option<FileRecord>, ServiceError> {
        Ok(self.store.get_file_record(id).await?)
    }

    pub async fn health(&self) -> Result<HealthReport, ServiceError> {
        Ok(HealthReport {
            queue: self.queue.depth().await?,
            stalled_jobs: self.store.find_stalled(stall_cutoff(now_unix())).await?.len(),
        })
    }
}
