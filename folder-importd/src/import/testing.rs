//! Fakes and fixtures shared by the engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use folder_import_core::{StoredObject, unique_object_path};

use super::aggregator::CompletionAggregator;
use super::backoff::Backoff;
use super::dispatcher::ChunkDispatcher;
use super::model::{FileDescriptor, Job, JobSource, Locator};
use super::processor::{FileProcessor, TransferLimits};
use super::queue::{FileTask, SqliteTaskQueue, TaskQueue};
use super::retry::RetryPolicy;
use super::sources::{
    DestinationClient, ListingPage, SourceClient, SourceError, SourceRegistry, StorageError,
};
use super::store::JobStore;

pub async fn memory_store() -> JobStore {
    JobStore::new("sqlite::memory:").await.unwrap()
}

pub fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Backoff::new(Duration::from_millis(1), Duration::from_millis(2), false),
        Duration::from_secs(5),
    )
}

pub fn image_descriptors(count: usize) -> Vec<FileDescriptor> {
    (0..count)
        .map(|i| FileDescriptor {
            native_id: format!("file-{i}"),
            name: format!("file-{i}.png"),
            mime_type: "image/png".into(),
            size: 100 + i as i64,
            locator: Locator::Drive {
                file_id: format!("file-{i}"),
            },
        })
        .collect()
}

pub fn file_task(job: &Job, descriptor: FileDescriptor) -> FileTask {
    FileTask {
        job_id: job.id.clone(),
        source: job.source,
        descriptor,
    }
}

#[derive(Debug, Clone, Copy)]
enum Script {
    Transient(u32),
    Missing,
}

type ListingError = Box<dyn Fn() -> SourceError + Send + Sync>;

/// In-memory source with scripted listing and download failures.
pub struct FakeSource {
    files: Vec<FileDescriptor>,
    page_size: usize,
    page_delay: Duration,
    flaky_pages: Mutex<HashMap<usize, u32>>,
    listing_error: Option<ListingError>,
    scripts: Mutex<HashMap<String, Script>>,
    list_calls: AtomicUsize,
    downloads: Mutex<HashMap<String, usize>>,
}

impl FakeSource {
    pub fn listing(files: Vec<FileDescriptor>) -> Self {
        Self {
            files,
            page_size: usize::MAX,
            page_delay: Duration::ZERO,
            flaky_pages: Mutex::new(HashMap::new()),
            listing_error: None,
            scripts: Mutex::new(HashMap::new()),
            list_calls: AtomicUsize::new(0),
            downloads: Mutex::new(HashMap::new()),
        }
    }

    pub fn empty() -> Self {
        Self::listing(Vec::new())
    }

    pub fn failing_listing(error: impl Fn() -> SourceError + Send + Sync + 'static) -> Self {
        Self {
            listing_error: Some(Box::new(error)),
            ..Self::empty()
        }
    }

    /// Serves the listing `page_size` files at a time, each page taking `delay`.
    pub fn paged(mut self, page_size: usize, delay: Duration) -> Self {
        self.page_size = page_size.max(1);
        self.page_delay = delay;
        self
    }

    /// The next `times` fetches of page `index` (zero based) fail with a network error.
    pub fn flaky_page(self, index: usize, times: u32) -> Self {
        self.flaky_pages.lock().unwrap().insert(index, times);
        self
    }

    /// The next `times` downloads of `native_id` fail with a network error.
    pub fn fail_download(self, native_id: &str, times: u32) -> Self {
        self.script(native_id, Script::Transient(times))
    }

    pub fn missing_file(self, native_id: &str) -> Self {
        self.script(native_id, Script::Missing)
    }

    fn script(self, native_id: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(native_id.to_string(), script);
        self
    }

    /// Listing pages requested, failed attempts included.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self, native_id: &str) -> usize {
        self.downloads
            .lock()
            .unwrap()
            .get(native_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn list_page(
        &self,
        _folder_ref: &str,
        cursor: Option<&str>,
    ) -> Result<ListingPage, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.listing_error {
            return Err(error());
        }
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }

        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let index = start / self.page_size;
        if let Some(remaining) = self.flaky_pages.lock().unwrap().get_mut(&index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SourceError::Network(format!("page {index} reset")));
            }
        }
        let end = start.saturating_add(self.page_size).min(self.files.len());
        Ok(ListingPage {
            files: self.files[start..end].to_vec(),
            next: (end < self.files.len()).then(|| end.to_string()),
        })
    }

    async fn download(&self, descriptor: &FileDescriptor) -> Result<Bytes, SourceError> {
        let id = descriptor.native_id.clone();
        *self.downloads.lock().unwrap().entry(id.clone()).or_default() += 1;

        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&id) {
            Some(Script::Transient(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(SourceError::Network(format!("connection reset on {id}")))
            }
            Some(Script::Missing) => Err(SourceError::NotFound(id)),
            _ => Ok(Bytes::from(format!("content of {id}"))),
        }
    }
}

/// Destination that remembers uploads and can fail them transiently.
#[derive(Default)]
pub struct FakeDestination {
    failures: Mutex<HashMap<String, u32>>,
    uploads: Mutex<Vec<String>>,
}

impl FakeDestination {
    /// The next `times` uploads named `name` fail as if storage were down.
    pub fn fail_upload(self, name: &str, times: u32) -> Self {
        self.failures.lock().unwrap().insert(name.to_string(), times);
        self
    }

    pub fn upload_calls(&self, name: &str) -> usize {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|uploaded| uploaded.as_str() == name)
            .count()
    }

    pub fn total_uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl DestinationClient for FakeDestination {
    async fn upload(
        &self,
        _content: Bytes,
        name: &str,
        _mime_type: &str,
        folder_hint: &str,
    ) -> Result<StoredObject, StorageError> {
        self.uploads.lock().unwrap().push(name.to_string());
        if let Some(remaining) = self.failures.lock().unwrap().get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Unavailable("502 bad gateway".into()));
            }
        }
        let storage_path = unique_object_path(Some(folder_hint), name);
        Ok(StoredObject {
            storage_url: format!("https://storage.test/{storage_path}"),
            storage_path,
        })
    }
}

/// One store, queue and set of fakes wired the way the daemon wires them.
pub struct Harness {
    pub store: JobStore,
    pub queue: Arc<SqliteTaskQueue>,
    pub drive: Arc<FakeSource>,
    pub dropbox: Arc<FakeSource>,
    pub destination: Arc<FakeDestination>,
}

impl Harness {
    pub async fn new(drive: FakeSource, dropbox: FakeSource) -> Self {
        Self::with_destination(drive, dropbox, FakeDestination::default()).await
    }

    pub async fn with_destination(
        drive: FakeSource,
        dropbox: FakeSource,
        destination: FakeDestination,
    ) -> Self {
        let store = memory_store().await;
        let queue = Arc::new(SqliteTaskQueue::new(
            store.pool(),
            Duration::from_secs(60),
            10,
        ));
        Self {
            store,
            queue,
            drive: Arc::new(drive),
            dropbox: Arc::new(dropbox),
            destination: Arc::new(destination),
        }
    }

    pub fn task_queue(&self) -> Arc<dyn TaskQueue> {
        self.queue.clone()
    }

    pub fn registry(&self) -> SourceRegistry {
        SourceRegistry::new(self.drive.clone(), self.dropbox.clone())
    }

    pub fn aggregator(&self) -> CompletionAggregator {
        CompletionAggregator::new(self.store.clone())
    }

    pub fn dispatcher(&self, chunk_size: usize) -> ChunkDispatcher {
        self.dispatcher_with_retry(chunk_size, quick_retry(3))
    }

    pub fn dispatcher_with_retry(&self, chunk_size: usize, retry: RetryPolicy) -> ChunkDispatcher {
        ChunkDispatcher::new(
            self.store.clone(),
            self.task_queue(),
            self.registry(),
            self.aggregator(),
            retry,
            chunk_size,
        )
    }

    pub fn processor(&self) -> FileProcessor {
        FileProcessor::new(
            self.store.clone(),
            self.registry(),
            self.destination.clone(),
            self.aggregator(),
            quick_retry(3),
            TransferLimits::default(),
        )
    }

    pub async fn pending_job(&self, source: JobSource) -> Job {
        let url = match source {
            JobSource::DriveFolder => "https://drive.google.com/drive/folders/folder-1",
            JobSource::DropboxFolder => "https://www.dropbox.com/sh/abc/def?dl=1",
        };
        let job = Job::new(source, url);
        self.store.create(&job).await.unwrap();
        job
    }

    pub async fn processing_job(&self, source: JobSource, total: i64) -> Job {
        let job = self.pending_job(source).await;
        self.store.set_total(&job.id, total).await.unwrap();
        self.store.get(&job.id).await.unwrap()
    }
}
