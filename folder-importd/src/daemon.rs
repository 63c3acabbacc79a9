use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use folder_import_core::{DropboxClient, GoogleDriveClient, StorageClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::http_api;
use crate::import::aggregator::CompletionAggregator;
use crate::import::backoff::Backoff;
use crate::import::dispatcher::ChunkDispatcher;
use crate::import::processor::{FileProcessor, TransferLimits};
use crate::import::queue::{SqliteTaskQueue, TaskQueue};
use crate::import::retry::RetryPolicy;
use crate::import::service::ImportService;
use crate::import::sources::{DriveSource, DropboxSource, SourceRegistry, StorageDestination};
use crate::import::store::JobStore;
use crate::import::worker::{WorkerConfig, WorkerPool};

const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_CHUNK_SIZE: u64 = 100;
const DEFAULT_WORKERS: u64 = 8;
const DEFAULT_MAX_ATTEMPTS: u64 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_MS: u64 = 10_000;
const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TASK_LEASE_SECS: u64 = 300;
const DEFAULT_MAX_DELIVERIES: u64 = 10;
const DEFAULT_POLL_MS: u64 = 500;
const DEFAULT_STALL_CHECK_SECS: u64 = 60;
const DEFAULT_DOWNLOAD_CONCURRENCY: u64 = 4;
const DEFAULT_UPLOAD_CONCURRENCY: u64 = 2;
const DEFAULT_BUCKET: &str = "images";
const REDELIVERY_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    All,
    ApiOnly,
    WorkerOnly,
}

impl RunMode {
    pub fn serves_api(self) -> bool {
        matches!(self, RunMode::All | RunMode::ApiOnly)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, RunMode::All | RunMode::WorkerOnly)
    }
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// `None` selects `<data_dir>/folder-import/import.db`.
    pub database_url: Option<String>,
    pub bind: SocketAddr,
    pub chunk_size: usize,
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub retry_jitter: bool,
    pub operation_timeout: Duration,
    pub task_lease: Duration,
    pub max_deliveries: u32,
    pub poll_interval: Duration,
    pub stall_check_interval: Duration,
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
    pub google_api_key: String,
    pub dropbox_token: String,
    pub supabase_url: String,
    pub supabase_service_key: String,
    pub storage_bucket: String,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind = read_string(&lookup, "FOLDER_IMPORT_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid FOLDER_IMPORT_BIND address {bind:?}"))?;

        Ok(Self {
            database_url: read_string(&lookup, "FOLDER_IMPORT_DATABASE_URL"),
            bind,
            chunk_size: read_u64(&lookup, "FOLDER_IMPORT_CHUNK_SIZE", DEFAULT_CHUNK_SIZE) as usize,
            workers: read_u64(&lookup, "FOLDER_IMPORT_WORKERS", DEFAULT_WORKERS) as usize,
            max_attempts: read_u32(&lookup, "FOLDER_IMPORT_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
            retry_base: Duration::from_millis(read_u64(
                &lookup,
                "FOLDER_IMPORT_RETRY_BASE_MS",
                DEFAULT_RETRY_BASE_MS,
            )),
            retry_max: Duration::from_millis(read_u64(
                &lookup,
                "FOLDER_IMPORT_RETRY_MAX_MS",
                DEFAULT_RETRY_MAX_MS,
            )),
            retry_jitter: read_bool(&lookup, "FOLDER_IMPORT_RETRY_JITTER", false),
            operation_timeout: Duration::from_secs(read_u64(
                &lookup,
                "FOLDER_IMPORT_OPERATION_TIMEOUT_SECS",
                DEFAULT_OPERATION_TIMEOUT_SECS,
            )),
            task_lease: Duration::from_secs(read_u64(
                &lookup,
                "FOLDER_IMPORT_TASK_LEASE_SECS",
                DEFAULT_TASK_LEASE_SECS,
            )),
            max_deliveries: read_u32(
                &lookup,
                "FOLDER_IMPORT_MAX_DELIVERIES",
                DEFAULT_MAX_DELIVERIES,
            ),
            poll_interval: Duration::from_millis(read_u64(
                &lookup,
                "FOLDER_IMPORT_POLL_MS",
                DEFAULT_POLL_MS,
            )),
            stall_check_interval: Duration::from_secs(read_u64(
                &lookup,
                "FOLDER_IMPORT_STALL_CHECK_SECS",
                DEFAULT_STALL_CHECK_SECS,
            )),
            download_concurrency: read_u64(
                &lookup,
                "FOLDER_IMPORT_DOWNLOAD_CONCURRENCY",
                DEFAULT_DOWNLOAD_CONCURRENCY,
            ) as usize,
            upload_concurrency: read_u64(
                &lookup,
                "FOLDER_IMPORT_UPLOAD_CONCURRENCY",
                DEFAULT_UPLOAD_CONCURRENCY,
            ) as usize,
            google_api_key: read_string(&lookup, "FOLDER_IMPORT_GOOGLE_API_KEY").unwrap_or_default(),
            dropbox_token: read_string(&lookup, "FOLDER_IMPORT_DROPBOX_TOKEN").unwrap_or_default(),
            supabase_url: read_string(&lookup, "FOLDER_IMPORT_SUPABASE_URL").unwrap_or_default(),
            supabase_service_key: read_string(&lookup, "FOLDER_IMPORT_SUPABASE_SERVICE_KEY")
                .unwrap_or_default(),
            storage_bucket: read_string(&lookup, "FOLDER_IMPORT_STORAGE_BUCKET")
                .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Backoff::new(self.retry_base, self.retry_max, self.retry_jitter),
            self.operation_timeout,
        )
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.workers,
            poll_interval: self.poll_interval,
            stall_check_interval: self.stall_check_interval,
            redelivery: Backoff::new(self.retry_base, REDELIVERY_CAP, true),
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    mode: RunMode,
    service: ImportService,
    workers: Option<Arc<WorkerPool>>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig, mode: RunMode) -> anyhow::Result<Self> {
        let store = match &config.database_url {
            Some(url) => JobStore::new(url).await,
            None => JobStore::new_default().await,
        }
        .context("failed to initialize job store")?;
        let queue: Arc<dyn TaskQueue> = Arc::new(SqliteTaskQueue::new(
            store.pool(),
            config.task_lease,
            config.max_deliveries,
        ));

        let workers = if mode.runs_workers() {
            Some(Arc::new(build_worker_pool(&config, &store, &queue)?))
        } else {
            None
        };
        let service = ImportService::new(store, queue);

        Ok(Self {
            config,
            mode,
            service,
            workers,
        })
    }

    pub fn service(&self) -> &ImportService {
        &self.service
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            mode = ?self.mode,
            workers = self.config.workers,
            chunk_size = self.config.chunk_size,
            "folder-importd started"
        );

        let shutdown = CancellationToken::new();
        let handles = match &self.workers {
            Some(pool) => Arc::clone(pool).spawn(shutdown.clone()),
            None => Vec::new(),
        };

        if self.mode.serves_api() {
            let listener = tokio::net::TcpListener::bind(self.config.bind)
                .await
                .with_context(|| format!("failed to bind {}", self.config.bind))?;
            info!(bind = %self.config.bind, "http api listening");
            let server_shutdown = shutdown.clone();
            axum::serve(listener, http_api::router(self.service.clone()))
                .with_graceful_shutdown(async move {
                    wait_for_shutdown_signal().await;
                    server_shutdown.cancel();
                })
                .await
                .context("http server failed")?;
        } else {
            wait_for_shutdown_signal().await;
        }

        shutdown.cancel();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
        info!("folder-importd stopped");
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
