use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::aggregator::CompletionAggregator;
use super::backoff::Backoff;
use super::dispatcher::{ChunkDispatcher, DispatchError};
use super::model::JobSource;
use super::processor::FileProcessor;
use super::queue::{FileTask, FolderTask, Nacked, QueueError, Task, TaskKind, TaskQueue};
use super::store::JobStoreError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub stall_check_interval: Duration,
    /// Spacing of redeliveries after a store error.
    pub redelivery: Backoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            poll_interval: Duration::from_millis(500),
            stall_check_interval: Duration::from_secs(60),
            redelivery: Backoff::new(Duration::from_secs(1), Duration::from_secs(60), true),
        }
    }
}

enum Handled {
    Done,
    Retry(String),
    Poison(String),
}

/// Pulls tasks from every source queue and runs them to an ack or nack.
pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<ChunkDispatcher>,
    processor: Arc<FileProcessor>,
    aggregator: CompletionAggregator,
    config: WorkerConfig,
    queues: Vec<&'static str>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        dispatcher: Arc<ChunkDispatcher>,
        processor: Arc<FileProcessor>,
        aggregator: CompletionAggregator,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            processor,
            aggregator,
            config,
            queues: vec![
                JobSource::DriveFolder.queue_name(),
                JobSource::DropboxFolder.queue_name(),
            ],
        }
    }

    /// Handles at most one task. Returns `false` when no task was ready.
    pub async fn run_once(&self) -> Result<bool, WorkerError> {
        let Some(task) = self.queue.dequeue(&self.queues).await? else {
            return Ok(false);
        };
        debug!(
            task_id = task.id,
            kind = task.kind.as_str(),
            deliveries = task.deliveries,
            "task leased"
        );

        let settled = match self.handle(&task).await {
            Handled::Done => self.queue.ack(&task).await?,
            Handled::Retry(reason) => {
                let retry_in = self
                    .config
                    .redelivery
                    .delay(task.deliveries.saturating_sub(1));
                warn!(
                    task_id = task.id,
                    retry_in_ms = retry_in.as_millis() as u64,
                    reason = %reason,
                    "task will be redelivered"
                );
                self.queue.nack(&task, retry_in, &reason).await? != Nacked::LeaseLost
            }
            Handled::Poison(reason) => {
                error!(
                    task_id = task.id,
                    reason = %reason,
                    "undecodable task moved to dead letters"
                );
                self.queue.bury(&task, &reason).await?
            }
        };
        if !settled {
            warn!(
                task_id = task.id,
                deliveries = task.deliveries,
                "lease expired before the task was settled; left to the newer delivery"
            );
        }
        Ok(true)
    }

    /// Runs tasks until none is ready. Returns how many were handled.
    pub async fn drain(&self) -> Result<usize, WorkerError> {
        let mut handled = 0;
        while self.run_once().await? {
            handled += 1;
        }
        Ok(handled)
    }

    async fn handle(&self, task: &Task) -> Handled {
        match task.kind {
            TaskKind::ImportFolder => {
                let payload: FolderTask = match task.decode() {
                    Ok(payload) => payload,
                    Err(err) => return Handled::Poison(err.to_string()),
                };
                match self.dispatcher.dispatch(&payload.job_id).await {
                    Ok(_) => Handled::Done,
                    Err(DispatchError::Store(JobStoreError::NotFound(job_id))) => {
                        warn!(%job_id, "folder task for unknown job dropped");
                        Handled::Done
                    }
                    Err(err) => Handled::Retry(err.to_string()),
                }
            }
            TaskKind::ImportFile => {
                let payload: FileTask = match task.decode() {
                    Ok(payload) => payload,
                    Err(err) => return Handled::Poison(err.to_string()),
                };
                match self.processor.process(&payload).await {
                    Ok(_) => Handled::Done,
                    Err(err) => Handled::Retry(err.to_string()),
                }
            }
        }
    }

    /// Starts the workers and the stall sweep. Every loop exits once
    /// `shutdown` is cancelled, after finishing the task in hand.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.workers + 1);
        for worker in 0..self.config.workers.max(1) {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker, shutdown).await;
            }));
        }
        let pool = self.clone();
        handles.push(tokio::spawn(async move {
            pool.stall_loop(shutdown).await;
        }));
        info!(workers = self.config.workers.max(1), "worker pool started");
        handles
    }

    async fn worker_loop(&self, worker: usize, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            let idle = match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => self.config.poll_interval,
                Err(err) => {
                    error!(worker, error = %err, "task queue unavailable");
                    self.config.poll_interval.max(Duration::from_secs(1))
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }
        debug!(worker, "worker stopped");
    }

    async fn stall_loop(&self, shutdown: CancellationToken) {
        let period = self.config.stall_check_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.aggregator.sweep_stalled().await {
                        error!(error = %err, "stall sweep failed");
                    }
                }
            }
        }
    }
}
