use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::error;

use super::model::{FileDescriptor, JobSource, now_unix_ms};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("unknown task kind: {0}")]
    InvalidKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    ImportFolder,
    ImportFile,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ImportFolder => "import_folder",
            TaskKind::ImportFile => "import_file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "import_folder" => Some(TaskKind::ImportFolder),
            "import_file" => Some(TaskKind::ImportFile),
            _ => None,
        }
    }
}

/// A leased task. It stays invisible to other consumers until it is acked,
/// nacked or its lease runs out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: i64,
    pub kind: TaskKind,
    pub queue: String,
    pub payload: String,
    pub deliveries: u32,
}

impl Task {
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Payload of an `import_folder` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderTask {
    pub job_id: String,
}

/// Payload of an `import_file` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTask {
    pub job_id: String,
    pub source: JobSource,
    pub descriptor: FileDescriptor,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: i64,
    pub leased: i64,
    pub dead: i64,
}

/// Result of handing a task back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nacked {
    Retrying,
    /// The task ran out of deliveries and moved to dead letters.
    Buried,
    /// Another delivery of the task owns it now; nothing was changed.
    LeaseLost,
}

/// Writes that settle a task only apply to the delivery that leased it, so
/// `ack`, `nack` and `bury` take the whole [`Task`] rather than its id.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, kind: TaskKind, payload: &str, queue: &str) -> Result<i64, QueueError>;

    /// Inserts one fan-out group in a single transaction.
    async fn enqueue_batch(
        &self,
        kind: TaskKind,
        payloads: &[String],
        queue: &str,
    ) -> Result<(), QueueError>;

    async fn dequeue(&self, queues: &[&str]) -> Result<Option<Task>, QueueError>;

    /// Deletes the task. Returns `false` when the lease was lost to a later delivery.
    async fn ack(&self, task: &Task) -> Result<bool, QueueError>;

    /// Makes the task visible again after `retry_in`, or buries it once its
    /// deliveries are used up.
    async fn nack(
        &self,
        task: &Task,
        retry_in: Duration,
        reason: &str,
    ) -> Result<Nacked, QueueError>;

    /// Moves the task to dead letters. Returns `false` when the lease was lost.
    async fn bury(&self, task: &Task, reason: &str) -> Result<bool, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}

/// Durable queue in the `task_queue` table with lease-based visibility.
#[derive(Clone)]
pub struct SqliteTaskQueue {
    pool: SqlitePool,
    lease: Duration,
    max_deliveries: u32,
}

impl SqliteTaskQueue {
    pub fn new(pool: SqlitePool, lease: Duration, max_deliveries: u32) -> Self {
        Self {
            pool,
            lease,
            max_deliveries: max_deliveries.max(1),
        }
    }

    pub fn max_deliveries(&self) -> u32 {
        self.max_deliveries
    }

    async fn claim(&self, queues: &[&str], now_ms: i64) -> Result<Option<Task>, QueueError> {
        let lease_until = now_ms.saturating_add(duration_ms(self.lease));
        let mut builder = QueryBuilder::<Sqlite>::new(
            "UPDATE task_queue SET deliveries = deliveries + 1, available_at_ms = ",
        );
        builder.push_bind(lease_until);
        builder.push(", leased_until_ms = ");
        builder.push_bind(lease_until);
        builder.push(
            " WHERE id = (SELECT id FROM task_queue WHERE dead = 0 AND available_at_ms <= ",
        );
        builder.push_bind(now_ms);
        builder.push(" AND queue IN (");
        let mut names = builder.separated(", ");
        for queue in queues {
            names.push_bind(queue.to_string());
        }
        names.push_unseparated(") ORDER BY available_at_ms ASC, id ASC LIMIT 1)");
        builder.push(" RETURNING id, kind, queue, payload, deliveries");

        let row = builder.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(task_from_row).transpose()
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, kind: TaskKind, payload: &str, queue: &str) -> Result<i64, QueueError> {
        let result = sqlx::query(
            "INSERT INTO task_queue (kind, queue, payload, available_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(kind.as_str())
        .bind(queue)
        .bind(payload)
        .bind(now_unix_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn enqueue_batch(
        &self,
        kind: TaskKind,
        payloads: &[String],
        queue: &str,
    ) -> Result<(), QueueError> {
        if payloads.is_empty() {
            return Ok(());
        }
        let now_ms = now_unix_ms();
        let mut tx = self.pool.begin().await?;
        for payload in payloads {
            sqlx::query(
                "INSERT INTO task_queue (kind, queue, payload, available_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(kind.as_str())
            .bind(queue)
            .bind(payload)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn dequeue(&self, queues: &[&str]) -> Result<Option<Task>, QueueError> {
        if queues.is_empty() {
            return Ok(None);
        }
        loop {
            let Some(task) = self.claim(queues, now_unix_ms()).await? else {
                return Ok(None);
            };
            // Leases that keep expiring mean the task crashes its worker.
            if task.deliveries > self.max_deliveries {
                error!(
                    task_id = task.id,
                    kind = task.kind.as_str(),
                    deliveries = task.deliveries,
                    "task exceeded its delivery limit; moved to dead letters"
                );
                self.bury(&task, "delivery limit exceeded").await?;
                continue;
            }
            return Ok(Some(task));
        }
    }

    async fn ack(&self, task: &Task) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM task_queue WHERE id = ?1 AND deliveries = ?2")
            .bind(task.id)
            .bind(i64::from(task.deliveries))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn nack(
        &self,
        task: &Task,
        retry_in: Duration,
        reason: &str,
    ) -> Result<Nacked, QueueError> {
        if task.deliveries >= self.max_deliveries {
            if !self.bury(task, reason).await? {
                return Ok(Nacked::LeaseLost);
            }
            error!(
                task_id = task.id,
                kind = task.kind.as_str(),
                deliveries = task.deliveries,
                reason,
                "task exhausted its deliveries; moved to dead letters"
            );
            return Ok(Nacked::Buried);
        }
        let result = sqlx::query(
            "UPDATE task_queue
             SET available_at_ms = ?3, leased_until_ms = NULL, last_error = ?4
             WHERE id = ?1 AND deliveries = ?2 AND dead = 0",
        )
        .bind(task.id)
        .bind(i64::from(task.deliveries))
        .bind(now_unix_ms().saturating_add(duration_ms(retry_in)))
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(Nacked::LeaseLost);
        }
        Ok(Nacked::Retrying)
    }

    async fn bury(&self, task: &Task, reason: &str) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE task_queue SET dead = 1, leased_until_ms = NULL, last_error = ?3
             WHERE id = ?1 AND deliveries = ?2 AND dead = 0",
        )
        .bind(task.id)
        .bind(i64::from(task.deliveries))
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN dead = 0 AND available_at_ms <= ?1 THEN 1 ELSE 0 END), 0) AS ready,
                COALESCE(SUM(CASE WHEN dead = 0 AND available_at_ms > ?1 THEN 1 ELSE 0 END), 0) AS leased,
                COALESCE(SUM(dead), 0) AS dead
             FROM task_queue",
        )
        .bind(now_unix_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueDepth {
            ready: row.try_get("ready")?,
            leased: row.try_get("leased")?,
            dead: row.try_get("dead")?,
        })
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task, QueueError> {
    let kind: String = row.try_get("kind")?;
    let deliveries: i64 = row.try_get("deliveries")?;
    Ok(Task {
        id: row.try_get("id")?,
        kind: TaskKind::parse(&kind).ok_or(QueueError::InvalidKind(kind))?,
        queue: row.try_get("queue")?,
        payload: row.try_get("payload")?,
        deliveries: u32::try_from(deliveries).unwrap_or(u32::MAX),
    })
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::testing::memory_store;

    async fn make_queue(lease: Duration, max_deliveries: u32) -> SqliteTaskQueue {
        let store = memory_store().await;
        SqliteTaskQueue::new(store.pool(), lease, max_deliveries)
    }

    #[tokio::test]
    async fn tasks_are_delivered_in_insertion_order() {
        let queue = make_queue(Duration::from_secs(60), 10).await;
        queue
            .enqueue_batch(
                TaskKind::ImportFile,
                &["a".to_string(), "b".to_string()],
                "dropbox",
            )
            .await
            .unwrap();

        let first = queue.dequeue(&["dropbox"]).await.unwrap().unwrap();
        let second = queue.dequeue(&["dropbox"]).await.unwrap().unwrap();
        assert_eq!(first.payload, "a");
        assert_eq!(second.payload, "b");
        assert_eq!(first.deliveries, 1);
        assert!(queue.dequeue(&["dropbox"]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_only_reads_requested_queues() {
        let queue = make_queue(Duration::from_secs(60), 10).await;
        queue
            .enqueue(TaskKind::ImportFolder, "{}", "google_drive")
            .await
            .unwrap();

        assert!(queue.dequeue(&["dropbox"]).await.unwrap().is_none());
        assert!(queue.dequeue(&[]).await.unwrap().is_none());
        let task = queue
            .dequeue(&["dropbox", "google_drive"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.kind, TaskKind::ImportFolder);
        assert_eq!(task.queue, "google_drive");
    }

    #[tokio::test]
    async fn acked_tasks_are_gone() {
        let queue = make_queue(Duration::from_millis(0), 10).await;
        queue.enqueue(TaskKind::ImportFile, "x", "dropbox").await.unwrap();
        let task = queue.dequeue(&["dropbox"]).await.unwrap().unwrap();
        assert!(queue.ack(&task).await.unwrap());

        assert!(queue.dequeue(&["dropbox"]).await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn expired_lease_redelivers_the_task() {
        let queue = make_queue(Duration::from_millis(0), 10).await;
        queue.enqueue(TaskKind::ImportFile, "x", "dropbox").await.unwrap();

        let first = queue.dequeue(&["dropbox"]).await.unwrap().unwrap();
        let again = queue.dequeue(&["dropbox"]).await.unwrap().unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.deliveries, 2);
    }

    #[tokio::test]
    async fn nack_delays_redelivery() {
        let queue = make_queue(Duration::from_secs(60), 10).await;
        queue.enqueue(TaskKind::ImportFile, "x", "dropbox").await.unwrap();
        let task = queue.dequeue(&["dropbox"]).await.unwrap().unwrap();

        assert_eq!(
            queue.nack(&task, Duration::from_secs(60), "db busy").await.unwrap(),
            Nacked::Retrying
        );
        assert!(queue.dequeue(&["dropbox"]).await.unwrap().is_none());
        let depth = queue.depth().await.unwrap();
        assert_eq!((depth.ready, depth.leased, depth.dead), (0, 1, 0));

        assert_eq!(
            queue.nack(&task, Duration::ZERO, "db busy").await.unwrap(),
            Nacked::Retrying
        );
        assert!(queue.dequeue(&["dropbox"]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nack_buries_after_max_deliveries() {
        let queue = make_queue(Duration::from_secs(60), 2).await;
        queue.enqueue(TaskKind::ImportFile, "x", "dropbox").await.unwrap();

        let task = queue.dequeue(&["dropbox"]).await.unwrap().unwrap();
        assert_eq!(
            queue.nack(&task, Duration::ZERO, "first").await.unwrap(),
            Nacked::Retrying
        );
        let task = queue.dequeue(&["dropbox"]).await.unwrap().unwrap();
        assert_eq!(
            queue.nack(&task, Duration::ZERO, "second").await.unwrap(),
            Nacked::Buried
        );

        assert!(queue.dequeue(&["dropbox"]).await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn stale_delivery_cannot_settle_a_reclaimed_task() {
        let queue = make_queue(Duration::from_millis(0), 10).await;
        queue.enqueue(TaskKind::ImportFile, "x", "dropbox").await.unwrap();
        let stale = queue.dequeue(&["dropbox"]).await.unwrap().unwrap();
        let current = queue.dequeue(&["dropbox"]).await.unwrap().unwrap();
        assert_eq!(stale.id, current.id);

        assert!(!queue.ack(&stale).await.unwrap());
        assert_eq!(
            queue.nack(&stale, Duration::ZERO, "late").await.unwrap(),
            Nacked::LeaseLost
        );
        assert!(!queue.bury(&stale, "late").await.unwrap());
        assert_eq!(queue.depth().await.unwrap().dead, 0);

        assert!(queue.ack(&current).await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn repeatedly_expiring_lease_ends_in_dead_letters() {
        let queue = make_queue(Duration::from_millis(0), 2).await;
        queue.enqueue(TaskKind::ImportFile, "x", "dropbox").await.unwrap();

        assert!(queue.dequeue(&["dropbox"]).await.unwrap().is_some());
        assert!(queue.dequeue(&["dropbox"]).await.unwrap().is_some());
        assert!(queue.dequeue(&["dropbox"]).await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn payload_decodes_into_its_task_type() {
        let queue = make_queue(Duration::from_secs(60), 10).await;
        let payload = FolderTask {
            job_id: "job-1".into(),
        };
        queue
            .enqueue(
                TaskKind::ImportFolder,
                &serde_json::to_string(&payload).unwrap(),
                "google_drive",
            )
            .await
            .unwrap();

        let task = queue.dequeue(&["google_drive"]).await.unwrap().unwrap();
        assert_eq!(task.decode::<FolderTask>().unwrap(), payload);
        assert!(matches!(
            task.decode::<FileTask>(),
            Err(QueueError::Payload(_))
        ));
    }
}
