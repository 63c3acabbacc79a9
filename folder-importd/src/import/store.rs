use std::{fs, path::PathBuf, str::FromStr, time::Duration};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::model::{FileRecord, Job, JobSource, JobStatus, NewFileRecord, now_unix};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const STORE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job already exists: {0}")]
    Conflict(String),
    #[error("job {job_id} is {status:?}")]
    InvalidState { job_id: String, status: JobStatus },
    #[error("{0:?} is only written by the completion check")]
    InvalidTransition(JobStatus),
    #[error("invalid stored value: {0}")]
    InvalidColumn(String),
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Processed,
    Failed,
}

impl Counter {
    fn column(self) -> &'static str {
        match self {
            Counter::Processed => "processed_files",
            Counter::Failed => "failed_files",
        }
    }
}

/// Durable job records, their counters and the per-file outcome ledgers.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(STORE_TIMEOUT);
        // Every connection to `:memory:` opens its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let options = if max_connections > 1 {
            options.journal_mode(SqliteJournalMode::Wal)
        } else {
            options
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(STORE_TIMEOUT)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, JobStoreError> {
        let db_path = default_db_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::new(&format!("sqlite://{}", db_path.display())).await
    }

    pub async fn init(&self) -> Result<(), JobStoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "INSERT INTO import_jobs (
                id, source, source_url, total_files, processed_files, failed_files,
                status, error_message, created_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&job.id)
        .bind(job.source.as_str())
        .bind(&job.source_url)
        .bind(job.total_files)
        .bind(job.processed_files)
        .bind(job.failed_files)
        .bind(job.status.as_str())
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(JobStoreError::Conflict(job.id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, job_id: &str) -> Result<Job, JobStoreError> {
        let row = sqlx::query(
            "SELECT id, source, source_url, total_files, processed_files, failed_files,
                    status, error_message, created_at, completed_at
             FROM import_jobs WHERE id = ?1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(JobStoreError::NotFound(job_id.to_string())),
        }
    }

    /// Records the listing result and moves the job from pending to processing.
    pub async fn set_total(&self, job_id: &str, total_files: i64) -> Result<(), JobStoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE import_jobs SET total_files = ?2, status = 'processing'
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(job_id)
        .bind(total_files)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let status = current_status(&mut tx, job_id).await?;
            return Err(match status {
                Some(status) => JobStoreError::InvalidState {
                    job_id: job_id.to_string(),
                    status,
                },
                None => JobStoreError::NotFound(job_id.to_string()),
            });
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn increment_processed(&self, job_id: &str) -> Result<(), JobStoreError> {
        let mut conn = self.pool.acquire().await?;
        bump_counter(&mut conn, job_id, Counter::Processed).await
    }

    pub async fn increment_failed(&self, job_id: &str) -> Result<(), JobStoreError> {
        let mut conn = self.pool.acquire().await?;
        bump_counter(&mut conn, job_id, Counter::Failed).await
    }

    /// Persists a successful import and counts it, once per (job, native id).
    ///
    /// Returns `false` when the file already has an outcome; nothing is
    /// written in that case.
    pub async fn record_success(&self, record: &NewFileRecord) -> Result<bool, JobStoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO file_records (
                name, native_id, source, size, mime_type, storage_path, storage_url,
                job_id, status, created_at
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'completed', ?9
            WHERE NOT EXISTS (
                SELECT 1 FROM file_failures WHERE job_id = ?8 AND native_id = ?2
            )
            ON CONFLICT(job_id, native_id) DO NOTHING",
        )
        .bind(&record.name)
        .bind(&record.native_id)
        .bind(record.source.as_str())
        .bind(record.size)
        .bind(&record.mime_type)
        .bind(&record.storage_path)
        .bind(&record.storage_url)
        .bind(&record.job_id)
        .bind(now_unix())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Ok(false);
        }
        bump_counter(&mut tx, &record.job_id, Counter::Processed).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Counts a failed file, once per (job, native id).
    pub async fn record_failure(
        &self,
        job_id: &str,
        native_id: &str,
        reason: &str,
    ) -> Result<bool, JobStoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO file_failures (job_id, native_id, reason, created_at)
            SELECT ?1, ?2, ?3, ?4
            WHERE NOT EXISTS (
                SELECT 1 FROM file_records WHERE job_id = ?1 AND native_id = ?2
            )
            ON CONFLICT(job_id, native_id) DO NOTHING",
        )
        .bind(job_id)
        .bind(native_id)
        .bind(reason)
        .bind(now_unix())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Ok(false);
        }
        bump_counter(&mut tx, job_id, Counter::Failed).await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn outcome_recorded(
        &self,
        job_id: &str,
        native_id: &str,
    ) -> Result<bool, JobStoreError> {
        let row = sqlx::query(
            "SELECT
                EXISTS (SELECT 1 FROM file_records WHERE job_id = ?1 AND native_id = ?2)
                OR EXISTS (SELECT 1 FROM file_failures WHERE job_id = ?1 AND native_id = ?2)
                AS recorded",
        )
        .bind(job_id)
        .bind(native_id)
        .fetch_one(&self.pool)
        .await?;
        let recorded: i64 = row.try_get("recorded")?;
        Ok(recorded != 0)
    }

    /// Moves a pending or processing job to `failed`.
    ///
    /// Returns `Ok(false)` without writing when the job is already terminal.
    pub async fn mark_terminal(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool, JobStoreError> {
        if status != JobStatus::Failed {
            return Err(JobStoreError::InvalidTransition(status));
        }
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE import_jobs
             SET status = ?2, error_message = COALESCE(?3, error_message), completed_at = ?4
             WHERE id = ?1 AND status IN ('pending', 'processing')",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(now_unix())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 1 {
            tx.commit().await?;
            return Ok(true);
        }
        match current_status(&mut tx, job_id).await? {
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(job_id.to_string())),
        }
    }

    /// Single conditional write that finishes a processing job whose counters
    /// cover its total. At most one caller per job observes `Some`.
    pub async fn complete_if_saturated(
        &self,
        job_id: &str,
        completed_at: i64,
    ) -> Result<Option<JobStatus>, JobStoreError> {
        let row = sqlx::query(
            "UPDATE import_jobs
             SET status = CASE WHEN failed_files = 0 THEN 'completed' ELSE 'completed_with_errors' END,
                 completed_at = ?2
             WHERE id = ?1
               AND status = 'processing'
               AND processed_files + failed_files >= total_files
             RETURNING status",
        )
        .bind(job_id)
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| parse_status(&row.try_get::<String, _>("status")?))
            .transpose()
    }

    /// Processing jobs whose counters are already saturated and whose last
    /// outcome was recorded before `settled_before`.
    pub async fn find_stalled(&self, settled_before: i64) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT id, source, source_url, total_files, processed_files, failed_files,
                    status, error_message, created_at, completed_at
             FROM import_jobs AS j
             WHERE status = 'processing'
               AND processed_files + failed_files >= total_files
               AND COALESCE((SELECT MAX(created_at) FROM file_records WHERE job_id = j.id), 0) < ?1
               AND COALESCE((SELECT MAX(created_at) FROM file_failures WHERE job_id = j.id), 0) < ?1
             ORDER BY created_at ASC",
        )
        .bind(settled_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Newest records first. Returns the page plus the total matching count.
    pub async fn list_file_records(
        &self,
        source: Option<JobSource>,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<FileRecord>, i64), JobStoreError> {
        let source = source.map(|s| s.as_str());
        let limit = i64::from(limit.max(1));
        let offset = i64::from(page.max(1) - 1) * limit;

        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS total FROM file_records WHERE ?1 IS NULL OR source = ?1",
        )
        .bind(source)
        .fetch_one(&self.pool)
        .await?
        .try_get("total")?;

        let rows = sqlx::query(
            "SELECT id, job_id, native_id, source, name, size, mime_type, storage_path,
                    storage_url, status, created_at
             FROM file_records
             WHERE ?1 IS NULL OR source = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
        )
        .bind(source)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((records, total))
    }

    pub async fn get_file_record(&self, id: i64) -> Result<Option<FileRecord>, JobStoreError> {
        let row = sqlx::query(
            "SELECT id, job_id, native_id, source, name, size, mime_type, storage_path,
                    storage_url, status, created_at
             FROM file_records WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }
}

async fn bump_counter(
    conn: &mut SqliteConnection,
    job_id: &str,
    counter: Counter,
) -> Result<(), JobStoreError> {
    let sql = format!(
        "UPDATE import_jobs SET {column} = {column} + 1 WHERE id = ?1",
        column = counter.column()
    );
    let updated = sqlx::query(&sql).bind(job_id).execute(&mut *conn).await?;
    if updated.rows_affected() == 0 {
        return Err(JobStoreError::NotFound(job_id.to_string()));
    }
    Ok(())
}

async fn current_status(
    conn: &mut SqliteConnection,
    job_id: &str,
) -> Result<Option<JobStatus>, JobStoreError> {
    let row = sqlx::query("SELECT status FROM import_jobs WHERE id = ?1")
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|row| parse_status(&row.try_get::<String, _>("status")?))
        .transpose()
}

fn parse_status(value: &str) -> Result<JobStatus, JobStoreError> {
    JobStatus::parse(value).ok_or_else(|| JobStoreError::InvalidColumn(value.to_string()))
}

fn parse_source(value: &str) -> Result<JobSource, JobStoreError> {
    JobSource::parse(value).ok_or_else(|| JobStoreError::InvalidColumn(value.to_string()))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let source: String = row.try_get("source")?;
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: row.try_get("id")?,
        source: parse_source(&source)?,
        source_url: row.try_get("source_url")?,
        total_files: row.try_get("total_files")?,
        processed_files: row.try_get("processed_files")?,
        failed_files: row.try_get("failed_files")?,
        status: parse_status(&status)?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<FileRecord, JobStoreError> {
    let source: String = row.try_get("source")?;
    Ok(FileRecord {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        native_id: row.try_get("native_id")?,
        source: parse_source(&source)?,
        name: row.try_get("name")?,
        size: row.try_get("size")?,
        mime_type: row.try_get("mime_type")?,
        storage_path: row.try_get("storage_path")?,
        storage_url: row.try_get("storage_url")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
    })
}

fn default_db_path() -> Result<PathBuf, JobStoreError> {
    let mut path = dirs::data_dir().ok_or(JobStoreError::MissingDataDir)?;
    path.push("folder-import");
    path.push("import.db");
    Ok(path)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
