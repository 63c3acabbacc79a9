use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobSource {
    #[serde(rename = "google_drive")]
    DriveFolder,
    #[serde(rename = "dropbox")]
    DropboxFolder,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::DriveFolder => "google_drive",
            JobSource::DropboxFolder => "dropbox",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "google_drive" => Some(JobSource::DriveFolder),
            "dropbox" => Some(JobSource::DropboxFolder),
            _ => None,
        }
    }

    /// Queue that carries every task belonging to jobs of this source.
    pub fn queue_name(&self) -> &'static str {
        self.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "completed_with_errors" => Some(JobStatus::CompletedWithErrors),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub source: JobSource,
    pub source_url: String,
    pub total_files: i64,
    pub processed_files: i64,
    pub failed_files: i64,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl Job {
    pub fn new(source: JobSource, source_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            source_url: source_url.into(),
            total_files: 0,
            processed_files: 0,
            failed_files: 0,
            status: JobStatus::Pending,
            error_message: None,
            created_at: now_unix(),
            completed_at: None,
        }
    }

    pub fn resolved_files(&self) -> i64 {
        self.processed_files + self.failed_files
    }

    /// Share of successfully imported files, rounded to two decimals.
    pub fn progress_percent(&self) -> f64 {
        if self.total_files <= 0 {
            return 0.0;
        }
        let raw = self.processed_files as f64 / self.total_files as f64 * 100.0;
        (raw * 100.0).round() / 100.0
    }
}

/// Where a file lives in its source, enough to fetch it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
    Drive { file_id: String },
    Dropbox { shared_link: String, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub native_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub locator: Locator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileRecord {
    pub job_id: String,
    pub native_id: String,
    pub source: JobSource,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub storage_path: String,
    pub storage_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub job_id: String,
    pub native_id: String,
    pub source: JobSource,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub storage_path: String,
    pub storage_url: String,
    pub status: String,
    pub created_at: i64,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn now_unix_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn format_unix(ts: i64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
}
