use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::import::model::{FileRecord, Job, JobSource, format_unix};
use crate::import::queue::QueueDepth;
use crate::import::service::{ImportService, ServiceError};
use crate::import::store::JobStoreError;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("{0} not found")]
    NotFound(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self {
            HttpError::NotFound(_)
            | HttpError::Service(ServiceError::Store(JobStoreError::NotFound(_))) => {
                StatusCode::NOT_FOUND
            }
            HttpError::Service(ServiceError::InvalidLink(_)) => StatusCode::BAD_REQUEST,
            HttpError::Service(_) => {
                error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub folder_url: String,
}

#[derive(Debug, Serialize)]
pub struct ImportAccepted {
    pub job_id: String,
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub source: JobSource,
    pub source_url: String,
    pub status: &'static str,
    pub total_files: i64,
    pub processed_files: i64,
    pub failed_files: i64,
    pub progress_percent: f64,
    pub error_message: Option<String>,
    pub created_at: Option<String>,
    pub completed_at: Option<String>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            progress_percent: job.progress_percent(),
            status: job.status.as_str(),
            created_at: format_unix(job.created_at),
            completed_at: job.completed_at.and_then(format_unix),
            job_id: job.id,
            source: job.source,
            source_url: job.source_url,
            total_files: job.total_files,
            processed_files: job.processed_files,
            failed_files: job.failed_files,
            error_message: job.error_message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ImageView {
    pub id: i64,
    pub name: String,
    pub source: JobSource,
    pub native_id: String,
    pub size: i64,
    pub mime_type: String,
    pub storage_path: String,
    pub storage_url: String,
    pub job_id: String,
    pub status: String,
    pub created_at: Option<String>,
}

impl From<FileRecord> for ImageView {
    fn from(record: FileRecord) -> Self {
        Self {
            created_at: format_unix(record.created_at),
            id: record.id,
            name: record.name,
            source: record.source,
            native_id: record.native_id,
            size: record.size,
            mime_type: record.mime_type,
            storage_path: record.storage_path,
            storage_url: record.storage_url,
            job_id: record.job_id,
            status: record.status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ImageList {
    pub images: Vec<ImageView>,
    pub total: i64,
    pub page: u32,
    pub pages: i64,
    pub page_size: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct ImagesQuery {
    pub source: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct HealthView {
    pub status: &'static str,
    pub service: &'static str,
    pub queue: QueueDepth,
    pub stalled_jobs: usize,
}

pub fn router(service: ImportService) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/import/google-drive", post(import_google_drive))
        .route("/import/dropbox", post(import_dropbox))
        .route("/import/jobs/{job_id}", get(job_status))
        .route("/images", get(list_images))
        .route("/images/{id}", get(get_image))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

async fn import_google_drive(
    State(service): State<ImportService>,
    Json(request): Json<ImportRequest>,
) -> Result<(StatusCode, Json<ImportAccepted>), HttpError> {
    submit(&service, JobSource::DriveFolder, &request.folder_url).await
}

async fn import_dropbox(
    State(service): State<ImportService>,
    Json(request): Json<ImportRequest>,
) -> Result<(StatusCode, Json<ImportAccepted>), HttpError> {
    submit(&service, JobSource::DropboxFolder, &request.folder_url).await
}

async fn submit(
    service: &ImportService,
    source: JobSource,
    folder_url: &str,
) -> Result<(StatusCode, Json<ImportAccepted>), HttpError> {
    let job = service.submit(source, folder_url).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ImportAccepted {
            message: format!("Import job created. Track progress at /import/jobs/{}", job.id),
            status: job.status.as_str(),
            job_id: job.id,
        }),
    ))
}

async fn job_status(
    State(service): State<ImportService>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, HttpError> {
    Ok(Json(service.job(&job_id).await?.into()))
}

async fn list_images(
    State(service): State<ImportService>,
    Query(query): Query<ImagesQuery>,
) -> Result<Json<ImageList>, HttpError> {
    let page = service
        .images(query.source.as_deref(), query.page, query.limit)
        .await?;
    Ok(Json(ImageList {
        images: page.items.into_iter().map(ImageView::from).collect(),
        total: page.total,
        page: page.page,
        pages: page.pages,
        page_size: page.limit,
    }))
}

async fn get_image(
    State(service): State<ImportService>,
    Path(id): Path<i64>,
) -> Result<Json<ImageView>, HttpError> {
    match service.image(id).await? {
        Some(record) => Ok(Json(record.into())),
        None => Err(HttpError::NotFound(format!("image {id}"))),
    }
}

async fn health(State(service): State<ImportService>) -> Result<Json<HealthView>, HttpError> {
    let report = service.health().await?;
    Ok(Json(HealthView {
        status: "ok",
        service: "folder-import",
        queue: report.queue,
        stalled_jobs: report.stalled_jobs,
    }))
}
