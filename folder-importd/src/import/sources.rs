use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use folder_import_core::links::{drive_folder_id, normalize_dropbox_link};
use folder_import_core::{
    ApiError, ApiErrorClass, DropboxClient, GoogleDriveClient, StorageClient, StoredObject,
};
use thiserror::Error;

use super::model::{FileDescriptor, JobSource, Locator};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unreachable: {0}")]
    Network(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid folder reference: {0}")]
    InvalidReference(String),
    #[error("source rejected the request: {0}")]
    Rejected(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Network(_))
    }
}

impl From<ApiError> for SourceError {
    fn from(err: ApiError) -> Self {
        let message = err.to_string();
        match err.classification() {
            ApiErrorClass::Transient | ApiErrorClass::RateLimit => SourceError::Network(message),
            ApiErrorClass::NotFound => SourceError::NotFound(message),
            ApiErrorClass::Auth | ApiErrorClass::Permanent => SourceError::Rejected(message),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage rejected the upload: {0}")]
    Rejected(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

impl From<ApiError> for StorageError {
    fn from(err: ApiError) -> Self {
        if err.is_retryable() {
            StorageError::Unavailable(err.to_string())
        } else {
            StorageError::Rejected(err.to_string())
        }
    }
}

/// One page of a folder listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPage {
    pub files: Vec<FileDescriptor>,
    /// Cursor for the following page; `None` on the last one.
    pub next: Option<String>,
}

/// A remote folder that can be listed and whose files can be fetched.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetches one page of supported files. `cursor` is `None` for the first page.
    async fn list_page(
        &self,
        folder_ref: &str,
        cursor: Option<&str>,
    ) -> Result<ListingPage, SourceError>;

    /// Lists every supported file below `folder_ref`, fetching all pages.
    async fn list(&self, folder_ref: &str) -> Result<Vec<FileDescriptor>, SourceError> {
        let mut files = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.list_page(folder_ref, cursor.as_deref()).await?;
            files.extend(page.files);
            match page.next {
                Some(next) => cursor = Some(next),
                None => return Ok(files),
            }
        }
    }

    async fn download(&self, descriptor: &FileDescriptor) -> Result<Bytes, SourceError>;
}

#[async_trait]
pub trait DestinationClient: Send + Sync {
    async fn upload(
        &self,
        content: Bytes,
        name: &str,
        mime_type: &str,
        folder_hint: &str,
    ) -> Result<StoredObject, StorageError>;
}

pub struct DriveSource {
    client: GoogleDriveClient,
}

impl DriveSource {
    pub fn new(client: GoogleDriveClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceClient for DriveSource {
    async fn list_page(
        &self,
        folder_ref: &str,
        cursor: Option<&str>,
    ) -> Result<ListingPage, SourceError> {
        let folder_id = drive_folder_id(folder_ref)
            .map_err(|err| SourceError::InvalidReference(err.to_string()))?;
        let page = self.client.list_folder_page(&folder_id, cursor).await?;
        Ok(ListingPage {
            files: page
                .files
                .into_iter()
                .map(|file| FileDescriptor {
                    native_id: file.id.clone(),
                    name: file.name,
                    mime_type: file.mime_type,
                    size: i64::try_from(file.size).unwrap_or(i64::MAX),
                    locator: Locator::Drive { file_id: file.id },
                })
                .collect(),
            next: page.next_page_token.filter(|token| !token.is_empty()),
        })
    }

    async fn download(&self, descriptor: &FileDescriptor) -> Result<Bytes, SourceError> {
        match &descriptor.locator {
            Locator::Drive { file_id } => Ok(self.client.download_file(file_id).await?),
            other => Err(SourceError::InvalidReference(format!(
                "{other:?} is not a Drive locator"
            ))),
        }
    }
}

pub struct DropboxSource {
    client: DropboxClient,
}

impl DropboxSource {
    pub fn new(client: DropboxClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceClient for DropboxSource {
    async fn list_page(
        &self,
        folder_ref: &str,
        cursor: Option<&str>,
    ) -> Result<ListingPage, SourceError> {
        let shared_link = normalize_dropbox_link(folder_ref)
            .map_err(|err| SourceError::InvalidReference(err.to_string()))?;
        let page = self.client.list_folder_page(&shared_link, cursor).await?;
        let next = if page.has_more { page.cursor } else { None };
        let files = page
            .entries
            .into_iter()
            .filter(|entry| entry.is_file())
            .filter_map(|entry| {
                let path = entry.path()?.to_string();
                let mime_type = entry.mime_type()?.to_string();
                Some(FileDescriptor {
                    native_id: entry.id.clone().unwrap_or_else(|| path.clone()),
                    name: entry.name,
                    mime_type,
                    size: entry
                        .size
                        .map(|size| i64::try_from(size).unwrap_or(i64::MAX))
                        .unwrap_or(0),
                    locator: Locator::Dropbox {
                        shared_link: shared_link.clone(),
                        path,
                    },
                })
            })
            .collect();
        Ok(ListingPage { files, next })
    }

    async fn download(&self, descriptor: &FileDescriptor) -> Result<Bytes, SourceError> {
        match &descriptor.locator {
            Locator::Dropbox { shared_link, path } => {
                Ok(self.client.download_shared_file(shared_link, path).await?)
            }
            other => Err(SourceError::InvalidReference(format!(
                "{other:?} is not a Dropbox locator"
            ))),
        }
    }
}

pub struct StorageDestination {
    client: StorageClient,
}

impl StorageDestination {
    pub fn new(client: StorageClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DestinationClient for StorageDestination {
    async fn upload(
        &self,
        content: Bytes,
        name: &str,
        mime_type: &str,
        folder_hint: &str,
    ) -> Result<StoredObject, StorageError> {
        Ok(self
            .client
            .upload(content, name, mime_type, Some(folder_hint))
            .await?)
    }
}

/// Source clients keyed by the job's source.
#[derive(Clone)]
pub struct SourceRegistry {
    drive: Arc<dyn SourceClient>,
    dropbox: Arc<dyn SourceClient>,
}

impl SourceRegistry {
    pub fn new(drive: Arc<dyn SourceClient>, dropbox: Arc<dyn SourceClient>) -> Self {
        Self { drive, dropbox }
    }

    pub fn for_source(&self, source: JobSource) -> Arc<dyn SourceClient> {
        match source {
            JobSource::DriveFolder => self.drive.clone(),
            JobSource::DropboxFolder => self.dropbox.clone(),
        }
    }
}
