use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ApiError, error_for_response};
use crate::{DEFAULT_REQUEST_TIMEOUT, IMAGE_MIME_TYPES, deserialize_size, http_client};

const DEFAULT_API_URL: &str = "https://www.googleapis.com/drive/v3/";
const DEFAULT_DOWNLOAD_URL: &str = "https://drive.google.com/";
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: u64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFilePage {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Read-only client for public Google Drive folders, authenticated by API key.
#[derive(Clone)]
pub struct GoogleDriveClient {
    http: Client,
    api_url: Url,
    download_url: Url,
    api_key: String,
}

impl GoogleDriveClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_base_urls(DEFAULT_API_URL, DEFAULT_DOWNLOAD_URL, api_key)
    }

    pub fn with_base_urls(
        api_url: &str,
        download_url: &str,
        api_key: impl Into<String>,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            http: http_client(DEFAULT_REQUEST_TIMEOUT)?,
            api_url: with_trailing_slash(api_url)?,
            download_url: with_trailing_slash(download_url)?,
            api_key: api_key.into(),
        })
    }

    /// Replaces the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ApiError> {
        self.http = http_client(timeout)?;
        Ok(self)
    }

    pub async fn list_folder_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<DriveFilePage, ApiError> {
        let mut url = self.api_url.join("files")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("q", &folder_query(folder_id))
                .append_pair("fields", "nextPageToken, files(id, name, mimeType, size)")
                .append_pair("pageSize", &PAGE_SIZE.to_string())
                .append_pair("key", &self.api_key);
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        Ok(response.json::<DriveFilePage>().await?)
    }

    pub async fn list_folder_all(&self, folder_id: &str) -> Result<Vec<DriveFile>, ApiError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .list_folder_page(folder_id, page_token.as_deref())
                .await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(files)
    }

    pub async fn download_file(&self, file_id: &str) -> Result<Bytes, ApiError> {
        let mut url = self.download_url.join("uc")?;
        url.query_pairs_mut()
            .append_pair("export", "download")
            .append_pair("id", file_id);
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        Ok(response.bytes().await?)
    }
}

fn folder_query(folder_id: &str) -> String {
    let mime_filter = IMAGE_MIME_TYPES
        .iter()
        .map(|mime| format!("mimeType = '{mime}'"))
        .collect::<Vec<_>>()
        .join(" or ");
    format!("'{folder_id}' in parents and trashed = false and ({mime_filter})")
}

fn with_trailing_slash(raw: &str) -> Result<Url, url::ParseError> {
    if raw.ends_with('/') {
        Url::parse(raw)
    } else {
        Url::parse(&format!("{raw}/"))
    }
}
