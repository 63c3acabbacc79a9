use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::error::{ApiError, error_for_response};
use crate::{DEFAULT_REQUEST_TIMEOUT, http_client, image_mime_for_name};

const DEFAULT_API_URL: &str = "https://api.dropboxapi.com/2/";
const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com/2/";
const PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DropboxEntry {
    #[serde(rename = ".tag")]
    pub tag: String,
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl DropboxEntry {
    pub fn is_file(&self) -> bool {
        self.tag == "file"
    }

    /// Path inside the shared folder, preferring the display casing.
    pub fn path(&self) -> Option<&str> {
        self.path_display
            .as_deref()
            .or(self.path_lower.as_deref())
            .filter(|path| !path.is_empty())
    }

    pub fn mime_type(&self) -> Option<&'static str> {
        image_mime_for_name(&self.name)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DropboxListPage {
    #[serde(default)]
    pub entries: Vec<DropboxEntry>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Serialize)]
struct SharedFileArg<'a> {
    url: &'a str,
    path: &'a str,
}

/// Client for files reachable through a Dropbox shared folder link.
#[derive(Clone)]
pub struct DropboxClient {
    http: Client,
    api_url: Url,
    content_url: Url,
    token: String,
}

impl DropboxClient {
    pub fn new(token: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_base_urls(DEFAULT_API_URL, DEFAULT_CONTENT_URL, token)
    }

    pub fn with_base_urls(
        api_url: &str,
        content_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            http: http_client(DEFAULT_REQUEST_TIMEOUT)?,
            api_url: Url::parse(&format!("{}/", api_url.trim_end_matches('/')))?,
            content_url: Url::parse(&format!("{}/", content_url.trim_end_matches('/')))?,
            token: token.into(),
        })
    }

    /// Replaces the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ApiError> {
        self.http = http_client(timeout)?;
        Ok(self)
    }

    pub async fn list_folder_page(
        &self,
        shared_link: &str,
        cursor: Option<&str>,
    ) -> Result<DropboxListPage, ApiError> {
        let (url, body) = match cursor {
            Some(cursor) => (
                self.api_url.join("files/list_folder/continue")?,
                json!({ "cursor": cursor }),
            ),
            None => (
                self.api_url.join("files/list_folder")?,
                json!({
                    "path": "",
                    "shared_link": { "url": shared_link },
                    "recursive": true,
                    "include_media_info": true,
                    "limit": PAGE_LIMIT,
                }),
            ),
        };
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        Ok(response.json::<DropboxListPage>().await?)
    }

    /// Lists every image file below the shared folder, following cursors.
    pub async fn list_shared_folder_images(
        &self,
        shared_link: &str,
    ) -> Result<Vec<DropboxEntry>, ApiError> {
        let mut files = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .list_folder_page(shared_link, cursor.as_deref())
                .await?;
            files.extend(
                page.entries
                    .into_iter()
                    .filter(|entry| entry.is_file() && entry.mime_type().is_some()),
            );
            match (page.has_more, page.cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }
        Ok(files)
    }

    pub async fn download_shared_file(
        &self,
        shared_link: &str,
        path: &str,
    ) -> Result<Bytes, ApiError> {
        let url = self.content_url.join("sharing/get_shared_link_file")?;
        let arg = serde_json::to_string(&SharedFileArg {
            url: shared_link,
            path,
        })?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .header("Dropbox-API-Arg", arg)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        Ok(response.bytes().await?)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }
}
