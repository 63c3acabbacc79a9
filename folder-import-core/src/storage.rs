use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{ApiError, error_for_response};
use crate::{DEFAULT_REQUEST_TIMEOUT, http_client};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StoredObject {
    pub storage_path: String,
    pub storage_url: String,
}

/// Uploads objects into one Supabase storage bucket.
#[derive(Clone)]
pub struct StorageClient {
    http: Client,
    base_url: Url,
    bucket: String,
    service_key: String,
}

impl StorageClient {
    pub fn new(
        base_url: &str,
        bucket: impl Into<String>,
        service_key: impl Into<String>,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            http: http_client(DEFAULT_REQUEST_TIMEOUT)?,
            base_url: Url::parse(base_url)?,
            bucket: bucket.into(),
            service_key: service_key.into(),
        })
    }

    /// Replaces the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ApiError> {
        self.http = http_client(timeout)?;
        Ok(self)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Stores `content` under a fresh path inside `folder` so repeated
    /// uploads of the same name never overwrite each other.
    pub async fn upload(
        &self,
        content: Bytes,
        file_name: &str,
        mime_type: &str,
        folder: Option<&str>,
    ) -> Result<StoredObject, ApiError> {
        let storage_path = unique_object_path(folder, file_name);
        let url = self.object_url(&["storage", "v1", "object"], &storage_path)?;
        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("apikey", &self.service_key)
            .header("Content-Type", mime_type)
            .body(content)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        let storage_url = self.public_url(&storage_path)?;
        Ok(StoredObject {
            storage_path,
            storage_url,
        })
    }

    pub fn public_url(&self, storage_path: &str) -> Result<String, ApiError> {
        Ok(self
            .object_url(&["storage", "v1", "object", "public"], storage_path)?
            .to_string())
    }

    fn object_url(&self, prefix: &[&str], storage_path: &str) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
            segments.pop_if_empty();
            segments.extend(prefix);
            segments.push(&self.bucket);
            segments.extend(storage_path.split('/').filter(|part| !part.is_empty()));
        }
        Ok(url)
    }
}

pub fn unique_object_path(folder: Option<&str>, file_name: &str) -> String {
    let unique_id = Uuid::new_v4().simple().to_string();
    let safe_name = file_name.replace(' ', "_");
    let object = format!("{}_{}", &unique_id[..8], safe_name);
    match folder.map(|f| f.trim_matches('/')).filter(|f| !f.is_empty()) {
        Some(folder) => format!("{folder}/{object}"),
        None => object,
    }
}
