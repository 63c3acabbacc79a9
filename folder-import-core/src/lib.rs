mod drive;
mod dropbox;
mod error;
pub mod links;
mod storage;

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Deserializer};

pub use drive::{DriveFile, DriveFilePage, GoogleDriveClient};
pub use dropbox::{DropboxClient, DropboxEntry, DropboxListPage};
pub use error::{ApiError, ApiErrorClass};
pub use storage::{StorageClient, StoredObject, unique_object_path};

/// Image types the importer accepts from any source.
pub const IMAGE_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
    "image/tiff",
];

/// Bound on a single HTTP request unless a client is given its own.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn http_client(timeout: Duration) -> Result<Client, ApiError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

pub fn is_supported_mime(mime_type: &str) -> bool {
    IMAGE_MIME_TYPES.contains(&mime_type)
}

pub fn image_mime_for_name(name: &str) -> Option<&'static str> {
    let (_, ext) = name.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "tiff" => Some("image/tiff"),
        _ => None,
    }
}

// Drive reports sizes as decimal strings, Dropbox as numbers.
pub(crate) fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
    }

    match Option::<Size>::deserialize(deserializer)? {
        Some(Size::Number(value)) => Ok(value),
        Some(Size::Text(text)) => text.parse().map_err(serde::de::Error::custom),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_from_extension_is_case_insensitive() {
        assert_eq!(image_mime_for_name("a.JPEG"), Some("image/jpeg"));
        assert_eq!(image_mime_for_name("scan.tiff"), Some("image/tiff"));
        assert_eq!(image_mime_for_name("notes.txt"), None);
        assert_eq!(image_mime_for_name("README"), None);
    }

    #[test]
    fn supported_mime_types_are_images_only() {
        assert!(is_supported_mime("image/webp"));
        assert!(!is_supported_mime("application/pdf"));
    }
}
