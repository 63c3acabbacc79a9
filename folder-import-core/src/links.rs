use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("invalid Google Drive folder URL")]
    InvalidDriveFolder,
    #[error("invalid Dropbox URL")]
    InvalidDropboxLink,
}

/// Extracts the folder id from a public Google Drive folder link.
///
/// Accepts `/drive/folders/<id>`, `/drive/u/<n>/folders/<id>` and
/// `/open?id=<id>` forms.
pub fn drive_folder_id(raw: &str) -> Result<String, LinkError> {
    let url = Url::parse(raw.trim()).map_err(|_| LinkError::InvalidDriveFolder)?;
    if url.host_str() != Some("drive.google.com") {
        return Err(LinkError::InvalidDriveFolder);
    }
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|part| !part.is_empty()).collect())
        .unwrap_or_default();

    let candidate = match segments.as_slice() {
        ["drive", "folders", id, ..] => Some((*id).to_string()),
        ["drive", "u", account, "folders", id, ..] if account.parse::<u32>().is_ok() => {
            Some((*id).to_string())
        }
        ["open"] => url
            .query_pairs()
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value.into_owned()),
        _ => None,
    };

    candidate
        .filter(|id| is_drive_id(id))
        .ok_or(LinkError::InvalidDriveFolder)
}

/// Validates a Dropbox shared link and forces the direct-download flag.
pub fn normalize_dropbox_link(raw: &str) -> Result<String, LinkError> {
    let mut url = Url::parse(raw.trim()).map_err(|_| LinkError::InvalidDropboxLink)?;
    let host = url.host_str().unwrap_or_default();
    if host != "dropbox.com" && !host.ends_with(".dropbox.com") {
        return Err(LinkError::InvalidDropboxLink);
    }
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "dl")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("dl", "1");
    Ok(url.to_string())
}

fn is_drive_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
