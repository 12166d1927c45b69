//! Storage provider trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use untitledone_common::{Error, ProviderKind, Result, UploadResult, UserId};

/// Lifetime of a download URL when the caller has no preference.
pub const DEFAULT_DOWNLOAD_URL_TTL: Duration = Duration::from_secs(600);

/// Content handed to `upload`.
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Original file name, kept in the result metadata.
    pub name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Where a client fetches file content from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadTarget {
    /// Directly fetchable URL valid until `expires_at`.
    Url {
        url: String,
        expires_at: DateTime<Utc>,
    },
    /// Content needs the owner's credentials; serve it through `download`.
    Proxied { file_id: String },
}

/// Storage backend contract.
///
/// Every operation authenticates with the credentials of `user_id`, the
/// owner of the file, which need not be the user making the request.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Store `file` at `path`, relative to the provider's app area.
    ///
    /// # Postconditions
    /// - `UploadResult.size` equals the number of bytes in `file.data`
    ///
    /// # Errors
    /// - `NotConnected`, `TokenExpired`, `QuotaExceeded`, `Api`
    /// - `InvalidInput` for an empty path or one containing `..`
    async fn upload(&self, file: UploadFile, path: &str, user_id: &UserId) -> Result<UploadResult>;

    /// Resolve how `file_id` can be fetched, valid for roughly `expires_in`.
    async fn get_download_url(
        &self,
        file_id: &str,
        user_id: &UserId,
        expires_in: Duration,
    ) -> Result<DownloadTarget>;

    /// Fetch the full content of `file_id`.
    async fn download(&self, file_id: &str, user_id: &UserId) -> Result<Bytes>;

    /// # Errors
    /// - `FileNotFound` if the provider has no such object
    async fn delete(&self, file_id: &str, user_id: &UserId) -> Result<()>;

    /// Whether the stored credentials still work, refreshing once if needed.
    async fn validate_connection(&self, user_id: &UserId) -> Result<bool>;

    /// Exchange the stored refresh token for a new access token and persist it.
    ///
    /// Returns `false` when refresh failed; the connection status records why.
    async fn refresh_tokens(&self, user_id: &UserId) -> Result<bool>;
}

/// Split a caller-supplied relative path into its segments.
///
/// Leading and trailing slashes are ignored. Empty paths and `.`/`..`
/// segments are rejected, so a path can never escape the app area.
pub fn path_segments(path: &str) -> Result<Vec<&str>> {
    if path.contains('\\') || path.contains('\0') {
        return Err(Error::InvalidInput(format!("Invalid path: {}", path)));
    }

    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    if segments.is_empty() {
        return Err(Error::InvalidInput("Path cannot be empty".to_string()));
    }
    if segments.iter().any(|s| *s == "." || *s == "..") {
        return Err(Error::InvalidInput(format!(
            "Path may not contain '.' or '..' segments: {}",
            path
        )));
    }
    Ok(segments)
}

/// Convert a caller TTL into a chrono duration.
pub(crate) fn ttl(expires_in: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(expires_in)
        .map_err(|_| Error::InvalidInput("Download URL lifetime is too large".to_string()))
}
