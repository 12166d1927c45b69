//! Local filesystem storage provider.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use untitledone_common::{Error, ProviderKind, Result, SecretToken, UploadResult, UserId};

use crate::config::LocalConfig;
use crate::provider::{path_segments, ttl, DownloadTarget, StorageProvider, UploadFile};

type HmacSha256 = Hmac<Sha256>;

/// Platform object store on the local filesystem.
///
/// Objects are keyed `{user_id}/{uuid}/{path}` under the root. No
/// credentials are involved, so validation and refresh always succeed.
pub struct LocalStorageAdapter {
    root: PathBuf,
    base_url: Url,
    signing_secret: Option<SecretToken>,
}

impl LocalStorageAdapter {
    /// Create the adapter, creating the root directory if needed.
    ///
    /// # Errors
    /// - `Config` if `base_url` is not an absolute hierarchical URL
    pub async fn new(config: &LocalConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .ok()
            .filter(|u| !u.cannot_be_a_base())
            .ok_or_else(|| {
                Error::Config(format!("Invalid local storage base URL '{}'", config.base_url))
            })?;

        let root = config.root.clone();
        fs::create_dir_all(&root).await?;

        Ok(Self {
            root,
            base_url,
            signing_secret: config.signing_secret.clone(),
        })
    }

    /// Public URL for `key`, one percent-encoded path segment per key segment.
    fn object_url(&self, key: &str, expires: i64, signature: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config("Local storage base URL cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(path_segments(key)?);
        url.query_pairs_mut()
            .clear()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", signature);
        Ok(url)
    }

    /// Map a storage key to a path under the root.
    fn to_fs_path(&self, key: &str) -> Result<PathBuf> {
        let mut fs_path = self.root.clone();
        for segment in path_segments(key)? {
            fs_path.push(segment);
        }
        Ok(fs_path)
    }

    fn sign(&self, key: &str, expires: i64) -> Result<String> {
        let secret = self.signing_secret.as_ref().ok_or_else(|| {
            Error::Config("STORAGE_LOCAL_SIGNING_SECRET is required for download URLs".to_string())
        })?;
        let mut mac = HmacSha256::new_from_slice(secret.expose().as_bytes())
            .map_err(|_| Error::Config("Invalid local signing secret".to_string()))?;
        mac.update(format!("{}:{}", key, expires).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a signature produced for a download URL.
    ///
    /// Expired or tampered URLs return false.
    pub fn verify_signature(&self, key: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Some(secret) = self.signing_secret.as_ref() else {
            return false;
        };
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.expose().as_bytes()) else {
            return false;
        };
        mac.update(format!("{}:{}", key, expires).as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    fn not_found(key: &str) -> Error {
        Error::FileNotFound {
            provider: ProviderKind::Local,
            file_id: key.to_string(),
        }
    }

    async fn ensure_file(&self, key: &str) -> Result<PathBuf> {
        let fs_path = self.to_fs_path(key)?;
        match fs::metadata(&fs_path).await {
            Ok(meta) if meta.is_file() => Ok(fs_path),
            Ok(_) => Err(Self::not_found(key)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(Self::not_found(key)),
            Err(err) => Err(err.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl StorageProvider for LocalStorageAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn upload(&self, file: UploadFile, path: &str, user_id: &UserId) -> Result<UploadResult> {
        let relative = path_segments(path)?.join("/");
        let owner = path_segments(user_id.as_str())?.join("_");
        let key = format!("{}/{}/{}", owner, Uuid::new_v4(), relative);
        let fs_path = self.to_fs_path(&key)?;

        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&fs_path, &file.data).await?;

        debug!(user_id = %user_id, key = %key, size = file.size(), "Stored local object");

        let mut metadata = serde_json::Map::new();
        metadata.insert("originalName".to_string(), file.name.clone().into());
        metadata.insert("contentType".to_string(), file.content_type.clone().into());

        Ok(UploadResult {
            file_id: key.clone(),
            path: key,
            size: file.size(),
            metadata,
        })
    }

    async fn get_download_url(
        &self,
        file_id: &str,
        _user_id: &UserId,
        expires_in: Duration,
    ) -> Result<DownloadTarget> {
        self.ensure_file(file_id).await?;

        let expires_at = Utc::now() + ttl(expires_in)?;
        let expires = expires_at.timestamp();
        let signature = self.sign(file_id, expires)?;

        Ok(DownloadTarget::Url {
            url: self.object_url(file_id, expires, &signature)?.into(),
            expires_at,
        })
    }

    async fn download(&self, file_id: &str, _user_id: &UserId) -> Result<Bytes> {
        let fs_path = self.ensure_file(file_id).await?;
        Ok(Bytes::from(fs::read(&fs_path).await?))
    }

    async fn delete(&self, file_id: &str, user_id: &UserId) -> Result<()> {
        let fs_path = self.ensure_file(file_id).await?;
        fs::remove_file(&fs_path).await?;
        debug!(user_id = %user_id, key = %file_id, "Deleted local object");
        Ok(())
    }

    async fn validate_connection(&self, _user_id: &UserId) -> Result<bool> {
        Ok(true)
    }

    async fn refresh_tokens(&self, _user_id: &UserId) -> Result<bool> {
        Ok(true)
    }
}
