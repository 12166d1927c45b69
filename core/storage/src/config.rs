//! Storage configuration, built once and injected into the factory.

use std::path::PathBuf;
use std::time::Duration;

use untitledone_common::{Error, Result, SecretToken};

use crate::oauth::OAuthClientConfig;

/// Folder every external upload lands under.
pub const DEFAULT_APP_FOLDER: &str = "UntitledOne";

/// Per-request HTTP timeout when none is configured.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_LOCAL_ROOT: &str = "./data/storage";
const DEFAULT_LOCAL_BASE_URL: &str = "http://localhost:8080/files";

/// Platform object store settings.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub root: PathBuf,
    /// Public prefix for signed download URLs.
    pub base_url: String,
    /// HMAC key for download URLs. Without it the local adapter cannot
    /// issue URLs but still stores and serves content.
    pub signing_secret: Option<SecretToken>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_LOCAL_ROOT),
            base_url: DEFAULT_LOCAL_BASE_URL.to_string(),
            signing_secret: None,
        }
    }
}

/// Configuration for every storage backend.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub app_folder: String,
    pub http_timeout: Duration,
    pub local: LocalConfig,
    /// `None` when Dropbox credentials are not configured.
    pub dropbox: Option<OAuthClientConfig>,
    pub google_drive: Option<OAuthClientConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            app_folder: DEFAULT_APP_FOLDER.to_string(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            local: LocalConfig::default(),
            dropbox: None,
            google_drive: None,
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build from `(name, value)` pairs.
    ///
    /// An OAuth provider is configured only when both its client id and
    /// secret are present.
    ///
    /// # Errors
    /// - `Config` if only half of a client id/secret pair is set, or the
    ///   timeout is not a positive integer
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        let mut dropbox = (None, None);
        let mut google = (None, None);

        for (name, value) in vars {
            let value = value.as_ref().trim().to_string();
            if value.is_empty() {
                continue;
            }
            match name.as_ref() {
                "STORAGE_LOCAL_ROOT" => config.local.root = PathBuf::from(value),
                "STORAGE_LOCAL_BASE_URL" => {
                    config.local.base_url = value.trim_end_matches('/').to_string()
                }
                "STORAGE_LOCAL_SIGNING_SECRET" => {
                    config.local.signing_secret = Some(SecretToken::new(value))
                }
                "STORAGE_APP_FOLDER" => config.app_folder = value,
                "STORAGE_HTTP_TIMEOUT_SECS" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        Error::Config("STORAGE_HTTP_TIMEOUT_SECS must be an integer".to_string())
                    })?;
                    if secs == 0 {
                        return Err(Error::Config(
                            "STORAGE_HTTP_TIMEOUT_SECS must be positive".to_string(),
                        ));
                    }
                    config.http_timeout = Duration::from_secs(secs);
                }
                "DROPBOX_CLIENT_ID" => dropbox.0 = Some(value),
                "DROPBOX_CLIENT_SECRET" => dropbox.1 = Some(value),
                "GOOGLE_CLIENT_ID" => google.0 = Some(value),
                "GOOGLE_CLIENT_SECRET" => google.1 = Some(value),
                _ => {}
            }
        }

        config.dropbox = pair("DROPBOX", dropbox)?.map(|(id, secret)| OAuthClientConfig::dropbox(id, secret));
        config.google_drive =
            pair("GOOGLE", google)?.map(|(id, secret)| OAuthClientConfig::google(id, secret));

        tracing::debug!(
            app_folder = %config.app_folder,
            local_root = %config.local.root.display(),
            dropbox = config.dropbox.is_some(),
            google_drive = config.google_drive.is_some(),
            "Loaded storage configuration"
        );

        Ok(config)
    }
}

fn pair(prefix: &str, values: (Option<String>, Option<String>)) -> Result<Option<(String, String)>> {
    match values {
        (Some(id), Some(secret)) => Ok(Some((id, secret))),
        (None, None) => Ok(None),
        (Some(_), None) => Err(Error::Config(format!("{}_CLIENT_SECRET is not set", prefix))),
        (None, Some(_)) => Err(Error::Config(format!("{}_CLIENT_ID is not set", prefix))),
    }
}
