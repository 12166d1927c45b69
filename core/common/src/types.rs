//! Common types used throughout the storage core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identifier of the user who owns a connection or a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a new UserId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or only whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "UserId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage backends known to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    Dropbox,
    GoogleDrive,
}

impl ProviderKind {
    /// All providers, local first.
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Local,
        ProviderKind::Dropbox,
        ProviderKind::GoogleDrive,
    ];

    /// Wire/database identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Dropbox => "dropbox",
            ProviderKind::GoogleDrive => "google_drive",
        }
    }

    /// Whether the provider authenticates with stored OAuth credentials.
    pub fn is_external(&self) -> bool {
        !matches!(self, ProviderKind::Local)
    }

    /// Whether uploads consume the platform's per-user byte budget.
    ///
    /// External providers bill against the user's own account quota.
    pub fn counts_toward_platform_quota(&self) -> bool {
        matches!(self, ProviderKind::Local)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::Local => "Local storage",
            ProviderKind::Dropbox => "Dropbox",
            ProviderKind::GoogleDrive => "Google Drive",
        };
        f.write_str(name)
    }
}

impl FromStr for ProviderKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "local" => Ok(ProviderKind::Local),
            "dropbox" => Ok(ProviderKind::Dropbox),
            "google_drive" => Ok(ProviderKind::GoogleDrive),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown storage provider '{}'",
                other
            ))),
        }
    }
}

/// Health of a stored connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Tokens are usable.
    Active,
    /// Refresh token missing or rejected; the user must reconnect.
    Expired,
    /// Last refresh failed unexpectedly.
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Expired => "expired",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "active" => Ok(ConnectionStatus::Active),
            "expired" => Ok(ConnectionStatus::Expired),
            "error" => Ok(ConnectionStatus::Error),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown connection status '{}'",
                other
            ))),
        }
    }
}

/// Outcome of an upload. Not persisted here; callers keep their own file
/// record referencing these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    /// Provider-native identifier, or the local storage key.
    pub file_id: String,
    /// Path the provider reports for the stored object.
    pub path: String,
    /// Size in bytes. Authoritative for quota bookkeeping.
    pub size: u64,
    /// Provider-specific fields.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Plaintext OAuth token that zeroizes on drop.
///
/// Lives only for the duration of one provider call or one rotation step.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the plaintext. Do not store or log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for SecretToken {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretToken([REDACTED])")
    }
}
