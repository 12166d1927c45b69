//! Error taxonomy for storage operations.
//!
//! Adapters classify raw provider failures into these variants before
//! returning; nothing provider-SDK-shaped crosses the adapter boundary.

use thiserror::Error;

use crate::types::ProviderKind;

/// Top-level error type for storage-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No stored credential for the requested provider.
    #[error("{provider} is not connected")]
    NotConnected { provider: ProviderKind },

    /// Refresh was attempted and failed, or no refresh token was available.
    #[error("{provider} access has expired, reconnect the account")]
    TokenExpired { provider: ProviderKind },

    /// Provider rejected the request for a non-auth reason.
    #[error("{provider} API error: {message}")]
    Api {
        provider: ProviderKind,
        message: String,
    },

    /// Provider-side storage is full.
    #[error("{provider} storage quota exceeded")]
    QuotaExceeded { provider: ProviderKind },

    /// Provider-side object is missing.
    #[error("{provider} file not found: {file_id}")]
    FileNotFound {
        provider: ProviderKind,
        file_id: String,
    },

    /// Encrypted token payload is malformed.
    #[error("Malformed encrypted token: {0}")]
    Format(String),

    /// Authentication tag mismatch or undecodable plaintext.
    #[error("Token decryption failed: {0}")]
    Decryption(String),

    /// Missing or invalid configuration, e.g. no key for a required version.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential database failure.
    #[error("Credential store error: {0}")]
    CredentialStore(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable code returned to callers, mappable to HTTP statuses and copy.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotConnected { .. } => "PROVIDER_NOT_CONNECTED",
            Error::TokenExpired { .. } => "PROVIDER_TOKEN_EXPIRED",
            Error::Api { .. } => "PROVIDER_API_ERROR",
            Error::QuotaExceeded { .. } => "PROVIDER_QUOTA_EXCEEDED",
            Error::FileNotFound { .. } => "PROVIDER_FILE_NOT_FOUND",
            Error::Format(_) => "TOKEN_FORMAT_ERROR",
            Error::Decryption(_) => "TOKEN_DECRYPTION_ERROR",
            Error::Config(_) => "STORAGE_CONFIG_ERROR",
            Error::CredentialStore(_) => "CREDENTIAL_STORE_ERROR",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// The provider this error concerns, if any.
    pub fn provider(&self) -> Option<ProviderKind> {
        match self {
            Error::NotConnected { provider }
            | Error::TokenExpired { provider }
            | Error::Api { provider, .. }
            | Error::QuotaExceeded { provider }
            | Error::FileNotFound { provider, .. } => Some(*provider),
            _ => None,
        }
    }

    /// Whether the user should be prompted to reconnect their account.
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, Error::NotConnected { .. } | Error::TokenExpired { .. })
    }

    /// Misconfiguration or data corruption; should page an operator rather
    /// than be shown to the user.
    pub fn is_operator_facing(&self) -> bool {
        matches!(
            self,
            Error::Format(_) | Error::Decryption(_) | Error::Config(_) | Error::CredentialStore(_)
        )
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
