//! Storage connection records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use untitledone_common::{ConnectionStatus, Error, ProviderKind, Result, UserId};
use untitledone_crypto::TokenCipher;

/// One user's link to one external provider.
///
/// Carries encrypted token envelopes and is not `Serialize`; use
/// `ConnectionSummary` for anything user-facing.
#[derive(Clone)]
pub struct StorageConnection {
    pub id: String,
    pub user_id: UserId,
    pub provider: ProviderKind,
    pub provider_account_id: String,
    pub provider_account_name: Option<String>,
    pub encrypted_access_token: String,
    pub encrypted_refresh_token: Option<String>,
    pub encryption_key_version: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StorageConnection {
    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }

    /// User-facing view without any token material.
    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            provider: self.provider,
            provider_account_name: self.provider_account_name.clone(),
            status: self.status,
            connected_at: self.connected_at,
            last_used_at: self.last_used_at,
            token_expires_at: self.token_expires_at,
        }
    }
}

impl fmt::Debug for StorageConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConnection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("provider_account_id", &self.provider_account_id)
            .field("encryption_key_version", &self.encryption_key_version)
            .field("has_refresh_token", &self.encrypted_refresh_token.is_some())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Connection state safe to return from an API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub provider: ProviderKind,
    pub provider_account_name: Option<String>,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Initial token pair for a freshly authorized connection, already sealed.
#[derive(Clone)]
pub struct NewConnection {
    pub user_id: UserId,
    pub provider: ProviderKind,
    pub provider_account_id: String,
    pub provider_account_name: Option<String>,
    pub encrypted_access_token: String,
    pub encrypted_refresh_token: Option<String>,
    pub encryption_key_version: String,
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl NewConnection {
    /// Encrypt a plaintext token pair under the cipher's current version.
    ///
    /// # Errors
    /// - `InvalidInput` for the local provider, which has no credentials
    #[allow(clippy::too_many_arguments)]
    pub fn sealed(
        cipher: &TokenCipher,
        user_id: UserId,
        provider: ProviderKind,
        provider_account_id: impl Into<String>,
        provider_account_name: Option<String>,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        if !provider.is_external() {
            return Err(Error::InvalidInput(format!(
                "{} does not store credentials",
                provider
            )));
        }

        Ok(Self {
            user_id,
            provider,
            provider_account_id: provider_account_id.into(),
            provider_account_name,
            encrypted_access_token: cipher.encrypt(access_token)?,
            encrypted_refresh_token: refresh_token.map(|t| cipher.encrypt(t)).transpose()?,
            encryption_key_version: cipher.current_version().to_string(),
            token_expires_at,
        })
    }
}

/// Result of a successful refresh, sealed under the current key version.
///
/// Applied as one update that also sets `status = active`.
#[derive(Clone)]
pub struct TokenUpdate {
    pub encrypted_access_token: String,
    pub encrypted_refresh_token: Option<String>,
    pub encryption_key_version: String,
    pub token_expires_at: Option<DateTime<Utc>>,
}
