//! Re-encryption of stored tokens under a new key version.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use untitledone_common::{Error, ProviderKind, Result};
use untitledone_crypto::{normalize_version, TokenCipher};

use crate::connection::StorageConnection;
use crate::store::CredentialStore;

/// Outcome of one rotation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RotationReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<RotationFailure>,
}

/// A record that could not be re-encrypted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationFailure {
    pub connection_id: String,
    pub provider: ProviderKind,
    pub message: String,
}

/// Batch job moving every connection onto a target key version.
///
/// Records are processed one at a time. A failing record is counted and
/// logged, and the batch continues; re-running only picks up records still
/// on another version.
pub struct KeyRotation {
    store: Arc<CredentialStore>,
    cipher: Arc<TokenCipher>,
}

impl KeyRotation {
    pub fn new(store: Arc<CredentialStore>, cipher: Arc<TokenCipher>) -> Self {
        Self { store, cipher }
    }

    /// Re-encrypt all connections not yet on `target_version`.
    ///
    /// # Errors
    /// `target_version` is matched case-insensitively, like configured keys.
    ///
    /// # Errors
    /// - `Config` if no key is configured for `target_version`
    /// - `CredentialStore` if the stale records cannot be listed
    pub async fn rotate(&self, target_version: &str) -> Result<RotationReport> {
        let target_version = normalize_version(target_version)?;
        let target_version = target_version.as_str();
        if !self.cipher.has_version(target_version) {
            return Err(Error::Config(format!(
                "No token encryption key for target version '{}'",
                target_version
            )));
        }

        let stale = self.store.list_stale_versions(target_version).await?;
        let mut report = RotationReport {
            total: stale.len(),
            ..Default::default()
        };

        info!(
            target_version,
            total = report.total,
            "Starting token key rotation"
        );

        for connection in &stale {
            match self.rotate_one(connection, target_version).await {
                Ok(()) => {
                    report.successful += 1;
                    debug!(connection_id = %connection.id, "Re-encrypted connection tokens");
                }
                Err(err) => {
                    warn!(
                        connection_id = %connection.id,
                        provider = connection.provider.as_str(),
                        from_version = %connection.encryption_key_version,
                        error = %err,
                        "Failed to re-encrypt connection tokens"
                    );
                    report.failed += 1;
                    report.errors.push(RotationFailure {
                        connection_id: connection.id.clone(),
                        provider: connection.provider,
                        message: err.to_string(),
                    });
                }
            }
        }

        info!(
            target_version,
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            "Token key rotation finished"
        );

        Ok(report)
    }

    async fn rotate_one(&self, connection: &StorageConnection, target_version: &str) -> Result<()> {
        let access = self.cipher.decrypt(&connection.encrypted_access_token)?;
        let access = self
            .cipher
            .encrypt_with_version(access.expose(), target_version)?;

        let refresh = match &connection.encrypted_refresh_token {
            Some(sealed) => {
                let plaintext = self.cipher.decrypt(sealed)?;
                Some(
                    self.cipher
                        .encrypt_with_version(plaintext.expose(), target_version)?,
                )
            }
            None => None,
        };

        let updated = self
            .store
            .update_encryption(
                connection,
                &access,
                refresh.as_deref(),
                target_version,
            )
            .await?;

        if !updated {
            return Err(Error::CredentialStore(
                "connection changed during rotation".to_string(),
            ));
        }
        Ok(())
    }
}
