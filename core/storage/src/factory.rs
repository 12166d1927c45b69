//! Provider resolution gated on connection state.

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use untitledone_common::{Error, ProviderKind, Result, UserId};
use untitledone_credentials::CredentialStore;
use untitledone_crypto::TokenCipher;

use crate::config::StorageConfig;
use crate::dropbox::DropboxAdapter;
use crate::gdrive::GoogleDriveAdapter;
use crate::http::{HttpClient, ReqwestHttpClient};
use crate::local::LocalStorageAdapter;
use crate::oauth::OAuthClientConfig;
use crate::provider::StorageProvider;

/// Hands out adapters for a `(provider, user)` pair.
///
/// Local storage is always available. External providers require a stored
/// connection with `status == active`. Each adapter is built on first use
/// and shared afterwards; adapters hold no per-user state.
pub struct StorageProviderFactory {
    config: StorageConfig,
    store: Arc<CredentialStore>,
    cipher: Arc<TokenCipher>,
    http: Arc<dyn HttpClient>,
    local: OnceCell<Arc<LocalStorageAdapter>>,
    dropbox: OnceCell<Arc<DropboxAdapter>>,
    google_drive: OnceCell<Arc<GoogleDriveAdapter>>,
}

impl StorageProviderFactory {
    /// Create a factory backed by reqwest with the configured timeout.
    pub fn new(
        config: StorageConfig,
        store: Arc<CredentialStore>,
        cipher: Arc<TokenCipher>,
    ) -> Result<Self> {
        let http = Arc::new(ReqwestHttpClient::new(config.http_timeout)?);
        Ok(Self::with_http_client(config, store, cipher, http))
    }

    /// Create a factory with an explicit HTTP capability.
    pub fn with_http_client(
        config: StorageConfig,
        store: Arc<CredentialStore>,
        cipher: Arc<TokenCipher>,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            config,
            store,
            cipher,
            http,
            local: OnceCell::new(),
            dropbox: OnceCell::new(),
            google_drive: OnceCell::new(),
        }
    }

    /// Resolve the adapter for `provider` on behalf of `user_id`.
    ///
    /// # Errors
    /// - `NotConnected` if an external provider has no active connection
    /// - `Config` if the provider's client credentials are not configured
    pub async fn get(
        &self,
        provider: ProviderKind,
        user_id: &UserId,
    ) -> Result<Arc<dyn StorageProvider>> {
        if provider.is_external() {
            self.require_active(provider, user_id).await?;
        }
        self.adapter(provider).await
    }

    /// Exchange the stored refresh token whatever the connection's status.
    ///
    /// Lets an operator recover an `expired` or `error` connection; success
    /// marks it active again. Returns `Ok(false)` when there is no stored
    /// connection or the provider refuses.
    pub async fn refresh_connection(
        &self,
        provider: ProviderKind,
        user_id: &UserId,
    ) -> Result<bool> {
        self.adapter(provider).await?.refresh_tokens(user_id).await
    }

    /// Whether `provider` can be used for `user_id` right now.
    ///
    /// Never fails; lookup errors are logged and reported as `false`.
    pub async fn has_active_connection(&self, provider: ProviderKind, user_id: &UserId) -> bool {
        if !provider.is_external() {
            return true;
        }
        match self.store.get_connection(user_id, provider).await {
            Ok(connection) => connection.is_some_and(|c| c.is_active()),
            Err(err) => {
                warn!(
                    user_id = %user_id,
                    provider = provider.as_str(),
                    error = %err,
                    "Connection lookup failed"
                );
                false
            }
        }
    }

    /// Providers `user_id` can use now, local first.
    pub async fn available_providers(&self, user_id: &UserId) -> Vec<ProviderKind> {
        let mut available = Vec::with_capacity(ProviderKind::ALL.len());
        for provider in ProviderKind::ALL {
            if self.has_active_connection(provider, user_id).await {
                available.push(provider);
            }
        }
        available
    }

    async fn adapter(&self, provider: ProviderKind) -> Result<Arc<dyn StorageProvider>> {
        let adapter: Arc<dyn StorageProvider> = match provider {
            ProviderKind::Local => self.local_adapter().await?,
            ProviderKind::Dropbox => self.dropbox_adapter().await?,
            ProviderKind::GoogleDrive => self.google_drive_adapter().await?,
        };
        Ok(adapter)
    }

    async fn require_active(&self, provider: ProviderKind, user_id: &UserId) -> Result<()> {
        let connection = self.store.get_connection(user_id, provider).await?;
        match connection {
            Some(c) if c.is_active() => Ok(()),
            Some(c) => {
                debug!(
                    user_id = %user_id,
                    provider = provider.as_str(),
                    status = c.status.as_str(),
                    "Connection is not active"
                );
                Err(Error::NotConnected { provider })
            }
            None => Err(Error::NotConnected { provider }),
        }
    }

    async fn local_adapter(&self) -> Result<Arc<LocalStorageAdapter>> {
        self.local
            .get_or_try_init(|| async {
                LocalStorageAdapter::new(&self.config.local).await.map(Arc::new)
            })
            .await
            .cloned()
    }

    async fn dropbox_adapter(&self) -> Result<Arc<DropboxAdapter>> {
        self.dropbox
            .get_or_try_init(|| async {
                let oauth = self.oauth_config(ProviderKind::Dropbox, &self.config.dropbox)?;
                Ok::<_, Error>(Arc::new(DropboxAdapter::new(
                    self.store.clone(),
                    self.cipher.clone(),
                    self.http.clone(),
                    oauth,
                    self.config.app_folder.clone(),
                )))
            })
            .await
            .cloned()
    }

    async fn google_drive_adapter(&self) -> Result<Arc<GoogleDriveAdapter>> {
        self.google_drive
            .get_or_try_init(|| async {
                let oauth =
                    self.oauth_config(ProviderKind::GoogleDrive, &self.config.google_drive)?;
                Ok::<_, Error>(Arc::new(GoogleDriveAdapter::new(
                    self.store.clone(),
                    self.cipher.clone(),
                    self.http.clone(),
                    oauth,
                    self.config.app_folder.clone(),
                )))
            })
            .await
            .cloned()
    }

    fn oauth_config(
        &self,
        provider: ProviderKind,
        config: &Option<OAuthClientConfig>,
    ) -> Result<OAuthClientConfig> {
        config.clone().ok_or_else(|| {
            Error::Config(format!("{} OAuth client credentials are not configured", provider))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::UploadFile;
    use crate::test_support::{seeded, Fixture, ScriptedHttpClient};
    use untitledone_common::ConnectionStatus;

    fn factory(
        fixture: &Fixture,
        http: Arc<ScriptedHttpClient>,
        root: &std::path::Path,
    ) -> StorageProviderFactory {
        let mut config = StorageConfig::default();
        config.local.root = root.to_path_buf();
        config.dropbox = Some(OAuthClientConfig::dropbox("key", "secret"));
        StorageProviderFactory::with_http_client(
            config,
            fixture.store.clone(),
            fixture.cipher.clone(),
            http,
        )
    }

    #[tokio::test]
    async fn test_local_needs_no_connection() {
        let temp = tempfile::TempDir::new().unwrap();
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let factory = factory(&fixture, Arc::new(ScriptedHttpClient::new()), temp.path());
        let stranger = UserId::new("no-connections").unwrap();

        let local = factory.get(ProviderKind::Local, &stranger).await.unwrap();
        assert_eq!(local.kind(), ProviderKind::Local);
        assert!(factory.has_active_connection(ProviderKind::Local, &stranger).await);
    }

    #[tokio::test]
    async fn test_active_connection_resolves_adapter() {
        let temp = tempfile::TempDir::new().unwrap();
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let factory = factory(&fixture, Arc::new(ScriptedHttpClient::new()), temp.path());

        let adapter = factory.get(ProviderKind::Dropbox, &fixture.user).await.unwrap();
        assert_eq!(adapter.kind(), ProviderKind::Dropbox);
        assert_eq!(
            factory.available_providers(&fixture.user).await,
            vec![ProviderKind::Local, ProviderKind::Dropbox]
        );
    }

    #[tokio::test]
    async fn test_expired_connection_fails_without_calling_adapter() {
        let temp = tempfile::TempDir::new().unwrap();
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        fixture
            .store
            .mark_status(&fixture.user, ProviderKind::Dropbox, ConnectionStatus::Expired)
            .await
            .unwrap();
        let http = Arc::new(ScriptedHttpClient::new());
        let factory = factory(&fixture, http.clone(), temp.path());

        let result = factory.get(ProviderKind::Dropbox, &fixture.user).await;
        assert!(matches!(
            result,
            Err(Error::NotConnected {
                provider: ProviderKind::Dropbox
            })
        ));
        assert!(http.requests().is_empty());
        assert!(!factory.has_active_connection(ProviderKind::Dropbox, &fixture.user).await);
        assert_eq!(
            factory.available_providers(&fixture.user).await,
            vec![ProviderKind::Local]
        );
    }

    #[tokio::test]
    async fn test_refresh_connection_recovers_errored_connection() {
        let temp = tempfile::TempDir::new().unwrap();
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        fixture
            .store
            .mark_status(&fixture.user, ProviderKind::Dropbox, ConnectionStatus::Error)
            .await
            .unwrap();
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_json(
            200,
            serde_json::json!({
                "access_token": "sl.fresh",
                "token_type": "bearer",
                "expires_in": 14400
            }),
        );
        let factory = factory(&fixture, http.clone(), temp.path());

        assert!(factory.get(ProviderKind::Dropbox, &fixture.user).await.is_err());
        assert!(factory
            .refresh_connection(ProviderKind::Dropbox, &fixture.user)
            .await
            .unwrap());

        assert_eq!(http.requests().len(), 1);
        assert!(fixture.connection().await.is_active());
        assert!(factory.get(ProviderKind::Dropbox, &fixture.user).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_connection_is_not_connected() {
        let temp = tempfile::TempDir::new().unwrap();
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let factory = factory(&fixture, Arc::new(ScriptedHttpClient::new()), temp.path());

        let result = factory.get(ProviderKind::GoogleDrive, &fixture.user).await;
        assert!(matches!(result, Err(Error::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_config_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let fixture = seeded(ProviderKind::GoogleDrive, Some("r1")).await;
        let factory = factory(&fixture, Arc::new(ScriptedHttpClient::new()), temp.path());

        let result = factory.get(ProviderKind::GoogleDrive, &fixture.user).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_adapter_is_shared_and_uploads() {
        let temp = tempfile::TempDir::new().unwrap();
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let factory = factory(&fixture, Arc::new(ScriptedHttpClient::new()), temp.path());
        let owner = UserId::new("u1").unwrap();

        let first = factory.get(ProviderKind::Local, &owner).await.unwrap();
        let second = factory.get(ProviderKind::Local, &owner).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let result = first
            .upload(UploadFile::new("a.txt", "text/plain", "hi"), "a.txt", &owner)
            .await
            .unwrap();
        assert_eq!(result.size, 2);
    }
}
