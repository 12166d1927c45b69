//! Lazy refresh-and-retry for OAuth-backed adapters.
//!
//! An operation runs with the stored access token. If the provider answers
//! with its "unauthorized" signal, the refresh token is exchanged once and the
//! operation is replayed once. Any other failure is returned immediately.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use untitledone_common::{ConnectionStatus, Error, ProviderKind, Result, SecretToken, UserId};
use untitledone_credentials::{CredentialStore, TokenUpdate};
use untitledone_crypto::TokenCipher;

use crate::http::{HttpClient, TransportError};
use crate::oauth::{self, OAuthClientConfig, RefreshError};

/// Adapter-internal classification of a failed provider call.
#[derive(Debug)]
pub(crate) enum ProviderFailure {
    /// The access token was rejected.
    Unauthorized,
    QuotaExceeded,
    /// The named object does not exist.
    NotFound(String),
    Api(String),
    Transport(String),
}

impl From<TransportError> for ProviderFailure {
    fn from(err: TransportError) -> Self {
        ProviderFailure::Transport(err.0)
    }
}

impl From<Error> for ProviderFailure {
    fn from(err: Error) -> Self {
        ProviderFailure::Api(err.to_string())
    }
}

pub(crate) type CallResult<T> = std::result::Result<T, ProviderFailure>;

/// Credential access and the bounded retry protocol for one provider.
pub(crate) struct RefreshRetry {
    provider: ProviderKind,
    store: Arc<CredentialStore>,
    cipher: Arc<TokenCipher>,
    http: Arc<dyn HttpClient>,
    oauth: OAuthClientConfig,
}

impl RefreshRetry {
    pub fn new(
        provider: ProviderKind,
        store: Arc<CredentialStore>,
        cipher: Arc<TokenCipher>,
        http: Arc<dyn HttpClient>,
        oauth: OAuthClientConfig,
    ) -> Self {
        Self {
            provider,
            store,
            cipher,
            http,
            oauth,
        }
    }

    /// Run `operation` with `user_id`'s access token, refreshing at most once.
    ///
    /// # Postconditions
    /// - At most two calls to `operation` and one refresh
    /// - `last_used_at` is updated after a successful call
    ///
    /// # Errors
    /// - `NotConnected` if the user has no stored connection
    /// - `TokenExpired` if the token was rejected and could not be refreshed
    /// - the classified failure otherwise
    pub async fn execute<F, Fut, T>(&self, user_id: &UserId, operation: F) -> Result<T>
    where
        F: Fn(SecretToken) -> Fut,
        Fut: Future<Output = CallResult<T>>,
    {
        let token = self.access_token(user_id).await?;
        match operation(token).await {
            Ok(value) => return Ok(self.finish(user_id, value).await),
            Err(ProviderFailure::Unauthorized) => {}
            Err(failure) => return Err(self.classify(failure)),
        }

        debug!(
            user_id = %user_id,
            provider = self.provider.as_str(),
            "Access token rejected, refreshing"
        );

        if !self.refresh(user_id).await? {
            return Err(Error::TokenExpired {
                provider: self.provider,
            });
        }

        let token = self.access_token(user_id).await?;
        match operation(token).await {
            Ok(value) => Ok(self.finish(user_id, value).await),
            Err(ProviderFailure::Unauthorized) => {
                warn!(
                    user_id = %user_id,
                    provider = self.provider.as_str(),
                    "Refreshed access token was rejected"
                );
                Err(Error::TokenExpired {
                    provider: self.provider,
                })
            }
            Err(failure) => Err(self.classify(failure)),
        }
    }

    /// Exchange the stored refresh token and persist the outcome.
    ///
    /// Returns `Ok(false)` when there is nothing to refresh or the provider
    /// refused; the connection status is set to `expired` or `error`.
    pub async fn refresh(&self, user_id: &UserId) -> Result<bool> {
        let Some(connection) = self.store.get_connection(user_id, self.provider).await? else {
            debug!(user_id = %user_id, provider = self.provider.as_str(), "No connection to refresh");
            return Ok(false);
        };

        let Some(sealed) = connection.encrypted_refresh_token.as_deref() else {
            warn!(
                user_id = %user_id,
                provider = self.provider.as_str(),
                "No refresh token stored, marking connection expired"
            );
            self.set_status(user_id, ConnectionStatus::Expired).await?;
            return Ok(false);
        };

        let refresh_token = match self.cipher.decrypt(sealed) {
            Ok(token) => token,
            Err(err) => {
                error!(
                    user_id = %user_id,
                    provider = self.provider.as_str(),
                    key_version = %connection.encryption_key_version,
                    code = err.code(),
                    "Stored refresh token could not be decrypted"
                );
                self.set_status(user_id, ConnectionStatus::Error).await?;
                return Ok(false);
            }
        };

        match oauth::refresh_access_token(self.http.as_ref(), &self.oauth, &refresh_token).await {
            Ok(tokens) => {
                let refresh = tokens.refresh_token.as_ref().unwrap_or(&refresh_token);
                let update = TokenUpdate {
                    encrypted_access_token: self.cipher.encrypt(tokens.access_token.expose())?,
                    encrypted_refresh_token: Some(self.cipher.encrypt(refresh.expose())?),
                    encryption_key_version: self.cipher.current_version().to_string(),
                    token_expires_at: tokens.expires_at,
                };
                self.store
                    .update_tokens(user_id, self.provider, &update)
                    .await?;

                info!(
                    user_id = %user_id,
                    provider = self.provider.as_str(),
                    key_version = %update.encryption_key_version,
                    "Refreshed access token"
                );
                Ok(true)
            }
            Err(RefreshError::Rejected(reason)) => {
                warn!(
                    user_id = %user_id,
                    provider = self.provider.as_str(),
                    reason = %reason,
                    "Refresh token rejected, marking connection expired"
                );
                self.set_status(user_id, ConnectionStatus::Expired).await?;
                Ok(false)
            }
            Err(RefreshError::Unexpected(reason)) => {
                error!(
                    user_id = %user_id,
                    provider = self.provider.as_str(),
                    reason = %reason,
                    "Token refresh failed"
                );
                self.set_status(user_id, ConnectionStatus::Error).await?;
                Ok(false)
            }
        }
    }

    async fn access_token(&self, user_id: &UserId) -> Result<SecretToken> {
        let connection = self
            .store
            .get_connection(user_id, self.provider)
            .await?
            .ok_or(Error::NotConnected {
                provider: self.provider,
            })?;
        self.cipher.decrypt(&connection.encrypted_access_token)
    }

    async fn finish<T>(&self, user_id: &UserId, value: T) -> T {
        if let Err(err) = self.store.touch_last_used(user_id, self.provider).await {
            warn!(
                user_id = %user_id,
                provider = self.provider.as_str(),
                error = %err,
                "Failed to record connection use"
            );
        }
        value
    }

    async fn set_status(&self, user_id: &UserId, status: ConnectionStatus) -> Result<()> {
        self.store
            .mark_status(user_id, self.provider, status)
            .await
            .map(|_| ())
    }

    fn classify(&self, failure: ProviderFailure) -> Error {
        let provider = self.provider;
        match failure {
            ProviderFailure::Unauthorized => Error::TokenExpired { provider },
            ProviderFailure::QuotaExceeded => Error::QuotaExceeded { provider },
            ProviderFailure::NotFound(file_id) => Error::FileNotFound { provider, file_id },
            ProviderFailure::Api(message) | ProviderFailure::Transport(message) => {
                Error::Api { provider, message }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::test_support::{seeded, ScriptedHttpClient};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retry(fixture: &crate::test_support::Fixture, http: Arc<ScriptedHttpClient>) -> RefreshRetry {
        RefreshRetry::new(
            ProviderKind::Dropbox,
            fixture.store.clone(),
            fixture.cipher.clone(),
            http,
            OAuthClientConfig::dropbox("key", "secret"),
        )
    }

    fn token_ok() -> HttpResponse {
        HttpResponse::new(
            200,
            r#"{"access_token":"fresh","token_type":"bearer","expires_in":14400}"#,
        )
    }

    #[tokio::test]
    async fn test_success_without_refresh() {
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        let retry = retry(&fixture, http.clone());
        let calls = AtomicU32::new(0);

        let result = retry
            .execute(&fixture.user, |token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, ProviderFailure>(token.expose().to_string()) }
            })
            .await
            .unwrap();

        assert_eq!(result, "stale");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(http.requests().is_empty());

        let connection = fixture.connection().await;
        assert!(connection.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_bounded_retry_after_refresh() {
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push(token_ok());
        let retry = retry(&fixture, http.clone());
        let calls = AtomicU32::new(0);

        let result = retry
            .execute(&fixture.user, |token| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(ProviderFailure::Unauthorized)
                    } else {
                        Ok(token.expose().to_string())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(http.count_matching("/oauth2/token"), 1);

        let connection = fixture.connection().await;
        assert_eq!(connection.status, ConnectionStatus::Active);
        assert_eq!(
            fixture
                .cipher
                .decrypt(&connection.encrypted_access_token)
                .unwrap()
                .expose(),
            "fresh"
        );
        // Refresh token kept when the provider does not rotate it.
        assert_eq!(
            fixture
                .cipher
                .decrypt(connection.encrypted_refresh_token.as_deref().unwrap())
                .unwrap()
                .expose(),
            "r1"
        );
    }

    #[tokio::test]
    async fn test_always_unauthorized_stops_after_two_calls() {
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push(token_ok());
        let retry = retry(&fixture, http.clone());
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry
            .execute(&fixture.user, |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderFailure::Unauthorized) }
            })
            .await;

        assert!(matches!(result, Err(Error::TokenExpired { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(http.count_matching("/oauth2/token"), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh_marks_expired() {
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push(HttpResponse::new(400, r#"{"error":"invalid_grant"}"#));
        let retry = retry(&fixture, http.clone());
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry
            .execute(&fixture.user, |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderFailure::Unauthorized) }
            })
            .await;

        assert!(matches!(
            result,
            Err(Error::TokenExpired {
                provider: ProviderKind::Dropbox
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.connection().await.status, ConnectionStatus::Expired);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_marks_expired() {
        let fixture = seeded(ProviderKind::Dropbox, None).await;
        let http = Arc::new(ScriptedHttpClient::new());
        let retry = retry(&fixture, http.clone());

        assert!(!retry.refresh(&fixture.user).await.unwrap());
        assert!(http.requests().is_empty());
        assert_eq!(fixture.connection().await.status, ConnectionStatus::Expired);
    }

    #[tokio::test]
    async fn test_transport_failure_during_refresh_marks_error() {
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_transport_error("timed out");
        let retry = retry(&fixture, http);

        assert!(!retry.refresh(&fixture.user).await.unwrap());
        assert_eq!(fixture.connection().await.status, ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_quota_failure_never_refreshes() {
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        let retry = retry(&fixture, http.clone());

        let result: Result<()> = retry
            .execute(&fixture.user, |_token| async {
                Err(ProviderFailure::QuotaExceeded)
            })
            .await;

        assert!(matches!(result, Err(Error::QuotaExceeded { .. })));
        assert!(http.requests().is_empty());
        assert_eq!(fixture.connection().await.status, ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn test_missing_connection_is_not_connected() {
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        let retry = retry(&fixture, http);
        let stranger = UserId::new("someone-else").unwrap();

        let result: Result<()> = retry
            .execute(&stranger, |_token| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(Error::NotConnected { .. })));
        assert!(!retry.refresh(&stranger).await.unwrap());
    }
}
