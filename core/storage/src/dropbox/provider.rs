//! Dropbox storage provider implementation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use untitledone_common::{Error, ProviderKind, Result, UploadResult, UserId};
use untitledone_credentials::CredentialStore;
use untitledone_crypto::TokenCipher;

use crate::http::HttpClient;
use crate::oauth::OAuthClientConfig;
use crate::provider::{path_segments, ttl, DownloadTarget, StorageProvider, UploadFile};
use crate::retry::RefreshRetry;

use super::client::DropboxClient;

/// Dropbox fixes temporary links at four hours.
const TEMPORARY_LINK_LIFETIME: Duration = Duration::from_secs(4 * 60 * 60);

/// Dropbox adapter. Uploads land under `/{app_folder}/`.
pub struct DropboxAdapter {
    client: DropboxClient,
    retry: RefreshRetry,
    app_folder: String,
}

impl DropboxAdapter {
    pub fn new(
        store: Arc<CredentialStore>,
        cipher: Arc<TokenCipher>,
        http: Arc<dyn HttpClient>,
        oauth: OAuthClientConfig,
        app_folder: impl Into<String>,
    ) -> Self {
        Self {
            client: DropboxClient::new(http.clone()),
            retry: RefreshRetry::new(ProviderKind::Dropbox, store, cipher, http, oauth),
            app_folder: app_folder.into(),
        }
    }

    fn full_path(&self, path: &str) -> Result<String> {
        Ok(format!("/{}/{}", self.app_folder, path_segments(path)?.join("/")))
    }
}

#[async_trait]
impl StorageProvider for DropboxAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Dropbox
    }

    async fn upload(&self, file: UploadFile, path: &str, user_id: &UserId) -> Result<UploadResult> {
        let full_path = self.full_path(path)?;
        let client = &self.client;
        let target = full_path.as_str();
        let data = &file.data;

        let uploaded = self
            .retry
            .execute(user_id, move |token| async move {
                client.upload(token.expose(), target, data.clone()).await
            })
            .await?;

        info!(
            user_id = %user_id,
            provider = "dropbox",
            size = file.size(),
            "Uploaded file"
        );

        let mut metadata = serde_json::Map::new();
        metadata.insert("name".to_string(), uploaded.name.clone().into());
        metadata.insert("originalName".to_string(), file.name.clone().into());
        metadata.insert("contentType".to_string(), file.content_type.clone().into());
        if let Some(rev) = &uploaded.rev {
            metadata.insert("rev".to_string(), rev.clone().into());
        }
        if let Some(hash) = &uploaded.content_hash {
            metadata.insert("contentHash".to_string(), hash.clone().into());
        }

        Ok(UploadResult {
            file_id: uploaded.id,
            path: uploaded.path_display.unwrap_or(full_path),
            size: file.size(),
            metadata,
        })
    }

    async fn get_download_url(
        &self,
        file_id: &str,
        user_id: &UserId,
        expires_in: Duration,
    ) -> Result<DownloadTarget> {
        let client = &self.client;
        let url = self
            .retry
            .execute(user_id, move |token| async move {
                client.temporary_link(token.expose(), file_id).await
            })
            .await?;

        let expires_at = Utc::now() + ttl(expires_in.min(TEMPORARY_LINK_LIFETIME))?;
        Ok(DownloadTarget::Url { url, expires_at })
    }

    async fn download(&self, file_id: &str, user_id: &UserId) -> Result<Bytes> {
        let client = &self.client;
        self.retry
            .execute(user_id, move |token| async move {
                client.download(token.expose(), file_id).await
            })
            .await
    }

    async fn delete(&self, file_id: &str, user_id: &UserId) -> Result<()> {
        let client = &self.client;
        self.retry
            .execute(user_id, move |token| async move {
                client.delete(token.expose(), file_id).await
            })
            .await?;

        debug!(user_id = %user_id, provider = "dropbox", "Deleted file");
        Ok(())
    }

    async fn validate_connection(&self, user_id: &UserId) -> Result<bool> {
        let client = &self.client;
        let result = self
            .retry
            .execute(user_id, move |token| async move {
                client.current_account(token.expose()).await
            })
            .await;

        match result {
            Ok(account) => {
                debug!(user_id = %user_id, account_id = %account.account_id, "Dropbox connection valid");
                Ok(true)
            }
            Err(Error::TokenExpired { .. }) | Err(Error::NotConnected { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn refresh_tokens(&self, user_id: &UserId) -> Result<bool> {
        self.retry.refresh(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::test_support::{seeded, Fixture, ScriptedHttpClient};
    use untitledone_common::ConnectionStatus;

    fn adapter(fixture: &Fixture, http: &Arc<ScriptedHttpClient>) -> DropboxAdapter {
        DropboxAdapter::new(
            fixture.store.clone(),
            fixture.cipher.clone(),
            http.clone(),
            OAuthClientConfig::dropbox("app-key", "app-secret"),
            "UntitledOne",
        )
    }

    fn expired_token() -> HttpResponse {
        HttpResponse::new(
            401,
            r#"{"error_summary":"expired_access_token/","error":{".tag":"expired_access_token"}}"#,
        )
    }

    #[tokio::test]
    async fn test_upload_with_stale_token_refreshes_and_retries() {
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push(expired_token());
        http.push_json(
            200,
            serde_json::json!({
                "access_token": "sl.fresh",
                "token_type": "bearer",
                "expires_in": 14400
            }),
        );
        http.push_json(
            200,
            serde_json::json!({
                "id": "id:a4ayc_80_OEAAAAAAAAAXw",
                "name": "mix.wav",
                "path_display": "/UntitledOne/mix.wav",
                "size": 2_400_000,
                "rev": "a1c10ce0dd78",
                "content_hash": "e3b0c442"
            }),
        );
        let dropbox = adapter(&fixture, &http);

        let file = UploadFile::new("mix.wav", "audio/wav", vec![0u8; 2_400_000]);
        let result = dropbox.upload(file, "mix.wav", &fixture.user).await.unwrap();

        assert_eq!(result.file_id, "id:a4ayc_80_OEAAAAAAAAAXw");
        assert_eq!(result.path, "/UntitledOne/mix.wav");
        assert_eq!(result.size, 2_400_000);
        assert_eq!(result.metadata["rev"], "a1c10ce0dd78");

        let requests = http.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(http.count_matching("/files/upload"), 2);
        assert_eq!(http.count_matching("/oauth2/token"), 1);
        assert_eq!(requests[0].header_value("authorization"), Some("Bearer stale"));
        assert_eq!(requests[2].header_value("authorization"), Some("Bearer sl.fresh"));

        let arg: serde_json::Value =
            serde_json::from_str(requests[2].header_value("Dropbox-API-Arg").unwrap()).unwrap();
        assert_eq!(arg["path"], "/UntitledOne/mix.wav");
        assert_eq!(arg["mode"], "add");
        assert_eq!(arg["autorename"], true);
        assert_eq!(requests[2].body.as_ref().map(|b| b.len()), Some(2_400_000));

        let connection = fixture.connection().await;
        assert_eq!(connection.status, ConnectionStatus::Active);
        assert!(connection.token_expires_at.is_some());
        assert_eq!(
            fixture
                .cipher
                .decrypt(&connection.encrypted_access_token)
                .unwrap()
                .expose(),
            "sl.fresh"
        );
    }

    #[tokio::test]
    async fn test_refresh_failure_surfaces_token_expired() {
        let fixture = seeded(ProviderKind::Dropbox, Some("revoked")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push(expired_token());
        http.push_json(400, serde_json::json!({ "error": "invalid_grant" }));
        let dropbox = adapter(&fixture, &http);

        let result = dropbox
            .upload(UploadFile::new("a.wav", "audio/wav", "a"), "a.wav", &fixture.user)
            .await;

        match result {
            Err(err) => {
                assert_eq!(err.code(), "PROVIDER_TOKEN_EXPIRED");
                assert_eq!(err.provider(), Some(ProviderKind::Dropbox));
            }
            Ok(_) => panic!("upload should fail"),
        }
        assert_eq!(http.count_matching("/files/upload"), 1);
        assert_eq!(fixture.connection().await.status, ConnectionStatus::Expired);
    }

    #[tokio::test]
    async fn test_insufficient_space_is_quota_without_refresh() {
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_json(
            409,
            serde_json::json!({
                "error_summary": "path/insufficient_space/...",
                "error": { ".tag": "path" }
            }),
        );
        let dropbox = adapter(&fixture, &http);

        let result = dropbox
            .upload(UploadFile::new("big.wav", "audio/wav", "x"), "big.wav", &fixture.user)
            .await;

        assert!(matches!(
            result,
            Err(Error::QuotaExceeded {
                provider: ProviderKind::Dropbox
            })
        ));
        assert_eq!(http.count_matching("/oauth2/token"), 0);
    }

    #[tokio::test]
    async fn test_temporary_link() {
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_json(
            200,
            serde_json::json!({
                "link": "https://dl.dropboxusercontent.com/apitl/1/abc",
                "metadata": { "name": "mix.wav" }
            }),
        );
        let dropbox = adapter(&fixture, &http);

        let target = dropbox
            .get_download_url("id:abc", &fixture.user, Duration::from_secs(600))
            .await
            .unwrap();

        match target {
            DownloadTarget::Url { url, expires_at } => {
                assert_eq!(url, "https://dl.dropboxusercontent.com/apitl/1/abc");
                assert!(expires_at <= Utc::now() + chrono::Duration::seconds(600));
            }
            other => panic!("expected URL, got {:?}", other),
        }
        assert!(fixture.connection().await.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_missing_file() {
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_json(
            409,
            serde_json::json!({ "error_summary": "path_lookup/not_found/.." }),
        );
        let dropbox = adapter(&fixture, &http);

        let result = dropbox.delete("id:gone", &fixture.user).await;
        match result {
            Err(Error::FileNotFound { provider, file_id }) => {
                assert_eq!(provider, ProviderKind::Dropbox);
                assert_eq!(file_id, "id:gone");
            }
            other => panic!("expected FileNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_content() {
        let fixture = seeded(ProviderKind::Dropbox, Some("r1")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push(HttpResponse::new(200, &b"RIFF....WAVE"[..]));
        let dropbox = adapter(&fixture, &http);

        let bytes = dropbox.download("id:abc", &fixture.user).await.unwrap();
        assert_eq!(bytes.as_ref(), b"RIFF....WAVE");
    }

    #[tokio::test]
    async fn test_validate_connection() {
        let fixture = seeded(ProviderKind::Dropbox, None).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_json(
            200,
            serde_json::json!({ "account_id": "dbid:AAH4f99", "email": "owner@example.com" }),
        );
        http.push(expired_token());
        let dropbox = adapter(&fixture, &http);

        assert!(dropbox.validate_connection(&fixture.user).await.unwrap());
        // No refresh token: the rejected call cannot be recovered.
        assert!(!dropbox.validate_connection(&fixture.user).await.unwrap());
        assert_eq!(fixture.connection().await.status, ConnectionStatus::Expired);

        let stranger = UserId::new("nobody").unwrap();
        assert!(!dropbox.validate_connection(&stranger).await.unwrap());
    }
}
