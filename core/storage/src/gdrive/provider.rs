//! Google Drive storage provider implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use untitledone_common::{Error, ProviderKind, Result, UploadResult, UserId};
use untitledone_credentials::CredentialStore;
use untitledone_crypto::TokenCipher;

use crate::http::HttpClient;
use crate::oauth::OAuthClientConfig;
use crate::provider::{path_segments, DownloadTarget, StorageProvider, UploadFile};
use crate::retry::{CallResult, RefreshRetry};

use super::client::{DriveClient, DriveFile};

/// Parent ID Drive uses for the top of "My Drive".
const ROOT_FOLDER: &str = "root";

/// Google Drive adapter. Uploads land in the app folder, created on first use.
pub struct GoogleDriveAdapter {
    client: DriveClient,
    retry: RefreshRetry,
    app_folder: String,
}

impl GoogleDriveAdapter {
    pub fn new(
        store: Arc<CredentialStore>,
        cipher: Arc<TokenCipher>,
        http: Arc<dyn HttpClient>,
        oauth: OAuthClientConfig,
        app_folder: impl Into<String>,
    ) -> Self {
        Self {
            client: DriveClient::new(http.clone()),
            retry: RefreshRetry::new(ProviderKind::GoogleDrive, store, cipher, http, oauth),
            app_folder: app_folder.into(),
        }
    }
}

/// Walk `folders` from the Drive root, creating any that are missing.
async fn ensure_folders(client: &DriveClient, token: &str, folders: &[&str]) -> CallResult<String> {
    let mut parent_id = ROOT_FOLDER.to_string();
    for name in folders {
        let folder = match client.find_folder(token, name, &parent_id).await? {
            Some(existing) => existing,
            None => {
                debug!(folder = %name, "Creating Drive folder");
                client.create_folder(token, name, &parent_id).await?
            }
        };
        parent_id = folder.id;
    }
    Ok(parent_id)
}

async fn upload_into_app_folder(
    client: &DriveClient,
    token: &str,
    folders: &[&str],
    name: &str,
    file: &UploadFile,
) -> CallResult<DriveFile> {
    let parent_id = ensure_folders(client, token, folders).await?;
    client
        .upload_multipart(token, name, &parent_id, &file.content_type, &file.data)
        .await
}

#[async_trait]
impl StorageProvider for GoogleDriveAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleDrive
    }

    async fn upload(&self, file: UploadFile, path: &str, user_id: &UserId) -> Result<UploadResult> {
        let segments = path_segments(path)?;
        let (name, parents) = segments
            .split_last()
            .ok_or_else(|| Error::InvalidInput("Path has no name component".to_string()))?;

        let mut folders: Vec<&str> = vec![self.app_folder.as_str()];
        folders.extend(parents.iter().copied());

        let client = &self.client;
        let folders = folders.as_slice();
        let upload = &file;
        let uploaded = self
            .retry
            .execute(user_id, move |token| async move {
                upload_into_app_folder(client, token.expose(), folders, name, upload).await
            })
            .await?;

        info!(
            user_id = %user_id,
            provider = "google_drive",
            size = file.size(),
            "Uploaded file"
        );

        let mut metadata = serde_json::Map::new();
        metadata.insert("name".to_string(), uploaded.name.clone().into());
        metadata.insert("originalName".to_string(), file.name.clone().into());
        metadata.insert("mimeType".to_string(), uploaded.mime_type.clone().into());
        if let Some(size) = uploaded.size_bytes() {
            metadata.insert("driveSize".to_string(), size.into());
        }
        if let Some(md5) = &uploaded.md5_checksum {
            metadata.insert("md5Checksum".to_string(), md5.clone().into());
        }
        if let Some(link) = &uploaded.web_view_link {
            metadata.insert("webViewLink".to_string(), link.clone().into());
        }

        Ok(UploadResult {
            file_id: uploaded.id,
            path: format!("/{}/{}", self.app_folder, segments.join("/")),
            size: file.size(),
            metadata,
        })
    }

    /// Drive content needs the owner's bearer token, so the caller is sent
    /// through `download` after the file is confirmed to exist.
    async fn get_download_url(
        &self,
        file_id: &str,
        user_id: &UserId,
        _expires_in: Duration,
    ) -> Result<DownloadTarget> {
        let client = &self.client;
        let file = self
            .retry
            .execute(user_id, move |token| async move {
                client.get_file(token.expose(), file_id).await
            })
            .await?;

        if file.is_folder() {
            return Err(Error::InvalidInput(format!("{} is a folder", file_id)));
        }
        Ok(DownloadTarget::Proxied { file_id: file.id })
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

        debug!(user_id = %user_id, provider = "google_drive", "Deleted file");
        Ok(())
    }

    async fn validate_connection(&self, user_id: &UserId) -> Result<bool> {
        let client = &self.client;
        let result = self
            .retry
            .execute(user_id, move |token| async move { client.about(token.expose()).await })
            .await;

        match result {
            Ok(user) => {
                debug!(
                    user_id = %user_id,
                    permission_id = user.permission_id.as_deref().unwrap_or("-"),
                    "Google Drive connection valid"
                );
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
    use crate::http::{HttpRequest, HttpResponse};
    use crate::test_support::{seeded, Fixture, ScriptedHttpClient};
    use untitledone_common::ConnectionStatus;

    fn adapter(fixture: &Fixture, http: &Arc<ScriptedHttpClient>) -> GoogleDriveAdapter {
        GoogleDriveAdapter::new(
            fixture.store.clone(),
            fixture.cipher.clone(),
            http.clone(),
            OAuthClientConfig::google("client-id", "client-secret"),
            "UntitledOne",
        )
    }

    fn invalid_credentials() -> HttpResponse {
        HttpResponse::new(
            401,
            r#"{"error":{"code":401,"message":"Request had invalid authentication credentials.","errors":[{"reason":"authError"}]}}"#,
        )
    }

    fn body_text(request: &HttpRequest) -> String {
        String::from_utf8_lossy(request.body.as_deref().unwrap_or_default()).into_owned()
    }

    #[tokio::test]
    async fn test_upload_creates_app_folder() {
        let fixture = seeded(ProviderKind::GoogleDrive, Some("1//refresh")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_json(200, serde_json::json!({ "files": [] }));
        http.push_json(
            200,
            serde_json::json!({
                "id": "folder-1",
                "name": "UntitledOne",
                "mimeType": "application/vnd.google-apps.folder"
            }),
        );
        http.push_json(
            200,
            serde_json::json!({
                "id": "file-1",
                "name": "mix.wav",
                "mimeType": "audio/wav",
                "size": "2400000",
                "md5Checksum": "9e107d9d372bb6826bd81d3542a419d6"
            }),
        );
        let drive = adapter(&fixture, &http);

        let file = UploadFile::new("mix.wav", "audio/wav", vec![7u8; 2_400_000]);
        let result = drive.upload(file, "mix.wav", &fixture.user).await.unwrap();

        assert_eq!(result.file_id, "file-1");
        assert_eq!(result.path, "/UntitledOne/mix.wav");
        assert_eq!(result.size, 2_400_000);
        assert_eq!(result.metadata["md5Checksum"], "9e107d9d372bb6826bd81d3542a419d6");

        let requests = http.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].url.contains("/drive/v3/files?q="));
        assert!(body_text(&requests[1]).contains("\"parents\":[\"root\"]"));
        assert!(requests[2].url.contains("/upload/drive/v3/files?uploadType=multipart"));
        assert!(requests[2]
            .header_value("content-type")
            .unwrap()
            .starts_with("multipart/related; boundary="));
        assert!(body_text(&requests[2]).contains("\"parents\":[\"folder-1\"]"));
    }

    #[tokio::test]
    async fn test_upload_reuses_existing_folder_after_refresh() {
        let fixture = seeded(ProviderKind::GoogleDrive, Some("1//refresh")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push(invalid_credentials());
        http.push_json(
            200,
            serde_json::json!({
                "access_token": "ya29.fresh",
                "expires_in": 3599,
                "scope": "https://www.googleapis.com/auth/drive.file",
                "token_type": "Bearer"
            }),
        );
        http.push_json(
            200,
            serde_json::json!({ "files": [{ "id": "folder-1", "name": "UntitledOne" }] }),
        );
        http.push_json(200, serde_json::json!({ "id": "file-2", "name": "take.wav" }));
        let drive = adapter(&fixture, &http);

        let result = drive
            .upload(UploadFile::new("take.wav", "audio/wav", "abc"), "take.wav", &fixture.user)
            .await
            .unwrap();

        assert_eq!(result.file_id, "file-2");
        assert_eq!(http.count_matching("oauth2.googleapis.com/token"), 1);
        assert_eq!(http.requests()[3].header_value("authorization"), Some("Bearer ya29.fresh"));
        assert_eq!(fixture.connection().await.status, ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn test_storage_quota_exceeded() {
        let fixture = seeded(ProviderKind::GoogleDrive, Some("1//refresh")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_json(200, serde_json::json!({ "files": [{ "id": "folder-1", "name": "UntitledOne" }] }));
        http.push_json(
            403,
            serde_json::json!({
                "error": {
                    "code": 403,
                    "message": "The user's Drive storage quota has been exceeded.",
                    "errors": [{ "reason": "storageQuotaExceeded" }]
                }
            }),
        );
        let drive = adapter(&fixture, &http);

        let result = drive
            .upload(UploadFile::new("big.wav", "audio/wav", "x"), "big.wav", &fixture.user)
            .await;

        match result {
            Err(err) => assert_eq!(err.code(), "PROVIDER_QUOTA_EXCEEDED"),
            Ok(_) => panic!("upload should fail"),
        }
        assert_eq!(http.count_matching("/token"), 0);
    }

    #[tokio::test]
    async fn test_download_url_is_proxied() {
        let fixture = seeded(ProviderKind::GoogleDrive, Some("1//refresh")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_json(200, serde_json::json!({ "id": "file-1", "name": "mix.wav" }));
        http.push(HttpResponse::new(200, &b"RIFF"[..]));
        let drive = adapter(&fixture, &http);

        let target = drive
            .get_download_url("file-1", &fixture.user, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(
            target,
            DownloadTarget::Proxied {
                file_id: "file-1".to_string()
            }
        );

        let content = drive.download("file-1", &fixture.user).await.unwrap();
        assert_eq!(content.as_ref(), b"RIFF");
        assert!(http.requests()[1].url.ends_with("files/file-1?alt=media"));
    }

    #[tokio::test]
    async fn test_delete_missing_file() {
        let fixture = seeded(ProviderKind::GoogleDrive, Some("1//refresh")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_json(
            404,
            serde_json::json!({ "error": { "code": 404, "message": "File not found: gone." } }),
        );
        let drive = adapter(&fixture, &http);

        assert!(matches!(
            drive.delete("gone", &fixture.user).await,
            Err(Error::FileNotFound {
                provider: ProviderKind::GoogleDrive,
                ..
            })
        ));
        assert_eq!(http.requests()[0].method, reqwest::Method::DELETE);
    }

    #[tokio::test]
    async fn test_validate_connection_after_failed_refresh() {
        let fixture = seeded(ProviderKind::GoogleDrive, Some("1//revoked")).await;
        let http = Arc::new(ScriptedHttpClient::new());
        http.push(invalid_credentials());
        http.push_json(
            400,
            serde_json::json!({ "error": "invalid_grant", "error_description": "Token has been expired or revoked." }),
        );
        let drive = adapter(&fixture, &http);

        assert!(!drive.validate_connection(&fixture.user).await.unwrap());
        assert_eq!(fixture.connection().await.status, ConnectionStatus::Expired);
    }
}
