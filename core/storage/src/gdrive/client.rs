//! Google Drive API client.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::retry::{CallResult, ProviderFailure};

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,size,parents,md5Checksum,webViewLink";
const MULTIPART_BOUNDARY: &str = "UntitledOneBoundary";

/// Google Drive file metadata from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    /// Decimal string; absent for folders.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub web_view_link: Option<String>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Deserialize)]
struct FileListResponse {
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct AboutResponse {
    user: DriveUser,
}

/// Account owning the token, from `about?fields=user`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveUser {
    #[serde(default)]
    pub permission_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

/// Google Drive API client. Each call takes the bearer token explicitly.
pub struct DriveClient {
    http: Arc<dyn HttpClient>,
}

impl DriveClient {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }

    /// Get file metadata by ID.
    pub async fn get_file(&self, token: &str, file_id: &str) -> CallResult<DriveFile> {
        let request = HttpRequest::get(format!("{}/files/{}", DRIVE_API_BASE, file_id))
            .bearer(token)
            .query(&[("fields", FILE_FIELDS)])?;

        let response = self.http.send(request).await?;
        parse(classify(response, file_id)?)
    }

    /// Find a non-trashed folder by name under `parent_id`.
    pub async fn find_folder(
        &self,
        token: &str,
        name: &str,
        parent_id: &str,
    ) -> CallResult<Option<DriveFile>> {
        let query = format!(
            "name = '{}' and mimeType = '{}' and '{}' in parents and trashed = false",
            escape_query(name),
            FOLDER_MIME_TYPE,
            parent_id
        );
        let request = HttpRequest::get(format!("{}/files", DRIVE_API_BASE))
            .bearer(token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id,name,mimeType,parents)"),
                ("pageSize", "1"),
            ])?;

        let response = self.http.send(request).await?;
        let list: FileListResponse = parse(classify(response, name)?)?;
        Ok(list.files.into_iter().next())
    }

    /// Create a folder.
    pub async fn create_folder(
        &self,
        token: &str,
        name: &str,
        parent_id: &str,
    ) -> CallResult<DriveFile> {
        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent_id],
        });
        let request = HttpRequest::post(format!("{}/files", DRIVE_API_BASE))
            .bearer(token)
            .query(&[("fields", FILE_FIELDS)])?
            .json(&metadata)?;

        let response = self.http.send(request).await?;
        parse(classify(response, name)?)
    }

    /// `files.create` with a multipart body: metadata part, then content.
    pub async fn upload_multipart(
        &self,
        token: &str,
        name: &str,
        parent_id: &str,
        content_type: &str,
        data: &Bytes,
    ) -> CallResult<DriveFile> {
        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
            "mimeType": content_type,
        });
        let metadata_json = serde_json::to_string(&metadata)
            .map_err(|e| ProviderFailure::Api(format!("Failed to serialize metadata: {}", e)))?;

        let mut body = Vec::with_capacity(data.len() + metadata_json.len() + 256);

        // Metadata part
        body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata_json.as_bytes());
        body.extend_from_slice(b"\r\n");

        // Data part
        body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");

        body.extend_from_slice(format!("--{}--", MULTIPART_BOUNDARY).as_bytes());

        let request = HttpRequest::post(format!("{}/files", DRIVE_UPLOAD_BASE))
            .bearer(token)
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])?
            .body(
                &format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
                body,
            );

        let response = self.http.send(request).await?;
        parse(classify(response, name)?)
    }

    /// Download file content.
    pub async fn download(&self, token: &str, file_id: &str) -> CallResult<Bytes> {
        let request = HttpRequest::get(format!("{}/files/{}", DRIVE_API_BASE, file_id))
            .bearer(token)
            .query(&[("alt", "media")])?;

        let response = self.http.send(request).await?;
        Ok(classify(response, file_id)?.body)
    }

    /// Delete a file.
    pub async fn delete(&self, token: &str, file_id: &str) -> CallResult<()> {
        let request =
            HttpRequest::delete(format!("{}/files/{}", DRIVE_API_BASE, file_id)).bearer(token);

        let response = self.http.send(request).await?;
        classify(response, file_id)?;
        Ok(())
    }

    pub async fn about(&self, token: &str) -> CallResult<DriveUser> {
        let request = HttpRequest::get(format!("{}/about", DRIVE_API_BASE))
            .bearer(token)
            .query(&[("fields", "user")])?;

        let response = self.http.send(request).await?;
        let about: AboutResponse = parse(classify(response, "")?)?;
        Ok(about.user)
    }
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Map a Drive response onto the provider failure classes.
fn classify(response: HttpResponse, file_id: &str) -> CallResult<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }

    let parsed = response.json::<ErrorEnvelope>().ok();
    let quota = parsed.as_ref().is_some_and(|e| {
        e.error
            .errors
            .iter()
            .any(|d| d.reason == "storageQuotaExceeded" || d.reason == "quotaExceeded")
    });
    let message = parsed
        .map(|e| e.error.message)
        .unwrap_or_else(|| response.text_snippet());

    match response.status {
        401 => Err(ProviderFailure::Unauthorized),
        403 if quota => Err(ProviderFailure::QuotaExceeded),
        404 => Err(ProviderFailure::NotFound(file_id.to_string())),
        status => Err(ProviderFailure::Api(format!("HTTP {}: {}", status, message))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(response: HttpResponse) -> CallResult<T> {
    response
        .json()
        .map_err(|e| ProviderFailure::Api(format!("Failed to parse response: {}", e)))
}
