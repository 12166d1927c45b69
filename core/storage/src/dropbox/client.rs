//! Dropbox API v2 client.

use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;

use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::retry::{CallResult, ProviderFailure};

/// RPC endpoint base.
const API_BASE: &str = "https://api.dropboxapi.com/2";
/// Content upload/download endpoint base.
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

/// File metadata returned by `files/upload`.
#[derive(Debug, Clone, Deserialize)]
pub struct DropboxFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub path_display: Option<String>,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TemporaryLink {
    link: String,
}

/// Subset of `users/get_current_account`.
#[derive(Debug, Clone, Deserialize)]
pub struct DropboxAccount {
    pub account_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_summary: String,
}

/// Dropbox HTTP API client. Each call takes the bearer token explicitly.
pub struct DropboxClient {
    http: Arc<dyn HttpClient>,
}

impl DropboxClient {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }

    /// Upload a file, renaming on conflict.
    pub async fn upload(&self, token: &str, path: &str, data: Bytes) -> CallResult<DropboxFile> {
        let arg = serde_json::json!({
            "path": path,
            "mode": "add",
            "autorename": true,
            "mute": false,
        });
        let request = HttpRequest::post(format!("{}/files/upload", CONTENT_BASE))
            .bearer(token)
            .header("Dropbox-API-Arg", api_arg(&arg)?)
            .body("application/octet-stream", data);

        let response = self.http.send(request).await?;
        parse(classify(response, path)?)
    }

    /// Short-lived direct link. Dropbox fixes the lifetime at four hours.
    pub async fn temporary_link(&self, token: &str, file_id: &str) -> CallResult<String> {
        let request = HttpRequest::post(format!("{}/files/get_temporary_link", API_BASE))
            .bearer(token)
            .json(&serde_json::json!({ "path": file_id }))?;

        let response = self.http.send(request).await?;
        let link: TemporaryLink = parse(classify(response, file_id)?)?;
        Ok(link.link)
    }

    pub async fn download(&self, token: &str, file_id: &str) -> CallResult<Bytes> {
        let arg = serde_json::json!({ "path": file_id });
        let request = HttpRequest::post(format!("{}/files/download", CONTENT_BASE))
            .bearer(token)
            .header("Dropbox-API-Arg", api_arg(&arg)?);

        let response = self.http.send(request).await?;
        Ok(classify(response, file_id)?.body)
    }

    pub async fn delete(&self, token: &str, file_id: &str) -> CallResult<()> {
        let request = HttpRequest::post(format!("{}/files/delete_v2", API_BASE))
            .bearer(token)
            .json(&serde_json::json!({ "path": file_id }))?;

        let response = self.http.send(request).await?;
        classify(response, file_id)?;
        Ok(())
    }

    pub async fn current_account(&self, token: &str) -> CallResult<DropboxAccount> {
        let request =
            HttpRequest::post(format!("{}/users/get_current_account", API_BASE)).bearer(token);

        let response = self.http.send(request).await?;
        parse(classify(response, "")?)
    }
}

/// JSON for the `Dropbox-API-Arg` header with non-ASCII escaped as `\uXXXX`.
///
/// HTTP header values must be ASCII, so characters outside it are written
/// as UTF-16 escapes, surrogate pairs included.
pub fn api_arg(value: &serde_json::Value) -> CallResult<String> {
    let json = serde_json::to_string(value)
        .map_err(|e| ProviderFailure::Api(format!("Failed to encode API arg: {}", e)))?;

    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(out)
}

/// Map a Dropbox response onto the provider failure classes.
fn classify(response: HttpResponse, file_id: &str) -> CallResult<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }

    let summary = response
        .json::<ApiError>()
        .map(|e| e.error_summary)
        .unwrap_or_else(|_| response.text_snippet());

    match response.status {
        401 => Err(ProviderFailure::Unauthorized),
        507 => Err(ProviderFailure::QuotaExceeded),
        409 if summary.contains("insufficient_space") => Err(ProviderFailure::QuotaExceeded),
        409 if summary.contains("not_found") => Err(ProviderFailure::NotFound(file_id.to_string())),
        status => Err(ProviderFailure::Api(format!("HTTP {}: {}", status, summary))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(response: HttpResponse) -> CallResult<T> {
    response
        .json()
        .map_err(|e| ProviderFailure::Api(format!("Failed to parse response: {}", e)))
}
