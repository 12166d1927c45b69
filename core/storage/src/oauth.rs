//! OAuth2 refresh-token grant against a provider's token endpoint.

use chrono::{DateTime, Utc};
use oauth2::basic::{BasicErrorResponse, BasicErrorResponseType, BasicTokenResponse};
use oauth2::{ClientId, ClientSecret, TokenResponse};

use untitledone_common::SecretToken;

use crate::http::{HttpClient, HttpRequest};

/// Dropbox OAuth2 token endpoint.
pub const DROPBOX_TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";
/// Google OAuth2 token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Client credentials for one provider's token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: ClientId,
    pub client_secret: ClientSecret,
    pub token_url: String,
}

impl OAuthClientConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>, token_url: impl Into<String>) -> Self {
        Self {
            client_id: ClientId::new(client_id.into()),
            client_secret: ClientSecret::new(client_secret.into()),
            token_url: token_url.into(),
        }
    }

    pub fn dropbox(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self::new(client_id, client_secret, DROPBOX_TOKEN_URL)
    }

    pub fn google(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self::new(client_id, client_secret, GOOGLE_TOKEN_URL)
    }
}

/// New token material from a successful refresh.
#[derive(Debug)]
pub struct RefreshedTokens {
    pub access_token: SecretToken,
    /// Present only when the provider rotated the refresh token.
    pub refresh_token: Option<SecretToken>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Why a refresh did not produce tokens.
#[derive(Debug)]
pub enum RefreshError {
    /// The provider refused the grant; the user must reconnect.
    Rejected(String),
    /// Transport failure or an unexpected response.
    Unexpected(String),
}

/// Exchange `refresh_token` for a new access token.
pub async fn refresh_access_token(
    http: &dyn HttpClient,
    config: &OAuthClientConfig,
    refresh_token: &SecretToken,
) -> Result<RefreshedTokens, RefreshError> {
    let request = HttpRequest::post(config.token_url.as_str())
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose()),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.secret().as_str()),
        ])
        .map_err(|e| RefreshError::Unexpected(e.to_string()))?;

    let response = http
        .send(request)
        .await
        .map_err(|e| RefreshError::Unexpected(e.to_string()))?;

    if response.is_success() {
        let token: BasicTokenResponse = response
            .json()
            .map_err(|e| RefreshError::Unexpected(format!("Malformed token response: {}", e)))?;

        let expires_at = token
            .expires_in()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);

        return Ok(RefreshedTokens {
            access_token: SecretToken::new(token.access_token().secret().as_str()),
            refresh_token: token
                .refresh_token()
                .map(|t| SecretToken::new(t.secret().as_str())),
            expires_at,
        });
    }

    let parsed: Option<BasicErrorResponse> = response.json().ok();
    let code = parsed
        .as_ref()
        .map(|e| e.error().to_string())
        .unwrap_or_else(|| format!("HTTP {}", response.status));

    let invalid_grant = matches!(
        parsed.as_ref().map(|e| e.error()),
        Some(BasicErrorResponseType::InvalidGrant)
    );

    if invalid_grant || response.status == 400 || response.status == 401 {
        Err(RefreshError::Rejected(code))
    } else {
        Err(RefreshError::Unexpected(code))
    }
}
