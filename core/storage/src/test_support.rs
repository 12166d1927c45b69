//! Scripted HTTP client and seeded credential fixtures for adapter tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use untitledone_common::{ProviderKind, UserId};
use untitledone_credentials::{CredentialStore, NewConnection, StorageConnection};
use untitledone_crypto::{CipherConfig, TokenCipher, TokenKey};

use crate::http::{HttpClient, HttpRequest, HttpResponse, TransportError};

/// Replays queued responses in order and records every request.
#[derive(Default)]
pub(crate) struct ScriptedHttpClient {
    responses: Mutex<VecDeque<Result<HttpResponse, String>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: HttpResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_json(&self, status: u16, body: serde_json::Value) {
        self.push(HttpResponse::new(status, body.to_string()));
    }

    pub fn push_transport_error(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count_matching(&self, url_fragment: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.contains(url_fragment))
            .count()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.url.clone();
        self.requests.lock().unwrap().push(request);
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(TransportError(message)),
            None => panic!("no scripted response left for {}", url),
        }
    }
}

pub(crate) fn test_cipher() -> Arc<TokenCipher> {
    let config = CipherConfig::new("v1")
        .unwrap()
        .with_key("v1", TokenKey::from_bytes([9u8; 32]))
        .unwrap();
    Arc::new(TokenCipher::new(config).unwrap())
}

/// In-memory store holding one connection with access token `stale`.
pub(crate) struct Fixture {
    pub store: Arc<CredentialStore>,
    pub cipher: Arc<TokenCipher>,
    pub user: UserId,
    pub provider: ProviderKind,
}

impl Fixture {
    pub async fn connection(&self) -> StorageConnection {
        self.store
            .get_connection(&self.user, self.provider)
            .await
            .unwrap()
            .unwrap()
    }
}

pub(crate) async fn seeded(provider: ProviderKind, refresh_token: Option<&str>) -> Fixture {
    let store = Arc::new(CredentialStore::in_memory().unwrap());
    let cipher = test_cipher();
    let user = UserId::new("owner-1").unwrap();

    let new = NewConnection::sealed(
        &cipher,
        user.clone(),
        provider,
        "acct-1",
        Some("Owner".to_string()),
        "stale",
        refresh_token,
        None,
    )
    .unwrap();
    store.upsert_connection(&new).await.unwrap();

    Fixture {
        store,
        cipher,
        user,
        provider,
    }
}
