//! Storage provider adapters for UntitledOne.
//!
//! One contract, [`StorageProvider`], implemented by the local filesystem,
//! Dropbox and Google Drive. Callers obtain adapters through
//! [`StorageProviderFactory`], which only hands out an external adapter when
//! the user's stored connection is active.
//!
//! # Design Principles
//! - Tokens live encrypted in the credential store and are decrypted per call
//! - An expired access token is refreshed lazily on the first 401, once
//! - Provider failures surface as the shared error taxonomy
//! - Outbound HTTP goes through the injectable [`HttpClient`] capability

pub mod config;
pub mod dropbox;
pub mod factory;
pub mod gdrive;
pub mod http;
pub mod local;
pub mod oauth;
pub mod provider;
mod retry;

#[cfg(test)]
mod test_support;

pub use config::{LocalConfig, StorageConfig};
pub use dropbox::DropboxAdapter;
pub use factory::StorageProviderFactory;
pub use gdrive::GoogleDriveAdapter;
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestHttpClient, TransportError};
pub use local::LocalStorageAdapter;
pub use oauth::OAuthClientConfig;
pub use provider::{DownloadTarget, StorageProvider, UploadFile, DEFAULT_DOWNLOAD_URL_TTL};
