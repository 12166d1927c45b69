//! Google Drive storage provider.
//!
//! This module provides a storage backend using Google Drive with:
//! - Multipart `files.create` uploads into the app folder
//! - App folder lookup by name, created on first upload
//! - Lazy OAuth2 refresh on the first 401

mod client;
mod provider;

pub use provider::GoogleDriveAdapter;
