//! Dropbox storage provider.
//!
//! Files live under the app folder (`/UntitledOne/...`); uploads never
//! overwrite and are renamed by Dropbox on conflict. Access tokens are
//! short-lived and refreshed lazily on the first 401.

mod client;
mod provider;

pub use provider::DropboxAdapter;
