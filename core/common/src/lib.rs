//! Common types shared across the UntitledOne storage core.
//!
//! This module provides the error taxonomy surfaced at the storage boundary
//! and the small value types every other crate speaks in.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ConnectionStatus, ProviderKind, SecretToken, UploadResult, UserId};
