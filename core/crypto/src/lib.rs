//! Token encryption for stored OAuth credentials.
//!
//! This module provides:
//! - A versioned key registry sourced from environment-bound secrets
//! - AES-256-GCM encryption producing `version:iv:authTag:ciphertext` strings
//! - Decryption that selects the key by the embedded version, so several
//!   key generations can coexist while a rotation is in flight
//!
//! # Security Guarantees
//! - Key material is zeroized on drop and never rendered by `Debug`
//! - Decrypted tokens are returned as `SecretToken`, which zeroizes on drop
//! - A tag mismatch is always an error, never a corrupted plaintext

pub mod cipher;
pub mod keys;

pub use cipher::{EncryptedToken, TokenCipher};
pub use keys::{normalize_version, CipherConfig, TokenKey};
