//! Persisted storage connections for external providers.
//!
//! `CredentialStore` is the only path to the connection table. It reads and
//! writes encrypted token envelopes and never sees plaintext; callers decrypt
//! with `TokenCipher` for the span of one provider call.
//!
//! `KeyRotation` re-encrypts stored tokens under a new key version, one
//! record at a time, tolerating per-record failures.

pub mod connection;
pub mod rotation;
pub mod store;

pub use connection::{ConnectionSummary, NewConnection, StorageConnection, TokenUpdate};
pub use rotation::{KeyRotation, RotationFailure, RotationReport};
pub use store::CredentialStore;
