//! Versioned token keys with secure memory handling.

use std::collections::BTreeMap;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use untitledone_common::{Error, Result};

/// Length of token encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Environment prefix for per-version keys, e.g. `STORAGE_TOKEN_ENCRYPTION_KEY_V2`.
pub const KEY_ENV_PREFIX: &str = "STORAGE_TOKEN_ENCRYPTION_KEY_";

/// Environment variable naming the version used for new encryptions.
pub const CURRENT_VERSION_ENV: &str = "STORAGE_TOKEN_ENCRYPTION_CURRENT_VERSION";

/// Version assumed when `CURRENT_VERSION_ENV` is unset.
pub const DEFAULT_VERSION: &str = "v1";

/// Symmetric key for one key version.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TokenKey {
    key: [u8; KEY_LENGTH],
}

impl TokenKey {
    /// Create a token key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Parse a hex-encoded 32-byte key.
    ///
    /// # Errors
    /// - `Config` if the input is not exactly 64 hex characters
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let mut bytes = hex::decode(encoded.trim())
            .map_err(|_| Error::Config("Token key is not valid hex".to_string()))?;

        if bytes.len() != KEY_LENGTH {
            let len = bytes.len();
            bytes.zeroize();
            return Err(Error::Config(format!(
                "Token key must be {} bytes, got {}",
                KEY_LENGTH, len
            )));
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self { key })
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenKey([REDACTED])")
    }
}

/// Immutable key configuration injected into `TokenCipher`.
///
/// Holds one key per version plus the version used for new encryptions.
#[derive(Clone)]
pub struct CipherConfig {
    current_version: String,
    keys: BTreeMap<String, TokenKey>,
}

impl CipherConfig {
    /// Start an empty configuration whose new encryptions use `current_version`.
    pub fn new(current_version: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            current_version: normalize_version(current_version.as_ref())?,
            keys: BTreeMap::new(),
        })
    }

    /// Register the key for `version`, replacing any previous key.
    pub fn with_key(mut self, version: impl AsRef<str>, key: TokenKey) -> Result<Self> {
        let version = normalize_version(version.as_ref())?;
        self.keys.insert(version, key);
        Ok(self)
    }

    /// Load keys and the current version from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load keys and the current version from `(name, value)` pairs.
    ///
    /// `STORAGE_TOKEN_ENCRYPTION_KEY_<VERSION>` registers a key under the
    /// lowercased suffix; unrelated variables are ignored.
    ///
    /// # Errors
    /// - `Config` if a key is malformed or the current version has no key
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut current = None;
        let mut keys = BTreeMap::new();

        for (name, value) in vars {
            let name = name.as_ref();
            if name == CURRENT_VERSION_ENV {
                current = Some(normalize_version(value.as_ref())?);
            } else if let Some(suffix) = name.strip_prefix(KEY_ENV_PREFIX) {
                let version = normalize_version(suffix)?;
                let key = TokenKey::from_hex(value.as_ref())
                    .map_err(|e| Error::Config(format!("{}: {}", name, e)))?;
                keys.insert(version, key);
            }
        }

        let config = Self {
            current_version: current.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            keys,
        };
        config.validate()?;

        tracing::debug!(
            current_version = %config.current_version,
            versions = config.keys.len(),
            "Loaded token encryption keys"
        );

        Ok(config)
    }

    /// Ensure the current version has a key.
    pub fn validate(&self) -> Result<()> {
        if !self.keys.contains_key(&self.current_version) {
            return Err(Error::Config(format!(
                "No token encryption key configured for current version '{}'",
                self.current_version
            )));
        }
        Ok(())
    }

    /// Version used for new encryptions.
    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// All configured versions, sorted.
    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Key registered for `version`, if any.
    pub fn key(&self, version: &str) -> Option<&TokenKey> {
        self.keys.get(version)
    }
}

impl fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherConfig")
            .field("current_version", &self.current_version)
            .field("versions", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Lowercase a version name and reject anything that would break the
/// colon-delimited envelope.
pub fn normalize_version(raw: &str) -> Result<String> {
    let version = raw.trim().to_ascii_lowercase();
    if version.is_empty() {
        return Err(Error::Config("Key version cannot be empty".to_string()));
    }
    if !version
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::Config(format!(
            "Key version '{}' may only contain letters, digits, '_' or '-'",
            version
        )));
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const KEY_B: &str = "1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100";

    #[test]
    fn test_token_key_from_hex() {
        let key = TokenKey::from_hex(KEY_A).unwrap();
        assert_eq!(key.as_bytes()[0], 0x00);
        assert_eq!(key.as_bytes()[31], 0x1f);

        assert!(TokenKey::from_hex("abcd").is_err());
        assert!(TokenKey::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_token_key_debug_is_redacted() {
        let key = TokenKey::from_hex(KEY_A).unwrap();
        assert_eq!(format!("{:?}", key), "TokenKey([REDACTED])");
    }

    #[test]
    fn test_from_vars_reads_versions_and_current() {
        let config = CipherConfig::from_vars(vec![
            ("STORAGE_TOKEN_ENCRYPTION_KEY_V1", KEY_A),
            ("STORAGE_TOKEN_ENCRYPTION_KEY_V2", KEY_B),
            ("STORAGE_TOKEN_ENCRYPTION_CURRENT_VERSION", "V2"),
            ("PATH", "/usr/bin"),
        ])
        .unwrap();

        assert_eq!(config.current_version(), "v2");
        assert_eq!(config.versions().collect::<Vec<_>>(), vec!["v1", "v2"]);
        assert!(config.key("v1").is_some());
        assert!(config.key("v3").is_none());
    }

    #[test]
    fn test_from_vars_defaults_to_v1() {
        let config =
            CipherConfig::from_vars(vec![("STORAGE_TOKEN_ENCRYPTION_KEY_V1", KEY_A)]).unwrap();
        assert_eq!(config.current_version(), DEFAULT_VERSION);
    }

    #[test]
    fn test_missing_current_key_is_config_error() {
        let result = CipherConfig::from_vars(vec![
            ("STORAGE_TOKEN_ENCRYPTION_KEY_V1", KEY_A),
            ("STORAGE_TOKEN_ENCRYPTION_CURRENT_VERSION", "v2"),
        ]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_key_error_does_not_echo_value() {
        let result = CipherConfig::from_vars(vec![("STORAGE_TOKEN_ENCRYPTION_KEY_V1", "deadbeef")]);
        match result {
            Err(Error::Config(message)) => {
                assert!(message.contains("STORAGE_TOKEN_ENCRYPTION_KEY_V1"));
                assert!(!message.contains("deadbeef"));
            }
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_version_with_colon_rejected() {
        assert!(CipherConfig::new("v:1").is_err());
        assert!(CipherConfig::new("").is_err());
    }
}
