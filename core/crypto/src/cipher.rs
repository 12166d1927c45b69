//! Versioned AES-256-GCM encryption of OAuth tokens.
//!
//! Encrypted tokens are stored as `version:iv:authTag:ciphertext`, each of
//! the last three segments hex-encoded. The version selects the key on
//! decryption, independent of the configured current version.

use aes_gcm::{
    aead::{consts::U16, generic_array::GenericArray, AeadCore, AeadInPlace, KeyInit, OsRng},
    aes::Aes256,
    AesGcm,
};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

use untitledone_common::{Error, Result, SecretToken};

use crate::keys::{CipherConfig, TokenKey};

/// AES-256-GCM with a 16-byte IV.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// IV size in bytes.
pub const IV_SIZE: usize = 16;

/// Authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Parsed `version:iv:authTag:ciphertext` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedToken {
    version: String,
    iv: [u8; IV_SIZE],
    tag: [u8; TAG_SIZE],
    ciphertext: Vec<u8>,
}

impl EncryptedToken {
    /// Parse an envelope without touching any key.
    ///
    /// # Errors
    /// - `Format` if there are not exactly 4 segments, the version is empty,
    ///   a segment is not hex, or the IV/tag has the wrong length
    pub fn parse(encoded: &str) -> Result<Self> {
        let segments: Vec<&str> = encoded.split(':').collect();
        if segments.len() != 4 {
            return Err(Error::Format(format!(
                "expected 4 colon-delimited segments, found {}",
                segments.len()
            )));
        }

        let version = segments[0];
        if version.is_empty() {
            return Err(Error::Format("missing key version".to_string()));
        }

        let iv = decode_fixed::<IV_SIZE>(segments[1], "iv")?;
        let tag = decode_fixed::<TAG_SIZE>(segments[2], "auth tag")?;
        let ciphertext = hex::decode(segments[3])
            .map_err(|_| Error::Format("ciphertext is not valid hex".to_string()))?;

        Ok(Self {
            version: version.to_string(),
            iv,
            tag,
            ciphertext,
        })
    }

    /// Key version this token was encrypted under.
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl FromStr for EncryptedToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for EncryptedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.version,
            hex::encode(self.iv),
            hex::encode(self.tag),
            hex::encode(&self.ciphertext)
        )
    }
}

fn decode_fixed<const N: usize>(segment: &str, what: &str) -> Result<[u8; N]> {
    let bytes =
        hex::decode(segment).map_err(|_| Error::Format(format!("{} is not valid hex", what)))?;
    if bytes.len() != N {
        return Err(Error::Format(format!(
            "{} must be {} bytes, got {}",
            what,
            N,
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Encrypts and decrypts OAuth tokens against a versioned key registry.
#[derive(Debug, Clone)]
pub struct TokenCipher {
    config: CipherConfig,
}

impl TokenCipher {
    /// Create a cipher over an explicit key configuration.
    ///
    /// # Errors
    /// - `Config` if the current version has no key
    pub fn new(config: CipherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Version used by `encrypt`.
    pub fn current_version(&self) -> &str {
        self.config.current_version()
    }

    /// Whether a key is configured for `version`.
    pub fn has_version(&self, version: &str) -> bool {
        self.config.key(version).is_some()
    }

    /// Encrypt under the current key version.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        self.encrypt_with_version(plaintext, self.config.current_version())
    }

    /// Encrypt under a specific key version.
    ///
    /// # Postconditions
    /// - Returns `version:iv:authTag:ciphertext` with a fresh random IV
    ///
    /// # Errors
    /// - `Config` if no key exists for `version`
    pub fn encrypt_with_version(&self, plaintext: &str, version: &str) -> Result<String> {
        let key = self.key_for(version)?;
        let cipher = new_cipher(key)?;
        let iv = Aes256Gcm16::generate_nonce(&mut OsRng);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(&iv, b"", &mut buffer)
            .map_err(|_| Error::InvalidInput("token too large to encrypt".to_string()))?;

        let mut iv_bytes = [0u8; IV_SIZE];
        iv_bytes.copy_from_slice(&iv);
        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(&tag);

        let token = EncryptedToken {
            version: version.to_string(),
            iv: iv_bytes,
            tag: tag_bytes,
            ciphertext: buffer,
        };
        Ok(token.to_string())
    }

    /// Decrypt an envelope using the key named by its embedded version.
    ///
    /// # Errors
    /// - `Format` for a malformed envelope (checked before any key lookup)
    /// - `Config` if the embedded version has no key
    /// - `Decryption` on tag mismatch or non-UTF-8 plaintext
    pub fn decrypt(&self, encrypted: &str) -> Result<SecretToken> {
        let token = EncryptedToken::parse(encrypted)?;
        self.decrypt_token(&token)
    }

    /// Decrypt an already parsed envelope.
    pub fn decrypt_token(&self, token: &EncryptedToken) -> Result<SecretToken> {
        let key = self.key_for(&token.version)?;
        let cipher = new_cipher(key)?;

        let mut buffer = token.ciphertext.clone();
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&token.iv),
                b"",
                &mut buffer,
                GenericArray::from_slice(&token.tag),
            )
            .map_err(|_| {
                Error::Decryption("authentication tag mismatch (wrong key or tampered data)".to_string())
            })?;

        match String::from_utf8(buffer) {
            Ok(plaintext) => Ok(SecretToken::new(plaintext)),
            Err(err) => {
                err.into_bytes().zeroize();
                Err(Error::Decryption("plaintext is not valid UTF-8".to_string()))
            }
        }
    }

    fn key_for(&self, version: &str) -> Result<&TokenKey> {
        self.config.key(version).ok_or_else(|| {
            Error::Config(format!("No token encryption key for version '{}'", version))
        })
    }
}

fn new_cipher(key: &TokenKey) -> Result<Aes256Gcm16> {
    Aes256Gcm16::new_from_slice(key.as_bytes())
        .map_err(|_| Error::Config("Invalid token key length".to_string()))
}
