//! Field-level encryption for protected identity data.
//!
//! Single string values are sealed with AES-256-GCM under one process-wide
//! key. Each call draws a fresh random 12-byte nonce; the stored token is
//! `base64(nonce || ciphertext || tag)` and is opaque to every consumer.
//!
//! # Security
//!
//! - The key must decode to exactly 32 bytes and is never logged; only a
//!   SHA-256 fingerprint is exposed for identification.
//! - Decryption verifies the GCM tag. A wrong key, truncation or tampering
//!   yields [`CipherError::Decryption`], never garbage plaintext.
//! - The cipher holds no mutable state beyond the immutable key, so it is
//!   safe to share across request threads without locking.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Required decoded key length (AES-256).
pub const KEY_LEN: usize = 32;

/// GCM nonce length prefixed to every token.
const NONCE_LEN: usize = 12;

/// Secure sources for the encryption key, highest precedence first:
/// - `NUTRIGUARD_ENCRYPTION_KEY_FD` (read from an already-open FD, then close it)
/// - `NUTRIGUARD_ENCRYPTION_KEY_FILE` (read from a file path)
/// - `/run/secrets/nutriguard_encryption_key` (Docker/Compose secret default)
///
/// In release builds, reading the key from an environment variable is refused.
const KEY_FD_ENV: &str = "NUTRIGUARD_ENCRYPTION_KEY_FD";
const KEY_FILE_ENV: &str = "NUTRIGUARD_ENCRYPTION_KEY_FILE";
const KEY_DOCKER_SECRET_PATH: &str = "/run/secrets/nutriguard_encryption_key";

// Dev-only escape hatch for local runs and tests.
const KEY_ENV_DEV: &str = "NUTRIGUARD_ENCRYPTION_KEY";

/// Error type for field encryption operations.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Fatal at startup: no code path touching protected identity data may
    /// run without a valid key.
    #[error("encryption key misconfigured: {0}")]
    KeyConfiguration(String),

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: authentication tag mismatch or corrupted token")]
    Decryption,
}

/// Stateless AEAD codec for single protected field values.
pub struct FieldCipher {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl FieldCipher {
    /// Build a cipher from raw key bytes.
    #[must_use]
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        let fingerprint = fingerprint(key);
        let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key is valid for AES-256");
        Self {
            cipher,
            fingerprint,
        }
    }

    /// Build a cipher from a base64-encoded key.
    ///
    /// # Errors
    /// Returns [`CipherError::KeyConfiguration`] if the value is not valid
    /// base64 or does not decode to exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let decoded = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|_| CipherError::KeyConfiguration("key is not valid base64".into()))?,
        );

        if decoded.len() != KEY_LEN {
            return Err(CipherError::KeyConfiguration(format!(
                "key must decode to exactly {KEY_LEN} bytes, got {}",
                decoded.len()
            )));
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&decoded);
        Ok(Self::new(&key))
    }

    /// Load the key from a secure out-of-band source and build the cipher.
    ///
    /// # Errors
    /// Returns [`CipherError::KeyConfiguration`] if no source provides a
    /// key or the key has the wrong shape. Callers should treat this as a
    /// fatal startup error.
    pub fn from_secret_sources() -> Result<Self, CipherError> {
        let encoded = read_key_material()?;
        Self::from_base64(&encoded)
    }

    /// SHA-256 based key fingerprint (safe to log; not key material).
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Encrypt a single field value.
    ///
    /// `None` and empty input map to `Ok(None)`: encryption is never
    /// applied to absent data.
    ///
    /// # Errors
    /// Returns [`CipherError::Encryption`] if the AEAD operation fails.
    pub fn encrypt(&self, plaintext: Option<&str>) -> Result<Option<String>, CipherError> {
        let plaintext = match plaintext {
            Some(p) if !p.is_empty() => p,
            _ => return Ok(None),
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encryption)?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);
        Ok(Some(BASE64.encode(token)))
    }

    /// Decrypt a token produced by [`encrypt`](Self::encrypt).
    ///
    /// `None` and empty input map to `Ok(None)`.
    ///
    /// # Errors
    /// Returns [`CipherError::Decryption`] on tag mismatch, truncation or
    /// any other corruption. Partial plaintext is never returned.
    pub fn decrypt(&self, token: Option<&str>) -> Result<Option<String>, CipherError> {
        let token = match token {
            Some(t) if !t.is_empty() => t,
            _ => return Ok(None),
        };

        let bytes = BASE64.decode(token).map_err(|_| CipherError::Decryption)?;
        if bytes.len() < NONCE_LEN {
            return Err(CipherError::Decryption);
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::Decryption)?;

        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| CipherError::Decryption)
    }
}

// Intentionally NOT deriving Debug to prevent accidental key leakage.
impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Read the base64 key material from the highest-precedence secure source.
fn read_key_material() -> Result<Zeroizing<String>, CipherError> {
    // 1) Read from an already-open FD (systemd/K8s sidecar style).
    #[cfg(unix)]
    if let Ok(fd_str) = std::env::var(KEY_FD_ENV) {
        use std::io::Read;
        use std::os::unix::io::FromRawFd;

        let fd: i32 = fd_str
            .trim()
            .parse()
            .map_err(|_| CipherError::KeyConfiguration(format!("{KEY_FD_ENV} is not a number")))?;
        if fd <= 2 {
            // Refuse stdio FDs.
            return Err(CipherError::KeyConfiguration(format!(
                "{KEY_FD_ENV} must not point at stdio"
            )));
        }

        // SAFETY: we take ownership of the FD for a one-time secret read and close it.
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .map_err(|e| CipherError::KeyConfiguration(e.to_string()))?;
        return non_empty(buf, KEY_FD_ENV);
    }

    // 2) Read from an explicit file path.
    if let Ok(path) = std::env::var(KEY_FILE_ENV) {
        let content = std::fs::read_to_string(path.trim())
            .map_err(|e| CipherError::KeyConfiguration(e.to_string()))?;
        return non_empty(content, KEY_FILE_ENV);
    }

    // 3) Docker secrets default path.
    if std::path::Path::new(KEY_DOCKER_SECRET_PATH).exists() {
        let content = std::fs::read_to_string(KEY_DOCKER_SECRET_PATH)
            .map_err(|e| CipherError::KeyConfiguration(e.to_string()))?;
        return non_empty(content, KEY_DOCKER_SECRET_PATH);
    }

    // 4) Dev-only env var (refused in release builds).
    if cfg!(debug_assertions) {
        if let Ok(v) = std::env::var(KEY_ENV_DEV) {
            return non_empty(v, KEY_ENV_DEV);
        }
    }

    Err(CipherError::KeyConfiguration(format!(
        "no encryption key found: provide {KEY_FD_ENV} or {KEY_FILE_ENV} (or mount {KEY_DOCKER_SECRET_PATH})"
    )))
}

fn non_empty(raw: String, source: &str) -> Result<Zeroizing<String>, CipherError> {
    let trimmed = raw.trim_end_matches(['\n', '\r']).to_string();
    if trimmed.is_empty() {
        return Err(CipherError::KeyConfiguration(format!(
            "key from {source} is empty"
        )));
    }
    Ok(Zeroizing::new(trimmed))
}

/// First 8 bytes of SHA-256 over the key, hex-encoded. The hash of the key
/// is safe to log; raw key material is not.
fn fingerprint(key: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(key);
    let digest = hasher.finalize();

    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
