//! At-rest secret encryption.
//!
//! Secret columns hold either the empty string or a self-describing token
//! `enc:v1:<iv_b64>:<ciphertext_b64>` (ciphertext includes the GCM tag).
//! The version prefix lets writers detect already-encrypted values and
//! makes key rotation an append of `enc:v2:` rather than a rewrite.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

const TOKEN_PREFIX: &str = "enc:v1:";

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("malformed token: {0}")]
    Format(String),

    #[error("decryption failed (wrong key or corrupt ciphertext)")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("key unwrap failed")]
    Unwrap,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-wide at-rest cipher. Key material is derived once at startup
/// and read-only afterwards.
#[derive(Clone)]
pub struct StorageVault {
    key: [u8; 32],
}

impl StorageVault {
    pub fn new(data_secret: &str) -> Self {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(data_secret.as_bytes()));
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        // 32-byte key, cannot fail
        Aes256Gcm::new_from_slice(&self.key).unwrap_or_else(|_| unreachable!())
    }

    /// Encrypt a plaintext secret into a versioned token. Empty input and
    /// already-encrypted tokens pass through unchanged.
    pub fn encrypt_storage(&self, plaintext: &str, aad: Option<&str>) -> Result<String, VaultError> {
        if plaintext.is_empty() || plaintext.starts_with(TOKEN_PREFIX) {
            return Ok(plaintext.to_string());
        }

        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let payload = Payload {
            msg: plaintext.as_bytes(),
            aad: aad.unwrap_or("").as_bytes(),
        };
        let ciphertext = self
            .cipher()
            .encrypt(nonce, payload)
            .map_err(|_| VaultError::Encrypt)?;

        Ok(format!(
            "{}{}:{}",
            TOKEN_PREFIX,
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext)
        ))
    }

    /// Decrypt a versioned token. Empty input stays empty; values without
    /// the token prefix are returned as-is (pre-vault rows).
    pub fn decrypt_storage(&self, token: &str, aad: Option<&str>) -> Result<String, VaultError> {
        if token.is_empty() || !token.starts_with(TOKEN_PREFIX) {
            return Ok(token.to_string());
        }

        let body = &token[TOKEN_PREFIX.len()..];
        let (iv_b64, ct_b64) = body
            .split_once(':')
            .ok_or_else(|| VaultError::Format("missing iv separator".into()))?;

        let nonce_bytes = BASE64
            .decode(iv_b64)
            .map_err(|e| VaultError::Format(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(VaultError::Format("iv must be 12 bytes".into()));
        }
        let ciphertext = BASE64
            .decode(ct_b64)
            .map_err(|e| VaultError::Format(e.to_string()))?;

        let nonce = Nonce::from_slice(&nonce_bytes);
        let payload = Payload {
            msg: ciphertext.as_ref(),
            aad: aad.unwrap_or("").as_bytes(),
        };
        let plaintext = self
            .cipher()
            .decrypt(nonce, payload)
            .map_err(|_| VaultError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|e| VaultError::Format(e.to_string()))
    }

    /// True if the value is already a vault token.
    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(TOKEN_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let vault = StorageVault::new("unit-test-data-secret");
        let token = vault.encrypt_storage("binance-api-key-123", None).unwrap();
        assert!(token.starts_with("enc:v1:"));
        assert_ne!(token, "binance-api-key-123");
        assert_eq!(
            vault.decrypt_storage(&token, None).unwrap(),
            "binance-api-key-123"
        );
    }

    #[test]
    fn empty_passthrough() {
        let vault = StorageVault::new("unit-test-data-secret");
        assert_eq!(vault.encrypt_storage("", None).unwrap(), "");
        assert_eq!(vault.decrypt_storage("", None).unwrap(), "");
    }

    #[test]
    fn double_encrypt_is_identity() {
        let vault = StorageVault::new("unit-test-data-secret");
        let once = vault.encrypt_storage("secret", None).unwrap();
        let twice = vault.encrypt_storage(&once, None).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn wrong_key_fails_distinctly() {
        let a = StorageVault::new("key-a");
        let b = StorageVault::new("key-b");
        let token = a.encrypt_storage("secret", None).unwrap();
        match b.decrypt_storage(&token, None) {
            Err(VaultError::Decrypt) => {}
            other => panic!("expected Decrypt error, got {other:?}"),
        }
    }

    #[test]
    fn aad_mismatch_fails() {
        let vault = StorageVault::new("unit-test-data-secret");
        let token = vault.encrypt_storage("secret", Some("user-1")).unwrap();
        assert!(vault.decrypt_storage(&token, Some("user-2")).is_err());
        assert_eq!(
            vault.decrypt_storage(&token, Some("user-1")).unwrap(),
            "secret"
        );
    }

    #[test]
    fn legacy_plaintext_passthrough() {
        let vault = StorageVault::new("unit-test-data-secret");
        assert_eq!(
            vault.decrypt_storage("not-a-token", None).unwrap(),
            "not-a-token"
        );
    }

    #[test]
    fn nonces_differ_between_calls() {
        let vault = StorageVault::new("unit-test-data-secret");
        let a = vault.encrypt_storage("same", None).unwrap();
        let b = vault.encrypt_storage("same", None).unwrap();
        assert_ne!(a, b);
    }
}
