//! In-transit credential envelopes.
//!
//! Browsers fetch the RSA public key, AEAD-encrypt the JSON payload under
//! a random session key and RSA-wrap that key. The server unwraps and
//! decrypts; secret fields are re-encrypted with the at-rest vault before
//! they touch the store.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::storage::VaultError;

/// Wire format accepted by credential-update endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportEnvelope {
    pub wrapped_key_b64: String,
    pub iv_b64: String,
    pub ciphertext_b64: String,
}

/// Server half of the transport scheme. The private key is loaded once at
/// startup and read-only afterwards.
#[derive(Clone)]
pub struct TransportVault {
    private_key: RsaPrivateKey,
    public_pem: String,
}

impl TransportVault {
    pub fn from_pem_file(path: &str) -> Result<Self, VaultError> {
        let pem = std::fs::read_to_string(path)?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| VaultError::Format(format!("rsa private key: {e}")))?;
        Self::from_key(private_key)
    }

    /// Fresh 2048-bit keypair. Used by tests and first-run provisioning.
    pub fn generate() -> Result<Self, VaultError> {
        let mut rng = rand::thread_rng();
        let private_key =
            RsaPrivateKey::new(&mut rng, 2048).map_err(|_| VaultError::Encrypt)?;
        Self::from_key(private_key)
    }

    fn from_key(private_key: RsaPrivateKey) -> Result<Self, VaultError> {
        let public_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| VaultError::Format(format!("rsa public pem: {e}")))?;
        Ok(Self {
            private_key,
            public_pem,
        })
    }

    /// PEM served on `GET /api/crypto/public-key`.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Unwrap the session key and decrypt the payload. Returns the inner
    /// JSON text. Unwrap and payload failures are distinct errors so the
    /// API can report which layer broke.
    pub fn open_envelope(&self, envelope: &TransportEnvelope) -> Result<String, VaultError> {
        let wrapped = BASE64
            .decode(&envelope.wrapped_key_b64)
            .map_err(|e| VaultError::Format(e.to_string()))?;
        let nonce_bytes = BASE64
            .decode(&envelope.iv_b64)
            .map_err(|e| VaultError::Format(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(VaultError::Format("iv must be 12 bytes".into()));
        }
        let ciphertext = BASE64
            .decode(&envelope.ciphertext_b64)
            .map_err(|e| VaultError::Format(e.to_string()))?;

        let session_key = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &wrapped)
            .map_err(|_| VaultError::Unwrap)?;
        if session_key.len() != 32 {
            return Err(VaultError::Unwrap);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&session_key).map_err(|_| VaultError::Unwrap)?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| VaultError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|e| VaultError::Format(e.to_string()))
    }
}

/// Client-side sealing. Production callers are browsers; tests and the
/// provisioning CLI use this to build valid envelopes.
pub fn seal_envelope(public_pem: &str, payload: &str) -> Result<TransportEnvelope, VaultError> {
    use rsa::pkcs8::DecodePublicKey;

    let public_key = RsaPublicKey::from_public_key_pem(public_pem)
        .map_err(|e| VaultError::Format(format!("rsa public key: {e}")))?;

    let session_key: [u8; 32] = rand::random();
    let nonce_bytes: [u8; 12] = rand::random();

    let cipher =
        Aes256Gcm::new_from_slice(&session_key).map_err(|_| VaultError::Encrypt)?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, payload.as_bytes())
        .map_err(|_| VaultError::Encrypt)?;

    let mut rng = rand::thread_rng();
    let wrapped = public_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &session_key)
        .map_err(|_| VaultError::Encrypt)?;

    Ok(TransportEnvelope {
        wrapped_key_b64: BASE64.encode(wrapped),
        iv_b64: BASE64.encode(nonce_bytes),
        ciphertext_b64: BASE64.encode(ciphertext),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_round_trip() {
        let vault = TransportVault::generate().unwrap();
        let payload = r#"{"api_key":"ABC","secret_key":"DEF"}"#;
        let envelope = seal_envelope(vault.public_key_pem(), payload).unwrap();
        assert_eq!(vault.open_envelope(&envelope).unwrap(), payload);
    }

    #[test]
    fn wrong_recipient_fails_at_unwrap() {
        let alice = TransportVault::generate().unwrap();
        let mallory = TransportVault::generate().unwrap();
        let envelope = seal_envelope(alice.public_key_pem(), "{}").unwrap();
        match mallory.open_envelope(&envelope) {
            Err(VaultError::Unwrap) => {}
            other => panic!("expected Unwrap error, got {other:?}"),
        }
    }

    #[test]
    fn tampered_ciphertext_fails_at_decrypt() {
        let vault = TransportVault::generate().unwrap();
        let mut envelope = seal_envelope(vault.public_key_pem(), "{}").unwrap();
        let mut raw = BASE64.decode(&envelope.ciphertext_b64).unwrap();
        raw[0] ^= 0xFF;
        envelope.ciphertext_b64 = BASE64.encode(raw);
        match vault.open_envelope(&envelope) {
            Err(VaultError::Decrypt) => {}
            other => panic!("expected Decrypt error, got {other:?}"),
        }
    }

    #[test]
    fn garbage_base64_is_a_format_error() {
        let vault = TransportVault::generate().unwrap();
        let envelope = TransportEnvelope {
            wrapped_key_b64: "!!!".into(),
            iv_b64: String::new(),
            ciphertext_b64: String::new(),
        };
        assert!(matches!(
            vault.open_envelope(&envelope),
            Err(VaultError::Format(_))
        ));
    }
}
