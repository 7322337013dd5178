//! Encryption of stored upstream credentials
//!
//! Ciphertext format: `base64(nonce):base64(ciphertext)` with a fresh 12-byte
//! nonce per value. The AES-256 key is the SHA-256 digest of the configured secret.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decryption failed")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
    #[error("decrypted credential is not valid UTF-8")]
    Utf8,
}

#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        Ok(format!("{}:{}", STANDARD.encode(nonce_bytes), STANDARD.encode(ciphertext)))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let (nonce_b64, ciphertext_b64) = encoded.split_once(':').ok_or(CryptoError::InvalidFormat)?;

        let nonce_bytes = STANDARD.decode(nonce_b64)?;
        if nonce_bytes.len() != 12 {
            return Err(CryptoError::InvalidFormat);
        }
        let ciphertext = STANDARD.decode(ciphertext_b64)?;

        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
    }
}
