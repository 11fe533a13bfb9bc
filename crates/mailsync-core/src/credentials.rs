//! AES-256-GCM encryption for stored mailbox credentials.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};

/// Environment variable holding the base64-encoded 32-byte key.
pub const CREDENTIAL_KEY_ENV_VAR: &str = "MAILSYNC_CREDENTIAL_KEY";

const NONCE_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Environment variable '{name}' not set")]
    KeyNotSet { name: String },

    #[error("Invalid credential key: {0}")]
    InvalidKey(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),
}

/// Encrypts and decrypts credentials. Stored form is base64 of `nonce || ciphertext`.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

impl CredentialCipher {
    pub fn from_env() -> Result<Self, CredentialError> {
        Self::from_env_var(CREDENTIAL_KEY_ENV_VAR)
    }

    pub fn from_env_var(name: &str) -> Result<Self, CredentialError> {
        let key = std::env::var(name).map_err(|_| CredentialError::KeyNotSet {
            name: name.to_string(),
        })?;
        Self::from_base64_key(key.trim())
    }

    pub fn from_base64_key(key: &str) -> Result<Self, CredentialError> {
        let bytes = STANDARD
            .decode(key)
            .map_err(|e| CredentialError::InvalidKey(format!("invalid base64: {}", e)))?;
        if bytes.len() != 32 {
            return Err(CredentialError::InvalidKey(format!(
                "key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&bytes)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Returns a fresh random key in the base64 form `from_base64_key` accepts.
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(OsRng);
        STANDARD.encode(key)
    }

    pub fn encrypt(&self, secret: &SecretString) -> Result<String, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, secret.expose_secret().as_bytes())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        let mut combined = nonce.to_vec();
        combined.extend(ciphertext);
        Ok(STANDARD.encode(combined))
    }

    pub fn decrypt(&self, stored: &str) -> Result<SecretString, CredentialError> {
        let combined = STANDARD
            .decode(stored)
            .map_err(|e| CredentialError::Decryption(format!("invalid base64: {}", e)))?;
        if combined.len() < NONCE_SIZE {
            return Err(CredentialError::Decryption(
                "ciphertext too short".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CredentialError::Decryption(e.to_string()))?;
        let text = String::from_utf8(plaintext)
            .map_err(|e| CredentialError::Decryption(format!("invalid UTF-8: {}", e)))?;
        Ok(SecretString::from(text))
    }
}
