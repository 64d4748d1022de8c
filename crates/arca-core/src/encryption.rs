//! Encryption of peer authenticators at rest.
//!
//! The symmetric key is read once at startup from a file (64 hex chars =
//! 32 bytes) and held in memory for the lifetime of the process. Plaintext
//! credentials exist only transiently, at call time.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

use crate::error::{CoreError, Result};

#[derive(Clone)]
pub struct CredentialKey {
    key: [u8; 32],
}

impl CredentialKey {
    /// Load the key from a file containing 64 hex characters (surrounding
    /// whitespace ignored).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Credential(format!("read key file '{}': {e}", path.display())))?;
        Self::from_hex(raw.trim())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| CoreError::Credential(format!("key is not valid hex: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::Credential("key must be exactly 32 bytes".into()))?;
        Ok(Self { key })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&self.key).expect("valid 32-byte key for AES-256-GCM")
    }

    /// Encrypt a credential string. Output is base64 of
    /// `[12-byte nonce][ciphertext with appended 16-byte tag]`.
    pub fn encrypt_string(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CoreError::Credential(format!("AES-GCM encrypt: {e}")))?;

        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt_string(&self, encoded: &str) -> Result<String> {
        let data = BASE64
            .decode(encoded)
            .map_err(|_| CoreError::Credential("stored credential is not valid base64".into()))?;
        if data.len() < 12 + 16 {
            return Err(CoreError::Credential("stored credential is truncated".into()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher()
            .decrypt(nonce, ciphertext)
            .map_err(|_| CoreError::Credential("credential decryption failed".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| CoreError::Credential("decrypted credential is not UTF-8".into()))
    }
}
