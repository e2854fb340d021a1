use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

use crate::error::{Result, SyncError};
use crate::settings::VaultConfig;

const MASTER_KEY_ENV: &str = "MAILSPOOL_MASTER_KEY";
const NONCE_LEN: usize = 12;

/// Ciphertext plus the nonce it was sealed with. The nonce is generated
/// inside [`Vault::encrypt`] and never supplied by a caller, so a nonce can
/// never be reused with the same key.
#[derive(Debug, Clone)]
pub struct EncryptedSecret {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Symmetric vault for stored mailbox credentials. Holds the process-wide
/// AES-256-GCM cipher; plaintext secrets never touch persistent storage.
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    pub fn new(master_key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(master_key).map_err(|_| {
            SyncError::configuration(format!(
                "master key must be 32 bytes, got {}",
                master_key.len()
            ))
        })?;
        Ok(Vault { cipher })
    }

    /// Loads the master key from the environment or the settings file.
    /// A missing or undecodable key is a fatal configuration error.
    pub fn from_settings(config: &VaultConfig) -> Result<Self> {
        let encoded = match std::env::var(MASTER_KEY_ENV) {
            Ok(value) => value,
            Err(_) => config.master_key.clone().ok_or_else(|| {
                SyncError::configuration(format!(
                    "no vault master key: set {} or vault.master_key",
                    MASTER_KEY_ENV
                ))
            })?,
        };
        let key_bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| SyncError::configuration(format!("master key is not valid base64: {}", e)))?;
        Vault::new(&key_bytes)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SyncError::credential("failed to encrypt credential"))?;

        Ok(EncryptedSecret {
            ciphertext,
            nonce: nonce_bytes.to_vec(),
        })
    }

    /// Decrypts and authenticates a stored credential. A tampered
    /// ciphertext, wrong nonce, or wrong key never yields garbage plaintext;
    /// it fails the AEAD tag check and surfaces as a credential error.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<String> {
        if nonce.len() != NONCE_LEN {
            return Err(SyncError::credential("stored nonce has invalid length"));
        }
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                SyncError::credential("credential failed integrity check (tampered or wrong key)")
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| SyncError::credential("decrypted credential is not valid UTF-8"))
    }
}
