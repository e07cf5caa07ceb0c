//! Item Vault - AEAD Encryption
//!
//! AES-256-GCM with a fresh random nonce per message.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};

use super::keys::{generate_nonce, DataKey, NONCE_LEN, TAG_LEN};
use crate::error::{VaultError, VaultResult};

/// Ciphertext together with the nonce it was sealed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    /// Nonce (12 bytes)
    pub nonce: Vec<u8>,
    /// Ciphertext with authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Serialize to bytes (nonce || ciphertext)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.nonce.len() + self.ciphertext.len());
        result.extend_from_slice(&self.nonce);
        result.extend_from_slice(&self.ciphertext);
        result
    }

    /// Deserialize from bytes (nonce || ciphertext)
    pub fn from_bytes(data: &[u8]) -> VaultResult<Self> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::AuthenticationFailure("Data too short".into()));
        }

        Ok(Self {
            nonce: data[..NONCE_LEN].to_vec(),
            ciphertext: data[NONCE_LEN..].to_vec(),
        })
    }
}

/// Encrypt data with AES-256-GCM
pub fn aead_encrypt(key: &DataKey, plaintext: &[u8]) -> VaultResult<EncryptedData> {
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

    Ok(EncryptedData {
        nonce: nonce_bytes.to_vec(),
        ciphertext,
    })
}

/// Decrypt data with AES-256-GCM
pub fn aead_decrypt(key: &DataKey, ciphertext: &[u8], nonce: &[u8]) -> VaultResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| VaultError::AuthenticationFailure(e.to_string()))?;

    if nonce.len() != NONCE_LEN {
        return Err(VaultError::AuthenticationFailure("Invalid nonce length".into()));
    }

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| VaultError::AuthenticationFailure("Authentication failed".into()))
}
