//! Item Vault - Key Material
//!
//! Symmetric data keys and nonce generation.

use std::fmt;

use rand::RngCore;
use secrecy::{ExposeSecret, Secret};

use crate::error::{VaultError, VaultResult};

/// Key length for AES-256
pub const KEY_LEN: usize = 32;

/// Nonce length for AES-GCM
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Secure key wrapper, zeroized on drop
pub struct DataKey {
    inner: Secret<[u8; KEY_LEN]>,
}

impl DataKey {
    /// Create a new data key from bytes
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    /// Create a key from an arbitrary slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> VaultResult<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| VaultError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self::new(array))
    }

    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(bytes)
    }
}

impl Clone for DataKey {
    fn clone(&self) -> Self {
        Self::new(*self.expose())
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DataKey").field(&"<redacted>").finish()
    }
}

/// Generate a random nonce for AES-GCM
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Fill a fresh buffer with random bytes
pub fn random_bytes(length: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut buffer);
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_differ() {
        let k1 = DataKey::generate();
        let k2 = DataKey::generate();
        assert_ne!(k1.expose(), k2.expose());
        assert_eq!(k1.clone().expose(), k1.expose());
    }

    #[test]
    fn test_from_slice_checks_length() {
        assert!(DataKey::from_slice(&[0u8; KEY_LEN]).is_ok());
        let err = DataKey::from_slice(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, VaultError::InvalidKeyLength { expected: 32, actual: 16 }));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = DataKey::new([7u8; KEY_LEN]);
        assert_eq!(format!("{:?}", key), "DataKey(\"<redacted>\")");
    }
}
