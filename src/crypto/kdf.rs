//! Item Vault - Password Key Derivation
//!
//! Argon2id turns the user password into a key-encryption key (KEK). The KEK
//! only ever wraps the random data key; everything else is sealed with the
//! data key.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::aead::{aead_decrypt, aead_encrypt, EncryptedData};
use super::keys::{random_bytes, DataKey, KEY_LEN};
use crate::codec::base64_bytes;
use crate::error::{VaultError, VaultResult};

/// Salt length for new parameter sets
pub const SALT_LEN: usize = 16;

/// Argon2id parameters, stored next to the wrapped key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argon2Params {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Iterations (time cost)
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
    /// Salt
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024, // 64 MiB
            iterations: 3,
            parallelism: 1,
            salt: Vec::new(),
        }
    }
}

impl Argon2Params {
    /// Default cost with a fresh random salt
    pub fn with_random_salt() -> Self {
        Self {
            salt: random_bytes(SALT_LEN),
            ..Default::default()
        }
    }
}

/// Derive a key-encryption key from a password
///
/// Deterministic for identical `(password, params)`.
pub fn derive_key(password: &str, params: &Argon2Params) -> VaultResult<DataKey> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| VaultError::KeyDerivationFailed(format!("Invalid Argon2 params: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut output = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), &params.salt, &mut output)
        .map_err(|e| VaultError::KeyDerivationFailed(e.to_string()))?;

    let key = DataKey::new(output);
    output.zeroize();
    Ok(key)
}

/// Seal the data key with a key-encryption key
pub fn wrap_data_key(kek: &DataKey, data_key: &DataKey) -> VaultResult<EncryptedData> {
    aead_encrypt(kek, data_key.expose())
}

/// Open a wrapped data key; a wrong password surfaces as `AuthenticationFailure`
pub fn unwrap_data_key(
    kek: &DataKey,
    encrypted_key: &[u8],
    key_nonce: &[u8],
) -> VaultResult<DataKey> {
    let raw = zeroize::Zeroizing::new(aead_decrypt(kek, encrypted_key, key_nonce)?);
    DataKey::from_slice(&raw)
}

#[cfg(test)]
pub(crate) fn test_params() -> Argon2Params {
    Argon2Params {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
        salt: vec![1u8; SALT_LEN],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let params = test_params();
        let k1 = derive_key("correct horse", &params).unwrap();
        let k2 = derive_key("correct horse", &params).unwrap();
        assert_eq!(k1.expose(), k2.expose());

        let k3 = derive_key("battery staple", &params).unwrap();
        assert_ne!(k1.expose(), k3.expose());
    }

    #[test]
    fn test_salt_changes_key() {
        let mut params = test_params();
        let k1 = derive_key("pw", &params).unwrap();
        params.salt = vec![2u8; SALT_LEN];
        let k2 = derive_key("pw", &params).unwrap();
        assert_ne!(k1.expose(), k2.expose());
    }

    #[test]
    fn test_wrap_unwrap() {
        let kek = derive_key("pw", &test_params()).unwrap();
        let data_key = DataKey::generate();

        let wrapped = wrap_data_key(&kek, &data_key).unwrap();
        let opened = unwrap_data_key(&kek, &wrapped.ciphertext, &wrapped.nonce).unwrap();
        assert_eq!(opened.expose(), data_key.expose());

        let wrong = derive_key("not pw", &test_params()).unwrap();
        let err = unwrap_data_key(&wrong, &wrapped.ciphertext, &wrapped.nonce).unwrap_err();
        assert!(err.is_security_critical());
    }

    #[test]
    fn test_random_salt() {
        let a = Argon2Params::with_random_salt();
        let b = Argon2Params::with_random_salt();
        assert_eq!(a.salt.len(), SALT_LEN);
        assert_ne!(a.salt, b.salt);
    }
}
