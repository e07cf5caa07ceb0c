//! Item Vault - Datasource Envelope
//!
//! `data.json` layout:
//! ```text
//! { "protection": { "encrypted_key", "key_nonce", "data_nonce", "argon2" },
//!   "internals": "base64://<AES-256-GCM(record JSON)>" }
//! ```
//!
//! These functions do not touch `encrypted_counter`; the save pipeline owns it.

use serde::{Deserialize, Serialize};

use super::aead::{aead_decrypt, aead_encrypt};
use super::kdf::{derive_key, unwrap_data_key, Argon2Params};
use super::keys::DataKey;
use crate::codec::base64_bytes;
use crate::error::{VaultError, VaultResult};
use crate::model::{Datasource, DatasourceRecord, RuntimeProtection};

/// Default number of messages one data key may seal
pub const ENCRYPT_MESSAGE_LIMIT: u64 = 1_000_000;

/// Plaintext protection header of the envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeProtection {
    #[serde(with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub key_nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub data_nonce: Vec<u8>,
    pub argon2: Argon2Params,
}

/// Persisted projection of a [`Datasource`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedDatasource {
    pub protection: EnvelopeProtection,
    #[serde(with = "base64_bytes")]
    pub internals: Vec<u8>,
}

impl EncryptedDatasource {
    pub fn to_json(&self) -> VaultResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> VaultResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Counter after sealing `requested` more messages, if that stays within `limit`
pub fn check_quota(encrypted_counter: u64, requested: u64, limit: u64) -> VaultResult<u64> {
    match encrypted_counter.checked_add(requested) {
        Some(total) if total <= limit => Ok(total),
        _ => Err(VaultError::QuotaExceeded {
            counter: encrypted_counter,
            requested,
            limit,
        }),
    }
}

/// Encrypt a datasource with `key`
///
/// Fails with `QuotaExceeded` when the datasource's counter already reached
/// `limit`; callers are expected to re-key before that happens.
pub fn encrypt_datasource(
    datasource: &Datasource,
    key: &DataKey,
    limit: u64,
) -> VaultResult<EncryptedDatasource> {
    check_quota(datasource.record.protection.encrypted_counter, 1, limit)?;
    seal_record(&datasource.record, &datasource.runtime, key)
}

/// Encrypt a record without any quota check
pub(crate) fn seal_record(
    record: &DatasourceRecord,
    runtime: &RuntimeProtection,
    key: &DataKey,
) -> VaultResult<EncryptedDatasource> {
    let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(record)?);
    let sealed = aead_encrypt(key, &plaintext)?;

    Ok(EncryptedDatasource {
        protection: EnvelopeProtection {
            encrypted_key: runtime.encrypted_key.clone(),
            key_nonce: runtime.key_nonce.clone(),
            data_nonce: sealed.nonce,
            argon2: runtime.argon2.clone(),
        },
        internals: sealed.ciphertext,
    })
}

/// Open an envelope with the user's password
pub fn decrypt_datasource(
    encrypted: &EncryptedDatasource,
    password: &str,
) -> VaultResult<Datasource> {
    let protection = &encrypted.protection;
    let kek = derive_key(password, &protection.argon2)?;
    let key = unwrap_data_key(&kek, &protection.encrypted_key, &protection.key_nonce)?;
    decrypt_datasource_with_key(encrypted, key)
}

/// Open an envelope with an already unwrapped data key
pub fn decrypt_datasource_with_key(
    encrypted: &EncryptedDatasource,
    key: DataKey,
) -> VaultResult<Datasource> {
    let protection = &encrypted.protection;
    let plaintext = zeroize::Zeroizing::new(aead_decrypt(
        &key,
        &encrypted.internals,
        &protection.data_nonce,
    )?);
    let record: DatasourceRecord = serde_json::from_slice(&plaintext)?;

    Ok(Datasource {
        runtime: RuntimeProtection {
            key,
            encrypted_key: protection.encrypted_key.clone(),
            key_nonce: protection.key_nonce.clone(),
            argon2: protection.argon2.clone(),
        },
        record,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::test_params;
    use crate::model::{DataItem, EntriesConfiguration, EntryConfiguration, EntryData, EntryType};
    use pretty_assertions::assert_eq;

    fn sample() -> Datasource {
        let entry = EntriesConfiguration {
            entries: vec![EntryConfiguration::new("title", EntryType::String)],
            image_size: None,
        };
        let mut ds = Datasource::create("books", entry, "hunter2", test_params()).unwrap();
        ds.record.data.insert(
            "a".into(),
            DataItem::default().with_entry("title", EntryData::string("Dune")),
        );
        ds
    }

    #[test]
    fn test_envelope_roundtrip() {
        let ds = sample();
        let sealed = encrypt_datasource(&ds, &ds.runtime.key, ENCRYPT_MESSAGE_LIMIT).unwrap();
        let json = sealed.to_json().unwrap();
        assert!(json.contains("\"internals\":\"base64://"));
        assert!(!json.contains("Dune"));

        let envelope = EncryptedDatasource::from_json(&json).unwrap();
        let opened = decrypt_datasource(&envelope, "hunter2").unwrap();
        assert_eq!(opened.record, ds.record);
        assert_eq!(opened.runtime.key.expose(), ds.runtime.key.expose());
    }

    #[test]
    fn test_wrong_password() {
        let ds = sample();
        let sealed = encrypt_datasource(&ds, &ds.runtime.key, ENCRYPT_MESSAGE_LIMIT).unwrap();
        let err = decrypt_datasource(&sealed, "hunter3").unwrap_err();
        assert!(matches!(err, VaultError::AuthenticationFailure(_)));
    }

    #[test]
    fn test_quota() {
        let mut ds = sample();
        ds.record.protection.encrypted_counter = 10;
        let err = encrypt_datasource(&ds, &ds.runtime.key, 10).unwrap_err();
        assert!(err.is_deferred_action());

        assert_eq!(check_quota(8, 2, 10).unwrap(), 10);
        assert!(check_quota(9, 2, 10).is_err());
    }

    #[test]
    fn test_quota_counter_overflow() {
        let err = check_quota(u64::MAX - 1, 2, u64::MAX).unwrap_err();
        assert!(matches!(err, VaultError::QuotaExceeded { requested: 2, .. }));
        assert_eq!(check_quota(u64::MAX - 1, 1, u64::MAX).unwrap(), u64::MAX);
    }

    #[test]
    fn test_malformed_envelope() {
        let err = EncryptedDatasource::from_json("{\"protection\": 1}").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
    }
}
