//! Item Vault - Cryptographic Core
//!
//! AES-256-GCM for every sealed message, Argon2id for the password-derived
//! key-encryption key.

pub mod aead;
pub mod datasource;
pub mod image_seal;
pub mod kdf;
pub mod keys;

pub use aead::*;
pub use datasource::*;
pub use image_seal::*;
pub use kdf::*;
pub use keys::*;
