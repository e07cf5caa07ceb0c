//! Item Vault - Error Types

use thiserror::Error;

/// Result type for vault operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Short machine-checkable error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    AuthenticationFailure,
    NetworkFailure,
    ValidationFailure,
    QuotaExceeded,
    ImageCodecFailure,
    Io,
    Package,
    Crypto,
    State,
}

/// Vault error types
#[derive(Error, Debug)]
pub enum VaultError {
    // ═══════════════════════════════════════════════════════════════
    // PARSE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    // ═══════════════════════════════════════════════════════════════
    // CRYPTO ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Authentication failed - wrong key or corrupted data: {0}")]
    AuthenticationFailure(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Encryption quota exceeded: {counter} + {requested} > {limit}, rotate the data key")]
    QuotaExceeded { counter: u64, requested: u64, limit: u64 },

    // ═══════════════════════════════════════════════════════════════
    // FETCH ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Failed to fetch {name}: {detail}")]
    NetworkFailure { name: String, detail: String },

    // ═══════════════════════════════════════════════════════════════
    // VALIDATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown item: {0}")]
    UnknownItem(String),

    // ═══════════════════════════════════════════════════════════════
    // IMAGE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Image processing error: {0}")]
    ImageCodec(String),

    // ═══════════════════════════════════════════════════════════════
    // STORAGE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Package error: {0}")]
    Package(String),

    #[error("No datasource is loaded")]
    NotLoaded,
}

impl VaultError {
    /// Machine-checkable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Parse(_) | VaultError::Serialization(_) | VaultError::Base64(_) => {
                ErrorKind::Parse
            }
            VaultError::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            VaultError::EncryptionFailed(_)
            | VaultError::KeyDerivationFailed(_)
            | VaultError::InvalidKeyLength { .. } => ErrorKind::Crypto,
            VaultError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            VaultError::NetworkFailure { .. } => ErrorKind::NetworkFailure,
            VaultError::Validation(_) | VaultError::UnknownItem(_) => ErrorKind::ValidationFailure,
            VaultError::ImageCodec(_) => ErrorKind::ImageCodecFailure,
            VaultError::IoError(_) => ErrorKind::Io,
            VaultError::Package(_) => ErrorKind::Package,
            VaultError::NotLoaded => ErrorKind::State,
        }
    }

    /// Upstream collaborators may retry these; the core never does
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::NetworkFailure { .. })
    }

    /// Check if this is a security-critical error
    pub fn is_security_critical(&self) -> bool {
        matches!(self, VaultError::AuthenticationFailure(_))
    }

    /// Quota exhaustion defers an action instead of failing it
    pub fn is_deferred_action(&self) -> bool {
        matches!(self, VaultError::QuotaExceeded { .. })
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            VaultError::Parse(e.to_string())
        } else {
            VaultError::Serialization(e.to_string())
        }
    }
}

impl From<image::ImageError> for VaultError {
    fn from(e: image::ImageError) -> Self {
        VaultError::ImageCodec(e.to_string())
    }
}

impl From<zip::result::ZipError> for VaultError {
    fn from(e: zip::result::ZipError) -> Self {
        VaultError::Package(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let err = VaultError::AuthenticationFailure("bad tag".into());
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
        assert!(err.is_security_critical());

        let err = VaultError::NetworkFailure {
            name: "pool.png".into(),
            detail: "timeout".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::NetworkFailure);

        let err = VaultError::QuotaExceeded { counter: 9, requested: 2, limit: 10 };
        assert!(err.is_deferred_action());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_json_errors_are_parse_errors() {
        let err: VaultError = serde_json::from_str::<u32>("{oops").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }
}
