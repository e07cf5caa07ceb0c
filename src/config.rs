//! Item Vault - Store Configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::ENCRYPT_MESSAGE_LIMIT;
use crate::error::{VaultError, VaultResult};
use crate::pool::PoolGeometry;

/// Runtime configuration of a [`crate::DatasourceStore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Messages one data key may seal before it must be regenerated
    pub encrypt_message_limit: u64,
    /// Rows of thumbnail slots per pool
    pub pool_rows: usize,
    /// Thumbnail slots per row (at most 8, one bitmap byte per row)
    pub pool_columns: usize,
    /// Full image size divided by this gives the thumbnail size
    pub thumbnail_downscale: u32,
    /// Package produced by a delta save
    pub delta_package_name: String,
    /// Package produced by a full save
    pub full_package_name: String,
    /// Name of the encrypted record inside a package
    pub data_file_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            encrypt_message_limit: ENCRYPT_MESSAGE_LIMIT,
            pool_rows: 8,
            pool_columns: 8,
            thumbnail_downscale: 10,
            delta_package_name: "database-delta.zip".into(),
            full_package_name: "database.zip".into(),
            data_file_name: "data.json".into(),
        }
    }
}

impl StoreConfig {
    /// Load from a JSON file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> VaultResult<Self> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let data = std::fs::read(path)?;
        let config: StoreConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.pool_rows == 0 || self.pool_columns == 0 {
            return Err(VaultError::Validation("pool geometry must be non-empty".into()));
        }
        if self.pool_columns > 8 {
            return Err(VaultError::Validation(format!(
                "pool_columns {} does not fit a one-byte bitmap row",
                self.pool_columns
            )));
        }
        if self.thumbnail_downscale == 0 {
            return Err(VaultError::Validation("thumbnail_downscale must be positive".into()));
        }
        if self.encrypt_message_limit == 0 {
            return Err(VaultError::Validation("encrypt_message_limit must be positive".into()));
        }
        Ok(())
    }

    pub fn geometry(&self) -> PoolGeometry {
        PoolGeometry {
            rows: self.pool_rows,
            columns: self.pool_columns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.encrypt_message_limit, 1_000_000);
        assert_eq!(config.geometry().capacity(), 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{ "encrypt_message_limit": 50, "pool_rows": 2 }"#).unwrap();

        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.encrypt_message_limit, 50);
        assert_eq!(config.pool_rows, 2);
        assert_eq!(config.pool_columns, 8);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn test_rejects_wide_rows() {
        let config = StoreConfig {
            pool_columns: 9,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
