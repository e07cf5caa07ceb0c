//! Item Vault - Image Fetchers
//!
//! The store loads persisted (encrypted) image files by name through an
//! [`ImageFetcher`]. Fetch failures surface as `NetworkFailure`; retrying is
//! left to whoever wraps the fetcher.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{VaultError, VaultResult};
use crate::package::PackageReader;

/// Loads encrypted image files by file name
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, name: &str) -> VaultResult<Vec<u8>>;
}

/// Serves files out of an opened package
pub struct ArchiveFetcher {
    package: PackageReader,
}

impl ArchiveFetcher {
    pub fn new(package: PackageReader) -> Self {
        Self { package }
    }
}

#[async_trait]
impl ImageFetcher for ArchiveFetcher {
    async fn fetch(&self, name: &str) -> VaultResult<Vec<u8>> {
        self.package
            .get(name)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| VaultError::NetworkFailure {
                name: name.to_string(),
                detail: "not present in package".into(),
            })
    }
}

/// Serves files from an unpacked directory
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ImageFetcher for DirectoryFetcher {
    async fn fetch(&self, name: &str) -> VaultResult<Vec<u8>> {
        // names are flat file names, never paths
        if name.contains(['/', '\\']) || name == ".." {
            return Err(VaultError::Validation(format!("invalid image name {:?}", name)));
        }
        tokio::fs::read(self.root.join(name))
            .await
            .map_err(|e| VaultError::NetworkFailure {
                name: name.to_string(),
                detail: e.to_string(),
            })
    }
}

/// For datasources that have nothing persisted yet
pub struct NoImages;

#[async_trait]
impl ImageFetcher for NoImages {
    async fn fetch(&self, name: &str) -> VaultResult<Vec<u8>> {
        Err(VaultError::NetworkFailure {
            name: name.to_string(),
            detail: "no image source configured".into(),
        })
    }
}
