//! # Item Vault
//!
//! Encrypted, versioned collection of tagged data items, each optionally
//! carrying a full image and a pooled thumbnail, persisted as a zip package.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     DATASOURCE STORE                      │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐  │
//! │  │  PLACEMENT  │  │    SAVE     │  │  IMPORT / CACHE  │  │
//! │  │  validate → │  │  quota →    │  │  dumped items,   │  │
//! │  │  commit     │  │  package    │  │  image handles   │  │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬─────────┘  │
//! │         │                │                   │            │
//! │  ┌──────┴──────┐  ┌──────┴──────┐  ┌────────┴─────────┐  │
//! │  │  TAG PATCH  │  │ MODIFICATION│  │  POOL ALLOCATOR  │  │
//! │  │  staged ids │  │  TRACKER    │  │  8x8 bitmaps     │  │
//! │  └─────────────┘  └─────────────┘  └──────────────────┘  │
//! │                                                           │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │  CRYPTO: Argon2id KEK → data key → AES-256-GCM      │  │
//! │  │  record envelope, header-preserving image sealing   │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - The data key is random and wrapped with an Argon2id password-derived key
//! - The record and every image are sealed with AES-256-GCM, fresh nonce each
//! - Image headers stay readable, pixel data never does
//! - A data key seals at most `encrypt_message_limit` messages before rotation
//! - Key material is zeroized on drop

pub mod cache;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fetch;
pub mod model;
pub mod package;
pub mod pool;
pub mod raster;
pub mod store;
pub mod tags;
pub mod tracker;

pub use cache::{ImageCache, ImageHandle};
pub use config::StoreConfig;
pub use crypto::{
    decrypt_datasource, encrypt_datasource, Argon2Params, DataKey, EncryptedDatasource,
    ENCRYPT_MESSAGE_LIMIT,
};
pub use error::{ErrorKind, VaultError, VaultResult};
pub use fetch::{ArchiveFetcher, DirectoryFetcher, ImageFetcher, NoImages};
pub use model::{
    DataItem, Datasource, EntriesConfiguration, EntryConfiguration, EntryData, EntryType, ImageSize,
    ImageSlot,
};
pub use package::{PackageBuilder, PackageReader, ZipPackageBuilder};
pub use pool::{ImagePoolAllocator, PoolAllocation, PoolGeometry};
pub use raster::LoadedImage;
pub use store::{
    DatasourceStore, DumpedItem, InvalidReason, PlacementFailure, PlacementRequest, SaveOutcome,
    SavedPackage, StoreSnapshot,
};
pub use tags::TagPatch;
pub use tracker::ModificationTracker;

/// Item Vault version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
