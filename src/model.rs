//! Item Vault - Datasource Model
//!
//! The decrypted datasource: schema, items, tag registry, pool bitmaps and
//! protection metadata. Only [`DatasourceRecord`] is ever serialized, and only
//! inside an encrypted envelope; the runtime key material never leaves memory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::{base64_bytes, ordered_map};
use crate::crypto::{derive_key, wrap_data_key, Argon2Params, DataKey};
use crate::error::VaultResult;

/// Mapping: runtime id -> item
pub type ItemMap = BTreeMap<String, DataItem>;

/// Mapping: tag entry name -> tag strings, indexed by tag id
pub type TagRegistry = BTreeMap<String, Vec<String>>;

// ═══════════════════════════════════════════════════════════════════════════
// SCHEMA
// ═══════════════════════════════════════════════════════════════════════════

/// Built-in entry kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    String,
    Tag,
    Rating,
}

/// One named, typed field of the item schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryConfiguration {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryType,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    /// Only honoured for string entries
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    /// Only honoured for tag entries: at most one tag per item
    #[serde(default, skip_serializing_if = "is_false")]
    pub exclusive: bool,
}

impl EntryConfiguration {
    pub fn new(name: impl Into<String>, kind: EntryType) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
            unique: false,
            exclusive: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Whether values of this entry must be unique across items
    pub fn is_unique_string(&self) -> bool {
        self.kind == EntryType::String && self.unique
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Pixel dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Item schema plus the optional fixed full-image size
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntriesConfiguration {
    pub entries: Vec<EntryConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<ImageSize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfiguration {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configurations {
    pub global: GlobalConfiguration,
    pub entry: EntriesConfiguration,
}

// ═══════════════════════════════════════════════════════════════════════════
// ITEMS
// ═══════════════════════════════════════════════════════════════════════════

/// Value of one entry of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryData {
    String {
        value: String,
    },
    Rating {
        score: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    Tag {
        /// Sorted ascending; ids index into the tag registry of the entry
        #[serde(rename = "tags")]
        tag_ids: Vec<u32>,
    },
}

impl EntryData {
    pub fn string(value: impl Into<String>) -> Self {
        EntryData::String { value: value.into() }
    }

    /// Tag entry with ids sorted ascending
    pub fn tags(mut tag_ids: Vec<u32>) -> Self {
        tag_ids.sort_unstable();
        tag_ids.dedup();
        EntryData::Tag { tag_ids }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EntryData::String { value } => Some(value),
            _ => None,
        }
    }
}

/// Thumbnail slot reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSlot {
    /// Pool name
    pub name: String,
    /// Row-major slot index inside the pool
    pub index: u32,
}

/// One stored item, keyed externally by its runtime id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", with = "ordered_map")]
    pub entries: BTreeMap<String, EntryData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSlot>,
}

impl DataItem {
    pub fn with_entry(mut self, name: impl Into<String>, data: EntryData) -> Self {
        self.entries.insert(name.into(), data);
        self
    }

    /// Whether `other` differs in any configured entry or in its image slot
    pub fn differs_from(&self, other: &DataItem, entries: &[EntryConfiguration]) -> bool {
        if let (Some(mine), Some(theirs)) = (&self.image, &other.image) {
            if mine != theirs {
                return true;
            }
        }
        entries
            .iter()
            .any(|config| self.entries.get(&config.name) != other.entries.get(&config.name))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PERSISTED RECORD
// ═══════════════════════════════════════════════════════════════════════════

/// Allocation bitmap of one thumbnail pool, one byte per row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub bitmap: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagesRecord {
    pub pools: Vec<PoolRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionRecord {
    /// Messages sealed with the current data key
    pub encrypted_counter: u64,
}

/// Everything that is encrypted into `internals`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceRecord {
    pub protection: ProtectionRecord,
    pub configurations: Configurations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<ImagesRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", with = "ordered_map")]
    pub tags: TagRegistry,
    #[serde(with = "ordered_map")]
    pub data: ItemMap,
}

/// In-memory-only protection state
#[derive(Debug, Clone)]
pub struct RuntimeProtection {
    /// Decrypted data key
    pub key: DataKey,
    /// Data key wrapped with the password-derived key
    pub encrypted_key: Vec<u8>,
    pub key_nonce: Vec<u8>,
    pub argon2: Argon2Params,
}

/// Fully decrypted datasource
#[derive(Debug, Clone)]
pub struct Datasource {
    pub runtime: RuntimeProtection,
    pub record: DatasourceRecord,
}

impl Datasource {
    /// Create an empty datasource protected by `password`
    pub fn create(
        name: impl Into<String>,
        entry: EntriesConfiguration,
        password: &str,
        argon2: Argon2Params,
    ) -> VaultResult<Self> {
        let key = DataKey::generate();
        let kek = derive_key(password, &argon2)?;
        let wrapped = wrap_data_key(&kek, &key)?;

        let images = entry.image_size.map(|_| ImagesRecord::default());
        Ok(Self {
            runtime: RuntimeProtection {
                key,
                encrypted_key: wrapped.ciphertext,
                key_nonce: wrapped.nonce,
                argon2,
            },
            record: DatasourceRecord {
                protection: ProtectionRecord::default(),
                configurations: Configurations {
                    global: GlobalConfiguration { name: name.into() },
                    entry,
                },
                images,
                tags: TagRegistry::new(),
                data: ItemMap::new(),
            },
        })
    }
}
