//! Item Vault - Datasource Store
//!
//! Single owner of a decrypted datasource: items, tag registry, pool
//! directory, image caches and modification bookkeeping. Every mutation goes
//! through the operations here, in [`placement`] or in [`save`].

mod ingest;
pub mod placement;
pub mod save;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::cache::{ImageCache, ImageHandle};
use crate::config::StoreConfig;
use crate::crypto::{
    decrypt_image, derive_key, unwrap_data_key, wrap_data_key, DataKey, ImageFormatSpec,
    IMAGE_FORMAT, THUMBNAIL_FORMAT,
};
use crate::error::{VaultError, VaultResult};
use crate::fetch::{ImageFetcher, NoImages};
use crate::model::{
    Configurations, DataItem, Datasource, EntryConfiguration, ImageSize, ItemMap, ProtectionRecord,
    RuntimeProtection, TagRegistry,
};
use crate::package::{zip_package_factory, PackageFactory};
use crate::pool::{ImagePoolAllocator, PoolAllocation};
use crate::raster::{create_empty_pool, crop_slot, decode_image, encode_image, to_thumbnail_size};
use crate::tags::TagPatch;
use crate::tracker::ModificationTracker;

pub use ingest::DumpedItem;
pub use placement::{InvalidReason, PlacementFailure, PlacementRequest};
pub use save::{SaveOutcome, SavedPackage};

/// Mapping: unique string entry name -> values in use
type UniqueIndex = HashMap<String, HashSet<String>>;

/// State that only exists while a datasource is open
struct Loaded {
    runtime: RuntimeProtection,
    protection: ProtectionRecord,
    configurations: Configurations,
    data: ItemMap,
    tags: TagRegistry,
    pools: ImagePoolAllocator,
    unique_entries: UniqueIndex,
    tag_patch: Option<TagPatch>,
    cache: ImageCache,
    /// Regenerated data key, used for every encryption once set
    pending_key: Option<DataKey>,
}

impl Loaded {
    fn image_size(&self) -> Option<ImageSize> {
        self.configurations.entry.image_size
    }

    fn entries(&self) -> &[EntryConfiguration] {
        &self.configurations.entry.entries
    }

    fn encryption_key(&self) -> &DataKey {
        self.pending_key.as_ref().unwrap_or(&self.runtime.key)
    }
}

fn loaded(state: &Option<Loaded>) -> VaultResult<&Loaded> {
    state.as_ref().ok_or(VaultError::NotLoaded)
}

fn loaded_mut(state: &mut Option<Loaded>) -> VaultResult<&mut Loaded> {
    state.as_mut().ok_or(VaultError::NotLoaded)
}

/// Read-only view of the store for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSnapshot {
    pub name: String,
    pub item_count: usize,
    pub tags: TagRegistry,
    pub pools: Vec<PoolAllocation>,
    pub modified_images: Vec<String>,
    pub encrypted_counter: u64,
    pub core_version: u64,
    pub saved_core_version: u64,
    pub key_pending: bool,
}

/// The datasource store
pub struct DatasourceStore {
    config: StoreConfig,
    fetcher: Arc<dyn ImageFetcher>,
    package_factory: PackageFactory,
    tracker: ModificationTracker,
    state: Option<Loaded>,
    /// Messages the last deferred save needed to encrypt
    encrypts_to_be_done: u64,
}

impl DatasourceStore {
    // ═══════════════════════════════════════════════════════════════════════
    // INITIALIZATION
    // ═══════════════════════════════════════════════════════════════════════

    pub fn new(config: StoreConfig, fetcher: Arc<dyn ImageFetcher>) -> VaultResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            fetcher,
            package_factory: zip_package_factory,
            tracker: ModificationTracker::new(),
            state: None,
            encrypts_to_be_done: 0,
        })
    }

    /// Store for a datasource with nothing persisted yet
    pub fn without_images(config: StoreConfig) -> VaultResult<Self> {
        Self::new(config, Arc::new(NoImages))
    }

    pub fn with_package_factory(mut self, factory: PackageFactory) -> Self {
        self.package_factory = factory;
        self
    }

    pub fn set_fetcher(&mut self, fetcher: Arc<dyn ImageFetcher>) {
        self.fetcher = fetcher;
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Take ownership of a decrypted datasource, replacing any open one
    ///
    /// Checks that every item references an allocated slot when the schema has
    /// images, and that no item references one when it does not.
    pub fn build_runtime_database(&mut self, datasource: Datasource) -> VaultResult<()> {
        if self.state.is_some() {
            self.reset();
        }

        let Datasource { runtime, record } = datasource;
        let has_image = record.configurations.entry.image_size.is_some();
        let pool_records = record.images.map(|images| images.pools).unwrap_or_default();
        if !has_image && !pool_records.is_empty() {
            return Err(VaultError::Validation(
                "image pools present but no image size configured".into(),
            ));
        }
        let pools = ImagePoolAllocator::from_records(self.config.geometry(), pool_records);

        for (runtime_id, item) in &record.data {
            match (&item.image, has_image) {
                (Some(slot), true) if pools.is_allocated(slot) => {}
                (Some(slot), true) => {
                    return Err(VaultError::Validation(format!(
                        "item {} references unallocated slot {}#{}",
                        runtime_id, slot.name, slot.index
                    )));
                }
                (None, true) => {
                    return Err(VaultError::Validation(format!("item {} has no image", runtime_id)));
                }
                (Some(_), false) => {
                    return Err(VaultError::Validation(format!(
                        "item {} has an image but the schema has none",
                        runtime_id
                    )));
                }
                (None, false) => {}
            }
        }

        let unique_entries = build_unique_index(&record.configurations.entry.entries, &record.data);

        log::info!(
            "Loaded datasource {:?}: {} items, {} pools",
            record.configurations.global.name,
            record.data.len(),
            pools.len()
        );

        self.state = Some(Loaded {
            runtime,
            protection: record.protection,
            configurations: record.configurations,
            data: record.data,
            tags: record.tags,
            pools,
            unique_entries,
            tag_patch: None,
            cache: ImageCache::new(),
            pending_key: None,
        });
        self.tracker.notify();
        Ok(())
    }

    /// Close the datasource and clear every cache and counter
    pub fn reset(&mut self) {
        self.state = None;
        self.encrypts_to_be_done = 0;
        self.tracker.reset();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════

    pub fn is_loaded(&self) -> bool {
        self.state.is_some()
    }

    pub fn has_image(&self) -> bool {
        self.state.as_ref().map_or(false, |state| state.image_size().is_some())
    }

    pub fn image_size(&self) -> Option<ImageSize> {
        self.state.as_ref().and_then(Loaded::image_size)
    }

    pub fn thumbnail_size(&self) -> Option<ImageSize> {
        self.image_size()
            .map(|size| to_thumbnail_size(size, self.config.thumbnail_downscale))
    }

    pub fn configurations(&self) -> VaultResult<&Configurations> {
        Ok(&loaded(&self.state)?.configurations)
    }

    pub fn entries(&self) -> VaultResult<&[EntryConfiguration]> {
        Ok(loaded(&self.state)?.entries())
    }

    pub fn items(&self) -> VaultResult<&ItemMap> {
        Ok(&loaded(&self.state)?.data)
    }

    pub fn item(&self, runtime_id: &str) -> Option<&DataItem> {
        self.state.as_ref().and_then(|state| state.data.get(runtime_id))
    }

    pub fn tags(&self) -> VaultResult<&TagRegistry> {
        Ok(&loaded(&self.state)?.tags)
    }

    pub fn encrypted_counter(&self) -> VaultResult<u64> {
        Ok(loaded(&self.state)?.protection.encrypted_counter)
    }

    pub fn query_pool_allocation(&self) -> VaultResult<Vec<PoolAllocation>> {
        Ok(loaded(&self.state)?.pools.query_allocation())
    }

    /// Anything changed since the datasource was loaded
    pub fn is_modified(&self) -> bool {
        self.tracker.is_modified()
    }

    /// Anything changed since the last save
    pub fn is_unsaved(&self) -> bool {
        self.tracker.is_unsaved()
    }

    /// Receiver bumped after every committed change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tracker.subscribe()
    }

    /// Messages the last deferred save would have encrypted; 0 when none is pending
    pub fn encrypts_to_be_done(&self) -> u64 {
        self.encrypts_to_be_done
    }

    pub fn snapshot(&self) -> VaultResult<StoreSnapshot> {
        let state = loaded(&self.state)?;
        Ok(StoreSnapshot {
            name: state.configurations.global.name.clone(),
            item_count: state.data.len(),
            tags: state.tags.clone(),
            pools: state.pools.query_allocation(),
            modified_images: self.tracker.modified_images().map(str::to_string).collect(),
            encrypted_counter: state.protection.encrypted_counter,
            core_version: self.tracker.current().core,
            saved_core_version: self.tracker.saved().core,
            key_pending: state.pending_key.is_some(),
        })
    }

    /// A UUID not used by any item or pool
    pub fn acquire_new_runtime_id(&self) -> VaultResult<String> {
        let state = loaded(&self.state)?;
        loop {
            let id = Uuid::new_v4().to_string();
            if !state.data.contains_key(&id) && !state.pools.contains(&id) {
                return Ok(id);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // IMAGES
    // ═══════════════════════════════════════════════════════════════════════

    /// Full image of an item, if already in memory
    pub fn get_cached_image(&self, runtime_id: &str) -> Option<ImageHandle> {
        self.state
            .as_ref()
            .and_then(|state| state.cache.image(runtime_id))
            .cloned()
    }

    /// Place or replace cached handles of an item, returning the released ones
    pub fn place_image_cache(
        &mut self,
        runtime_id: &str,
        image: Option<ImageHandle>,
        thumbnail: Option<ImageHandle>,
    ) -> VaultResult<Vec<ImageHandle>> {
        let state = loaded_mut(&mut self.state)?;
        Ok(state.cache.place(runtime_id, image, thumbnail))
    }

    /// Thumbnail of an item, cropped out of its pool on first access
    pub async fn get_thumbnail(&mut self, runtime_id: &str) -> VaultResult<ImageHandle> {
        let state = loaded(&self.state)?;
        if let Some(handle) = state.cache.thumbnail(runtime_id) {
            return Ok(handle.clone());
        }
        let item = state
            .data
            .get(runtime_id)
            .ok_or_else(|| VaultError::UnknownItem(runtime_id.to_string()))?;
        let slot = item
            .image
            .clone()
            .ok_or_else(|| VaultError::Validation(format!("item {} has no image", runtime_id)))?;
        let slot_size = self
            .thumbnail_size()
            .ok_or_else(|| VaultError::Validation("datasource has no images".into()))?;

        self.ensure_pool_loaded(&slot.name).await?;

        let geometry = self.config.geometry();
        let state = loaded_mut(&mut self.state)?;
        let pool = state
            .cache
            .pool(&slot.name)
            .ok_or_else(|| VaultError::Validation(format!("pool {} not loaded", slot.name)))?;
        let thumbnail = crop_slot(pool, slot.index, slot_size, geometry);
        let encoded = encode_image(&thumbnail, &THUMBNAIL_FORMAT)?;
        let handle = ImageHandle::new(encoded, THUMBNAIL_FORMAT.mime);
        state.cache.place(runtime_id, None, Some(handle.clone()));
        Ok(handle)
    }

    /// Full image of an item, fetched and decrypted on first access
    pub async fn get_image(&mut self, runtime_id: &str) -> VaultResult<ImageHandle> {
        let state = loaded(&self.state)?;
        if let Some(handle) = state.cache.image(runtime_id) {
            return Ok(handle.clone());
        }
        if !state.data.contains_key(runtime_id) {
            return Err(VaultError::UnknownItem(runtime_id.to_string()));
        }
        let key = state.runtime.key.clone();

        let bytes = fetch_image(self.fetcher.as_ref(), &key, runtime_id, &IMAGE_FORMAT).await?;
        let handle = ImageHandle::new(bytes, IMAGE_FORMAT.mime);

        let state = loaded_mut(&mut self.state)?;
        state.cache.place(runtime_id, Some(handle.clone()), None);
        Ok(handle)
    }

    /// Fetch, decrypt and decode a pool into the cache unless already there
    pub async fn ensure_pool_loaded(&mut self, name: &str) -> VaultResult<()> {
        let state = loaded(&self.state)?;
        if state.cache.has_pool(name) {
            return Ok(());
        }
        if !state.pools.contains(name) {
            return Err(VaultError::Validation(format!("unknown pool {}", name)));
        }
        let slot_size = self
            .thumbnail_size()
            .ok_or_else(|| VaultError::Validation("datasource has no images".into()))?;
        let key = state.runtime.key.clone();

        let bytes = fetch_image(self.fetcher.as_ref(), &key, name, &THUMBNAIL_FORMAT).await?;
        let raster = decode_image(&bytes)?;

        let expected = create_empty_pool(slot_size, self.config.geometry()).dimensions();
        if raster.dimensions() != expected {
            return Err(VaultError::ImageCodec(format!(
                "pool {} is {:?}, expected {:?}",
                name,
                raster.dimensions(),
                expected
            )));
        }
        loaded_mut(&mut self.state)?.cache.insert_pool(name, raster);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TAGS AND ITEMS
    // ═══════════════════════════════════════════════════════════════════════

    /// Stage tags for the next placement and resolve their ids
    pub fn register_tags<S: AsRef<str>>(
        &mut self,
        entry_name: &str,
        tags: &[S],
    ) -> VaultResult<Vec<u32>> {
        let state = loaded_mut(&mut self.state)?;
        let patch = state.tag_patch.get_or_insert_with(TagPatch::new);
        Ok(patch.register(&state.tags, entry_name, tags))
    }

    /// Drop tags staged since the last successful placement
    pub fn cancel_tag_registration(&mut self) {
        if let Some(state) = self.state.as_mut() {
            if let Some(mut patch) = state.tag_patch.take() {
                patch.cancel();
            }
        }
    }

    /// Remove items, freeing their slots and unique values
    ///
    /// Unknown ids are skipped. Returns how many items were removed.
    pub fn remove_items<S: AsRef<str>>(&mut self, runtime_ids: &[S]) -> VaultResult<usize> {
        let state = loaded_mut(&mut self.state)?;
        let mut removed = 0;
        for runtime_id in runtime_ids {
            let runtime_id = runtime_id.as_ref();
            let Some(item) = state.data.remove(runtime_id) else {
                continue;
            };
            if let Some(slot) = &item.image {
                state.pools.free_slot(slot, &mut self.tracker);
            }
            for (entry_name, values) in state.unique_entries.iter_mut() {
                if let Some(value) = item.entries.get(entry_name).and_then(|data| data.as_str()) {
                    values.remove(value);
                }
            }
            state.cache.release(runtime_id);
            removed += 1;
        }
        if removed > 0 {
            self.tracker.mark_core_dirty();
            log::info!("Removed {} items", removed);
        }
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DATA KEY
    // ═══════════════════════════════════════════════════════════════════════

    /// Record a re-wrapped data key, and stage a new one when given
    ///
    /// A new key marks every image dirty and restarts the encryption counter,
    /// so the next save re-encrypts everything with it. Cached images keep
    /// being decrypted with the old key until the datasource is reopened.
    pub fn update_data_key(
        &mut self,
        encrypted_key: Vec<u8>,
        key_nonce: Vec<u8>,
        new_key: Option<DataKey>,
    ) -> VaultResult<()> {
        let state = loaded_mut(&mut self.state)?;
        if let Some(key) = new_key {
            if state.image_size().is_some() {
                let names: Vec<String> = state
                    .data
                    .keys()
                    .cloned()
                    .chain(state.pools.names().map(str::to_string))
                    .collect();
                self.tracker.mark_images_dirty(names);
            }
            state.pending_key = Some(key);
            state.protection.encrypted_counter = 0;
            self.encrypts_to_be_done = 0;
            log::info!("New data key staged");
        }
        self.tracker.mark_core_dirty();
        state.runtime.encrypted_key = encrypted_key;
        state.runtime.key_nonce = key_nonce;
        Ok(())
    }

    /// Generate a fresh data key, wrapped with the key derived from `password`
    ///
    /// The password is checked against the current wrapped key first.
    pub fn regenerate_data_key(&mut self, password: &str) -> VaultResult<()> {
        let state = loaded(&self.state)?;
        let kek = derive_key(password, &state.runtime.argon2)?;
        unwrap_data_key(&kek, &state.runtime.encrypted_key, &state.runtime.key_nonce)?;

        let key = DataKey::generate();
        let wrapped = wrap_data_key(&kek, &key)?;
        self.update_data_key(wrapped.ciphertext, wrapped.nonce, Some(key))
    }
}

fn build_unique_index(entries: &[EntryConfiguration], data: &ItemMap) -> UniqueIndex {
    entries
        .iter()
        .filter(|config| config.is_unique_string())
        .map(|config| {
            let values = data
                .values()
                .filter_map(|item| item.entries.get(&config.name))
                .filter_map(|entry| entry.as_str())
                .map(str::to_string)
                .collect();
            (config.name.clone(), values)
        })
        .collect()
}

/// Fetch `<name><ext>` and open it with `key`
async fn fetch_image(
    fetcher: &dyn ImageFetcher,
    key: &DataKey,
    name: &str,
    format: &ImageFormatSpec,
) -> VaultResult<Vec<u8>> {
    let encrypted = fetcher.fetch(&format.file_name(name)).await?;
    decrypt_image(&encrypted, format, key)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::kdf::test_params;
    use crate::model::{
        EntriesConfiguration, EntryData, EntryType, ImageSlot, ImagesRecord, PoolRecord,
    };

    pub(crate) fn schema(image_size: Option<ImageSize>) -> EntriesConfiguration {
        EntriesConfiguration {
            entries: vec![
                EntryConfiguration::new("title", EntryType::String).unique(),
                EntryConfiguration::new("color", EntryType::Tag).optional(),
                EntryConfiguration::new("score", EntryType::Rating).optional(),
            ],
            image_size,
        }
    }

    pub(crate) fn titled(title: &str) -> DataItem {
        DataItem::default().with_entry("title", EntryData::string(title))
    }

    pub(crate) fn text_store(items: &[(&str, &str)]) -> DatasourceStore {
        let mut datasource =
            Datasource::create("books", schema(None), "pw", test_params()).unwrap();
        for (id, title) in items {
            datasource.record.data.insert(id.to_string(), titled(title));
        }
        let mut store = DatasourceStore::without_images(StoreConfig::default()).unwrap();
        store.build_runtime_database(datasource).unwrap();
        store
    }

    #[test]
    fn test_not_loaded() {
        let store = DatasourceStore::without_images(StoreConfig::default()).unwrap();
        assert!(matches!(store.items(), Err(VaultError::NotLoaded)));
        assert!(!store.is_modified());
    }

    #[test]
    fn test_unique_index_skips_missing_optional_entries() {
        let entries = vec![
            EntryConfiguration::new("note", EntryType::String).optional().unique(),
            EntryConfiguration::new("title", EntryType::String).unique(),
        ];
        let mut data = ItemMap::new();
        data.insert("a".into(), titled("one"));
        data.insert("b".into(), titled("two").with_entry("note", EntryData::string("n")));

        let index = build_unique_index(&entries, &data);
        assert_eq!(index["title"], HashSet::from(["one".to_string(), "two".to_string()]));
        assert_eq!(index["note"], HashSet::from(["n".to_string()]));
    }

    #[test]
    fn test_rejects_dangling_slot() {
        let size = ImageSize { width: 40, height: 30 };
        let mut datasource =
            Datasource::create("pics", schema(Some(size)), "pw", test_params()).unwrap();
        datasource.record.images = Some(ImagesRecord {
            pools: vec![PoolRecord { name: "p".into(), bitmap: vec![0b1, 0, 0, 0, 0, 0, 0, 0] }],
        });
        let mut item = titled("x");
        item.image = Some(ImageSlot { name: "p".into(), index: 1 });
        datasource.record.data.insert("a".into(), item);

        let mut store = DatasourceStore::without_images(StoreConfig::default()).unwrap();
        let err = store.build_runtime_database(datasource).unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
        assert!(!store.is_loaded());
    }

    #[test]
    fn test_remove_items_frees_unique_values() {
        let mut store = text_store(&[("a", "Dune"), ("b", "Emma")]);
        assert_eq!(store.remove_items(&["a", "zzz"]).unwrap(), 1);
        assert!(store.item("a").is_none());
        assert!(store.is_unsaved());

        let state = store.state.as_ref().unwrap();
        assert!(!state.unique_entries["title"].contains("Dune"));
        assert!(state.unique_entries["title"].contains("Emma"));
    }

    #[test]
    fn test_tag_registration_is_staged() {
        let mut store = text_store(&[]);
        assert_eq!(store.register_tags("color", &["red", "blue"]).unwrap(), vec![0, 1]);
        assert!(store.tags().unwrap().is_empty());
        store.cancel_tag_registration();
        assert_eq!(store.register_tags("color", &["blue"]).unwrap(), vec![0]);
    }

    #[test]
    fn test_update_data_key_resets_counter() {
        let mut store = text_store(&[("a", "Dune")]);
        store.state.as_mut().unwrap().protection.encrypted_counter = 42;

        store.update_data_key(vec![1; 48], vec![2; 12], Some(DataKey::generate())).unwrap();
        assert_eq!(store.encrypted_counter().unwrap(), 0);
        assert!(store.snapshot().unwrap().key_pending);
        // no images in this schema
        assert!(store.snapshot().unwrap().modified_images.is_empty());
        assert!(store.is_unsaved());
    }

    #[test]
    fn test_regenerate_checks_password() {
        let mut store = text_store(&[]);
        let err = store.regenerate_data_key("wrong").unwrap_err();
        assert!(err.is_security_critical());
        assert!(!store.is_modified());

        store.regenerate_data_key("pw").unwrap();
        assert!(store.snapshot().unwrap().key_pending);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut store = text_store(&[("a", "Dune")]);
        let rx = store.subscribe();
        store.remove_items(&["a"]).unwrap();
        store.reset();
        assert!(!store.is_loaded());
        assert!(!store.is_modified());
        assert_eq!(*rx.borrow(), 0);
    }

    #[test]
    fn test_place_image_cache_returns_released_handles() {
        let mut store = text_store(&[("a", "Dune")]);
        let first = ImageHandle::new(vec![1, 2, 3], "image/webp");
        assert!(store.place_image_cache("a", Some(first.clone()), None).unwrap().is_empty());
        assert!(store.get_cached_image("a").unwrap().same_as(&first));

        let second = ImageHandle::new(vec![4, 5], "image/webp");
        let released = store.place_image_cache("a", Some(second), None).unwrap();
        assert_eq!(released.len(), 1);
        assert!(released[0].same_as(&first));
    }

    #[test]
    fn test_runtime_ids_are_fresh() {
        let store = text_store(&[("a", "Dune")]);
        let id = store.acquire_new_runtime_id().unwrap();
        assert_ne!(id, "a");
        assert_eq!(id.len(), 36);
    }
}
