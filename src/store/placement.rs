//! Item Vault - Item Placement
//!
//! `place_items` runs a staged pipeline. Each stage either hands its result
//! to the next one or returns the failures collected so far:
//!
//! ```text
//! uniqueness ──► images present ──► prefetch pools ──► commit
//!    (pure)          (pure)            (async)        (infallible)
//! ```
//!
//! Nothing observable changes before commit, so a non-empty failure list
//! always means the datasource is exactly as it was.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use super::{loaded, loaded_mut, DatasourceStore, UniqueIndex};
use crate::error::VaultResult;
use crate::model::{DataItem, ImageSlot, ItemMap};
use crate::raster::{create_empty_pool, place_into_pool, to_thumbnail_size, LoadedImage};

/// One item to insert or update
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    /// Existing item to update; a fresh id is acquired when absent
    pub runtime_id: Option<String>,
    pub source: DataItem,
    /// New image for the item
    pub images: Option<LoadedImage>,
}

impl PlacementRequest {
    pub fn insert(source: DataItem) -> Self {
        Self {
            runtime_id: None,
            source,
            images: None,
        }
    }

    pub fn update(runtime_id: impl Into<String>, source: DataItem) -> Self {
        Self {
            runtime_id: Some(runtime_id.into()),
            source,
            images: None,
        }
    }

    pub fn with_images(mut self, images: LoadedImage) -> Self {
        self.images = Some(images);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidReason {
    DuplicatedValue { entry_name: String, value: String },
    /// Another item of the same batch already targets this id
    DuplicatedRuntimeId { runtime_id: String },
    ImageFetchFailed { description: String },
    /// The schema requires an image and the new item brings none
    MissingImage,
}

/// Why the item at `index` of the batch was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacementFailure {
    pub index: usize,
    pub reason: InvalidReason,
}

type Stage<T> = Result<T, Vec<PlacementFailure>>;

/// An item that passed validation and actually changes something
struct Planned {
    index: usize,
    runtime_id: String,
    item: DataItem,
    images: Option<LoadedImage>,
    /// Slot the new thumbnail overwrites; `None` means a fresh allocation
    replaces: Option<ImageSlot>,
}

/// Fail every request naming a runtime id an earlier request already named
fn repeated_runtime_ids(batch: &[PlacementRequest]) -> Vec<PlacementFailure> {
    let mut seen = HashSet::new();
    batch
        .iter()
        .enumerate()
        .filter_map(|(index, request)| {
            let runtime_id = request.runtime_id.as_deref()?;
            if seen.insert(runtime_id) {
                return None;
            }
            Some(PlacementFailure {
                index,
                reason: InvalidReason::DuplicatedRuntimeId {
                    runtime_id: runtime_id.to_string(),
                },
            })
        })
        .collect()
}

/// Check unique string entries across the batch and against stored items
///
/// Returns the values each unique entry gains from the batch.
fn validate_uniqueness(
    unique_entries: &UniqueIndex,
    data: &ItemMap,
    batch: &[PlacementRequest],
) -> Stage<UniqueIndex> {
    let mut failures = Vec::new();
    let mut pending = UniqueIndex::new();

    let mut entry_names: Vec<&String> = unique_entries.keys().collect();
    entry_names.sort();

    for entry_name in entry_names {
        let existing = &unique_entries[entry_name];
        let mut batch_values = HashSet::new();

        for (index, request) in batch.iter().enumerate() {
            let value = request.source.entries.get(entry_name);
            let Some(value) = value.and_then(|data| data.as_str()) else {
                continue;
            };

            let duplicated = if batch_values.contains(value) {
                true
            } else if !existing.contains(value) {
                false
            } else {
                // only the item already holding the value may keep it
                match request.runtime_id.as_deref().and_then(|id| data.get(id)) {
                    None => true,
                    Some(current) => {
                        let held = current.entries.get(entry_name).and_then(|data| data.as_str());
                        held != Some(value)
                    }
                }
            };

            if duplicated {
                failures.push(PlacementFailure {
                    index,
                    reason: InvalidReason::DuplicatedValue {
                        entry_name: entry_name.clone(),
                        value: value.to_string(),
                    },
                });
                continue;
            }
            batch_values.insert(value.to_string());
        }
        pending.insert(entry_name.clone(), batch_values);
    }

    if failures.is_empty() {
        Ok(pending)
    } else {
        Err(failures)
    }
}

impl DatasourceStore {
    /// Insert or update a batch of items, all or nothing
    ///
    /// Returns the failures found; an empty list means every item was placed.
    /// The list is not guaranteed to be exhaustive. Tags registered for the
    /// batch stay staged after a failure until cancelled or confirmed by the
    /// next successful placement.
    pub async fn place_items(
        &mut self,
        batch: Vec<PlacementRequest>,
    ) -> VaultResult<Vec<PlacementFailure>> {
        let pending_unique = match self.validate_batch(&batch)? {
            Ok(pending) => pending,
            Err(failures) => return Ok(self.abort(failures)),
        };

        let planned = self.plan(batch)?;

        if let Err(failures) = self.prefetch_pools(&planned).await? {
            return Ok(self.abort(failures));
        }

        self.commit(planned, pending_unique)?;
        Ok(Vec::new())
    }

    fn abort(&self, failures: Vec<PlacementFailure>) -> Vec<PlacementFailure> {
        log::warn!("Placement aborted with {} failures", failures.len());
        failures
    }

    fn validate_batch(&self, batch: &[PlacementRequest]) -> VaultResult<Stage<UniqueIndex>> {
        let repeated = repeated_runtime_ids(batch);
        if !repeated.is_empty() {
            return Ok(Err(repeated));
        }

        let state = loaded(&self.state)?;
        let pending = match validate_uniqueness(&state.unique_entries, &state.data, batch) {
            Ok(pending) => pending,
            Err(failures) => return Ok(Err(failures)),
        };

        if state.image_size().is_some() {
            let failures: Vec<PlacementFailure> = batch
                .iter()
                .enumerate()
                .filter(|(_, request)| request.images.is_none())
                .filter(|(_, request)| {
                    request
                        .runtime_id
                        .as_deref()
                        .and_then(|id| state.data.get(id))
                        .map_or(true, |current| current.image.is_none())
                })
                .map(|(index, _)| PlacementFailure {
                    index,
                    reason: InvalidReason::MissingImage,
                })
                .collect();
            if !failures.is_empty() {
                return Ok(Err(failures));
            }
        }
        Ok(Ok(pending))
    }

    /// Resolve ids and slots, keeping only items that change something
    ///
    /// Slot references supplied by callers are ignored: an item keeps the slot
    /// it already owns, and new items get theirs at commit.
    fn plan(&self, batch: Vec<PlacementRequest>) -> VaultResult<Vec<Planned>> {
        let state = loaded(&self.state)?;
        let has_image = state.image_size().is_some();
        let mut assigned: HashSet<String> = HashSet::new();
        let mut planned = Vec::new();

        for (index, request) in batch.into_iter().enumerate() {
            let PlacementRequest {
                runtime_id,
                mut source,
                images,
            } = request;

            let runtime_id = match runtime_id {
                Some(id) => id,
                None => loop {
                    let id = self.acquire_new_runtime_id()?;
                    if !assigned.contains(&id) {
                        break id;
                    }
                },
            };
            assigned.insert(runtime_id.clone());

            let current = state.data.get(&runtime_id);
            let (images, replaces) = if has_image {
                let owned = current.and_then(|item| item.image.clone());
                source.image = owned.clone();
                (images, owned)
            } else {
                source.image = None;
                (None, None)
            };

            let changed =
                current.map_or(true, |current| current.differs_from(&source, state.entries()));
            if changed || images.is_some() {
                planned.push(Planned {
                    index,
                    runtime_id,
                    item: source,
                    images,
                    replaces,
                });
            }
        }
        Ok(planned)
    }

    /// Load every existing pool the commit will draw into
    async fn prefetch_pools(&mut self, planned: &[Planned]) -> VaultResult<Stage<()>> {
        let state = loaded(&self.state)?;
        let fresh = planned
            .iter()
            .filter(|plan| plan.images.is_some() && plan.replaces.is_none())
            .count();
        let mut allocations = state.pools.plan_allocations(fresh).into_iter();

        let mut targets: Vec<(usize, String)> = Vec::new();
        for plan in planned.iter().filter(|plan| plan.images.is_some()) {
            let pool = match &plan.replaces {
                Some(slot) => Some(slot.name.clone()),
                None => allocations.next().flatten(),
            };
            if let Some(pool) = pool {
                targets.push((plan.index, pool));
            }
        }

        let mut failures = Vec::new();
        let mut failed: HashMap<String, String> = HashMap::new();
        let mut attempted: BTreeSet<String> = BTreeSet::new();
        for (index, pool) in targets {
            if !attempted.contains(&pool) {
                attempted.insert(pool.clone());
                if let Err(e) = self.ensure_pool_loaded(&pool).await {
                    failed.insert(pool.clone(), e.to_string());
                }
            }
            if let Some(description) = failed.get(&pool) {
                failures.push(PlacementFailure {
                    index,
                    reason: InvalidReason::ImageFetchFailed {
                        description: description.clone(),
                    },
                });
            }
        }

        Ok(if failures.is_empty() { Ok(()) } else { Err(failures) })
    }

    /// Apply a validated batch; nothing in here can fail halfway
    fn commit(&mut self, planned: Vec<Planned>, pending_unique: UniqueIndex) -> VaultResult<()> {
        let geometry = self.config.geometry();
        let downscale = self.config.thumbnail_downscale;
        let state = loaded_mut(&mut self.state)?;

        let patch = state.tag_patch.take();
        let registers_tags = patch.as_ref().map_or(false, |patch| !patch.is_empty());
        // the registry is persisted with the core record
        if !planned.is_empty() || registers_tags {
            self.tracker.mark_core_dirty();
        }
        if let Some(mut patch) = patch {
            patch.confirm(&mut state.tags);
        }

        let slot_size = state.image_size().map(|size| to_thumbnail_size(size, downscale));
        let mut placed: Vec<(String, DataItem)> = Vec::with_capacity(planned.len());

        for Planned {
            runtime_id,
            mut item,
            images,
            replaces,
            ..
        } in planned
        {
            if let (Some(images), Some(slot_size)) = (images, slot_size) {
                let slot = match replaces {
                    Some(slot) => slot,
                    None => {
                        let allocation = state.pools.allocate_slot(&mut self.tracker);
                        if allocation.created {
                            let blank = create_empty_pool(slot_size, geometry);
                            state.cache.insert_pool(allocation.slot.name.clone(), blank);
                        }
                        allocation.slot
                    }
                };

                if !state.cache.has_pool(&slot.name) {
                    log::warn!("Pool {} missing from cache at commit, starting blank", slot.name);
                    let blank = create_empty_pool(slot_size, geometry);
                    state.cache.insert_pool(slot.name.clone(), blank);
                }
                if let Some(pool) = state.cache.pool_mut(&slot.name) {
                    place_into_pool(pool, slot.index, &images.thumbnail, slot_size, geometry);
                }
                self.tracker.mark_images_dirty([slot.name.clone()]);

                let released = state
                    .cache
                    .place(&runtime_id, Some(images.image), Some(images.thumbnail_handle));
                if !released.is_empty() {
                    log::debug!("Released {} cached images of {}", released.len(), runtime_id);
                }
                self.tracker.mark_images_dirty([runtime_id.clone()]);
                item.image = Some(slot);
            }
            placed.push((runtime_id, item));
        }

        // values given up by updated items
        for (runtime_id, item) in &placed {
            let Some(previous) = state.data.get(runtime_id) else {
                continue;
            };
            for (entry_name, values) in state.unique_entries.iter_mut() {
                let old = previous.entries.get(entry_name).and_then(|data| data.as_str());
                let new = item.entries.get(entry_name).and_then(|data| data.as_str());
                if let Some(old) = old {
                    if new != Some(old) {
                        values.remove(old);
                    }
                }
            }
        }
        for (entry_name, values) in pending_unique {
            state.unique_entries.entry(entry_name).or_default().extend(values);
        }

        let count = placed.len();
        state.data.extend(placed);
        if count > 0 {
            log::info!("Placed {} items", count);
        }
        self.tracker.notify();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use crate::model::EntryData;
    use crate::store::tests::{text_store, titled};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_insert_new_items() {
        let mut store = text_store(&[]);
        let failures = store
            .place_items(vec![
                PlacementRequest::insert(titled("Dune")),
                PlacementRequest::insert(titled("Emma")),
            ])
            .await
            .unwrap();
        assert!(failures.is_empty());
        assert_eq!(store.items().unwrap().len(), 2);
        assert!(store.is_unsaved());
    }

    #[tokio::test]
    async fn test_duplicate_against_existing_is_atomic() {
        let mut store = text_store(&[("a", "Dune")]);
        let before = store.items().unwrap().clone();
        let version = store.snapshot().unwrap().core_version;

        let failures = store
            .place_items(vec![
                PlacementRequest::insert(titled("Emma")),
                PlacementRequest::insert(titled("Dune")),
            ])
            .await
            .unwrap();

        assert_eq!(
            failures,
            vec![PlacementFailure {
                index: 1,
                reason: InvalidReason::DuplicatedValue {
                    entry_name: "title".into(),
                    value: "Dune".into(),
                },
            }]
        );
        assert_eq!(store.items().unwrap(), &before);
        assert_eq!(store.snapshot().unwrap().core_version, version);
    }

    #[tokio::test]
    async fn test_duplicate_within_batch() {
        let mut store = text_store(&[]);
        let failures = store
            .place_items(vec![
                PlacementRequest::insert(titled("Dune")),
                PlacementRequest::insert(titled("Dune")),
            ])
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 1);
        assert!(store.items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_keeps_own_value() {
        let mut store = text_store(&[("a", "Dune")]);
        let score = EntryData::Rating { score: 5, comment: None };
        let updated = titled("Dune").with_entry("score", score);
        let request = PlacementRequest::update("a", updated.clone());
        let failures = store.place_items(vec![request]).await.unwrap();
        assert!(failures.is_empty());
        assert_eq!(store.item("a"), Some(&updated));
    }

    #[tokio::test]
    async fn test_unknown_runtime_id_with_taken_value() {
        let mut store = text_store(&[("a", "Dune")]);
        let request = PlacementRequest::update("ghost", titled("Dune"));
        let failures = store.place_items(vec![request]).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert!(store.item("ghost").is_none());
    }

    #[tokio::test]
    async fn test_renamed_value_is_released() {
        let mut store = text_store(&[("a", "Dune")]);
        let rename = PlacementRequest::update("a", titled("Dune Messiah"));
        assert!(store.place_items(vec![rename]).await.unwrap().is_empty());
        let request = PlacementRequest::insert(titled("Dune"));
        let failures = store.place_items(vec![request]).await.unwrap();
        assert!(failures.is_empty());
        assert_eq!(store.items().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_item_is_not_a_modification() {
        let mut store = text_store(&[("a", "Dune")]);
        let request = PlacementRequest::update("a", titled("Dune"));
        let failures = store.place_items(vec![request]).await.unwrap();
        assert!(failures.is_empty());
        assert!(!store.is_modified());
    }

    #[tokio::test]
    async fn test_tags_confirmed_only_on_success() {
        let mut store = text_store(&[("a", "Dune")]);

        let ids = store.register_tags("color", &["red"]).unwrap();
        let rejected = titled("Dune").with_entry("color", EntryData::tags(ids));
        let failures = store.place_items(vec![PlacementRequest::insert(rejected)]).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert!(store.tags().unwrap().is_empty());

        let ids = store.register_tags("color", &["red", "blue"]).unwrap();
        assert_eq!(ids, vec![0, 1]);
        let accepted = titled("Emma").with_entry("color", EntryData::tags(ids));
        let request = PlacementRequest::insert(accepted);
        assert!(store.place_items(vec![request]).await.unwrap().is_empty());
        assert_eq!(store.tags().unwrap()["color"], vec!["red", "blue"]);
    }

    #[tokio::test]
    async fn test_repeated_runtime_id_rejected() {
        let mut store = text_store(&[("a", "Dune")]);
        let before = store.snapshot().unwrap();

        let failures = store
            .place_items(vec![
                PlacementRequest::update("a", titled("Emma")),
                PlacementRequest::update("a", titled("Persuasion")),
            ])
            .await
            .unwrap();
        assert_eq!(
            failures,
            vec![PlacementFailure {
                index: 1,
                reason: InvalidReason::DuplicatedRuntimeId { runtime_id: "a".into() },
            }]
        );
        assert_eq!(store.snapshot().unwrap(), before);

        // neither value was reserved by the rejected batch
        let failures = store
            .place_items(vec![
                PlacementRequest::insert(titled("Emma")),
                PlacementRequest::insert(titled("Persuasion")),
            ])
            .await
            .unwrap();
        assert!(failures.is_empty());
        assert_eq!(store.items().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_confirmed_tags_count_as_modification() {
        let mut store = text_store(&[("a", "Dune")]);
        store.register_tags("color", &["red"]).unwrap();

        let request = PlacementRequest::update("a", titled("Dune"));
        let failures = store.place_items(vec![request]).await.unwrap();
        assert!(failures.is_empty());
        assert_eq!(store.tags().unwrap()["color"], vec!["red"]);
        assert!(store.is_modified());
        assert!(store.is_unsaved());
    }

    #[tokio::test]
    async fn test_not_loaded() {
        let mut store = DatasourceStore::without_images(crate::StoreConfig::default()).unwrap();
        let err = store.place_items(vec![PlacementRequest::insert(titled("x"))]).await.unwrap_err();
        assert!(matches!(err, VaultError::NotLoaded));
    }
}
