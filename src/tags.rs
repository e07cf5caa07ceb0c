//! Item Vault - Tag Patch
//!
//! Tags referenced by a batch of items are staged here and only written into
//! the registry once the whole batch has been accepted.

use std::collections::BTreeMap;

use crate::model::TagRegistry;

/// Staged tag registrations, per entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPatch {
    /// entry name -> (new tag -> assigned id)
    staged: BTreeMap<String, BTreeMap<String, u32>>,
}

impl TagPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an id for every tag, preserving input order
    ///
    /// Tags already in the registry keep their id, tags already staged keep
    /// their staged id, anything else gets `registered + staged` as its id.
    pub fn register<S: AsRef<str>>(
        &mut self,
        registry: &TagRegistry,
        entry_name: &str,
        tags: &[S],
    ) -> Vec<u32> {
        let existing = registry.get(entry_name);
        let offset = existing.map_or(0, Vec::len);
        let staged = self.staged.entry(entry_name.to_string()).or_default();

        tags.iter()
            .map(|tag| {
                let tag = tag.as_ref();
                if let Some(id) = existing.and_then(|tags| tags.iter().position(|t| t == tag)) {
                    return id as u32;
                }
                if let Some(id) = staged.get(tag) {
                    return *id;
                }
                let id = (offset + staged.len()) as u32;
                staged.insert(tag.to_string(), id);
                id
            })
            .collect()
    }

    /// Append staged tags to the registry in id order and clear the patch
    pub fn confirm(&mut self, registry: &mut TagRegistry) {
        for (entry_name, new_tags) in std::mem::take(&mut self.staged) {
            if new_tags.is_empty() {
                continue;
            }
            let mut ordered: Vec<(u32, String)> =
                new_tags.into_iter().map(|(tag, id)| (id, tag)).collect();
            ordered.sort_unstable();
            registry
                .entry(entry_name)
                .or_default()
                .extend(ordered.into_iter().map(|(_, tag)| tag));
        }
    }

    /// Drop all staged tags
    pub fn cancel(&mut self) {
        self.staged.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.staged.values().all(BTreeMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_stable_across_patches() {
        let mut registry = TagRegistry::new();

        let mut first = TagPatch::new();
        assert_eq!(first.register(&registry, "color", &["red"]), vec![0]);

        let mut second = TagPatch::new();
        assert_eq!(second.register(&registry, "color", &["red", "blue"]), vec![0, 1]);

        first.confirm(&mut registry);
        assert_eq!(registry["color"], vec!["red"]);

        let mut third = TagPatch::new();
        assert_eq!(third.register(&registry, "color", &["blue", "red"]), vec![1, 0]);
    }

    #[test]
    fn test_staged_reuse_and_confirm_order() {
        let mut registry = TagRegistry::new();
        registry.insert("genre".into(), vec!["drama".into()]);

        let mut patch = TagPatch::new();
        assert_eq!(patch.register(&registry, "genre", &["sci-fi", "drama", "noir"]), vec![1, 0, 2]);
        assert_eq!(patch.register(&registry, "genre", &["noir", "comedy"]), vec![2, 3]);

        patch.confirm(&mut registry);
        assert_eq!(registry["genre"], vec!["drama", "sci-fi", "noir", "comedy"]);
        assert!(patch.is_empty());
    }

    #[test]
    fn test_cancel_leaves_registry() {
        let mut registry = TagRegistry::new();
        let mut patch = TagPatch::new();
        patch.register(&registry, "color", &["red"]);
        patch.cancel();
        patch.confirm(&mut registry);
        assert!(registry.is_empty());
    }
}
