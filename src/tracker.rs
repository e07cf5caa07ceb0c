//! Item Vault - Modification Tracker
//!
//! Counts modifications instead of recording them. Every image file (pool or
//! full image) and the core record carry a pseudo version number that grows by
//! one per modification; a snapshot of those numbers taken at the last save
//! tells whether the newest modification has been written out.

use std::collections::BTreeMap;

use tokio::sync::watch;

/// Pseudo version numbers of the core record and each image file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PseudoVersionNumbers {
    pub core: u64,
    pub images: BTreeMap<String, u64>,
}

/// Current vs last-saved pseudo versions
pub struct ModificationTracker {
    current: PseudoVersionNumbers,
    saved: PseudoVersionNumbers,
    /// Bumped after every state change, for observers
    notifier: watch::Sender<u64>,
}

impl Default for ModificationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ModificationTracker {
    pub fn new() -> Self {
        let (notifier, _) = watch::channel(0);
        Self {
            current: PseudoVersionNumbers::default(),
            saved: PseudoVersionNumbers::default(),
            notifier,
        }
    }

    /// Receiver of the change counter
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }

    /// Names of every image modified since the datasource was loaded
    pub fn modified_images(&self) -> impl Iterator<Item = &str> {
        self.current.images.keys().map(String::as_str)
    }

    pub fn is_modified(&self) -> bool {
        self.current.core > 0 || !self.current.images.is_empty()
    }

    /// Modified, and the latest modification has not been saved
    pub fn is_unsaved(&self) -> bool {
        if !self.is_modified() {
            return false;
        }
        if self.saved.core < self.current.core {
            return true;
        }
        self.current
            .images
            .iter()
            .any(|(name, version)| {
                self.saved.images.get(name).map_or(true, |saved| saved < version)
            })
    }

    pub fn mark_core_dirty(&mut self) {
        self.current.core += 1;
        self.notify();
    }

    pub fn mark_images_dirty<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            *self.current.images.entry(name.into()).or_insert(0) += 1;
        }
        self.notify();
    }

    pub fn mark_saved(&mut self) {
        self.saved = self.current.clone();
        self.notify();
    }

    pub fn reset(&mut self) {
        self.current = PseudoVersionNumbers::default();
        self.saved = PseudoVersionNumbers::default();
        self.notifier.send_replace(0);
    }

    pub fn current(&self) -> &PseudoVersionNumbers {
        &self.current
    }

    pub fn saved(&self) -> &PseudoVersionNumbers {
        &self.saved
    }

    /// Signal observers without touching the counters
    pub(crate) fn notify(&self) {
        self.notifier.send_modify(|version| *version += 1);
    }
}
