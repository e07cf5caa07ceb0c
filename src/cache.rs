//! Item Vault - Image Cache
//!
//! Decoded thumbnail pools keyed by pool name, and encoded per-item images
//! (full image and cropped thumbnail) keyed by runtime id. A handle that is
//! replaced is released and handed back to the caller.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use image::RgbaImage;

/// Shared, immutable encoded image
#[derive(Clone)]
pub struct ImageHandle {
    bytes: Arc<[u8]>,
    mime: &'static str,
}

impl ImageHandle {
    pub fn new(bytes: Vec<u8>, mime: &'static str) -> Self {
        Self {
            bytes: bytes.into(),
            mime,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime(&self) -> &'static str {
        self.mime
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Both handles refer to the same allocation
    pub fn same_as(&self, other: &ImageHandle) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageHandle")
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ImageCache {
    images: HashMap<String, ImageHandle>,
    thumbnails: HashMap<String, ImageHandle>,
    pools: HashMap<String, RgbaImage>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(&self, runtime_id: &str) -> Option<&ImageHandle> {
        self.images.get(runtime_id)
    }

    pub fn thumbnail(&self, runtime_id: &str) -> Option<&ImageHandle> {
        self.thumbnails.get(runtime_id)
    }

    /// Place or replace the handles of one item, returning the released ones
    pub fn place(
        &mut self,
        runtime_id: &str,
        image: Option<ImageHandle>,
        thumbnail: Option<ImageHandle>,
    ) -> Vec<ImageHandle> {
        let mut released = Vec::new();
        for (handle, slot) in [(image, &mut self.images), (thumbnail, &mut self.thumbnails)] {
            let Some(handle) = handle else {
                continue;
            };
            if slot.get(runtime_id).map_or(false, |current| current.same_as(&handle)) {
                continue;
            }
            if let Some(old) = slot.insert(runtime_id.to_string(), handle) {
                released.push(old);
            }
        }
        released
    }

    /// Drop both handles of an item
    pub fn release(&mut self, runtime_id: &str) -> Vec<ImageHandle> {
        self.images
            .remove(runtime_id)
            .into_iter()
            .chain(self.thumbnails.remove(runtime_id))
            .collect()
    }

    pub fn pool(&self, name: &str) -> Option<&RgbaImage> {
        self.pools.get(name)
    }

    pub fn pool_mut(&mut self, name: &str) -> Option<&mut RgbaImage> {
        self.pools.get_mut(name)
    }

    pub fn has_pool(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn insert_pool(&mut self, name: impl Into<String>, raster: RgbaImage) {
        self.pools.insert(name.into(), raster);
    }

    pub fn clear(&mut self) {
        self.images.clear();
        self.thumbnails.clear();
        self.pools.clear();
    }
}
