//! Item Vault - Save Pipeline
//!
//! Every save encrypts the core record plus each selected image with the
//! active data key. The key may seal at most `encrypt_message_limit`
//! messages; a save that would cross the limit is deferred and reports how
//! many messages it needed, so the caller can regenerate the key first.

use super::{loaded, loaded_mut, DatasourceStore};
use crate::crypto::datasource::{check_quota, seal_record};
use crate::crypto::{encrypt_image, IMAGE_FORMAT, THUMBNAIL_FORMAT};
use crate::error::{VaultError, VaultResult};
use crate::model::{DatasourceRecord, ImagesRecord, ProtectionRecord};
use crate::raster::encode_image;

/// Produced package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedPackage {
    pub name: String,
    pub bytes: Vec<u8>,
    /// Messages sealed for this package
    pub messages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(SavedPackage),
    /// Nothing was written; the data key must be regenerated first
    RekeyRequired { messages_to_encrypt: u64 },
}

impl SaveOutcome {
    pub fn package(self) -> Option<SavedPackage> {
        match self {
            SaveOutcome::Saved(package) => Some(package),
            SaveOutcome::RekeyRequired { .. } => None,
        }
    }
}

impl DatasourceStore {
    /// Package the images modified since the datasource was loaded
    pub async fn save_delta(&mut self) -> VaultResult<SaveOutcome> {
        let state = loaded(&self.state)?;
        let names: Vec<String> = if state.image_size().is_some() {
            self.tracker
                .modified_images()
                .filter(|name| state.pools.contains(name) || state.data.contains_key(*name))
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        let package_name = self.config.delta_package_name.clone();
        self.save(names, &package_name).await
    }

    /// Package every pool and every full image
    pub async fn save_all(&mut self) -> VaultResult<SaveOutcome> {
        let state = loaded(&self.state)?;
        let names: Vec<String> = if state.image_size().is_some() {
            state
                .pools
                .names()
                .map(str::to_string)
                .chain(state.data.keys().cloned())
                .collect()
        } else {
            Vec::new()
        };
        let package_name = self.config.full_package_name.clone();
        self.save(names, &package_name).await
    }

    /// Encrypt the selected images and the core record into one package
    ///
    /// A name is a pool when the pool directory knows it, an item id
    /// otherwise. Any failure leaves counters and dirty state untouched.
    pub async fn save(
        &mut self,
        image_names: Vec<String>,
        package_name: &str,
    ) -> VaultResult<SaveOutcome> {
        let state = loaded(&self.state)?;
        let messages = image_names.len() as u64 + 1;
        let counter = state.protection.encrypted_counter;
        let limit = self.config.encrypt_message_limit;

        let new_counter = match check_quota(counter, messages, limit) {
            Ok(total) => total,
            Err(e) => {
                log::warn!("Save deferred: {}", e);
                self.encrypts_to_be_done = messages;
                return Ok(SaveOutcome::RekeyRequired {
                    messages_to_encrypt: messages,
                });
            }
        };

        let mut package = (self.package_factory)(&state.configurations.global.name);

        for name in &image_names {
            let is_pool = loaded(&self.state)?.pools.contains(name);
            let (file_name, encrypted) = if is_pool {
                self.ensure_pool_loaded(name).await?;
                let state = loaded(&self.state)?;
                let raster = state
                    .cache
                    .pool(name)
                    .ok_or_else(|| VaultError::Validation(format!("pool {} not loaded", name)))?;
                let bytes = encode_image(raster, &THUMBNAIL_FORMAT)?;
                (
                    THUMBNAIL_FORMAT.file_name(name),
                    encrypt_image(&bytes, &THUMBNAIL_FORMAT, state.encryption_key())?,
                )
            } else {
                let handle = self.get_image(name).await?;
                let state = loaded(&self.state)?;
                (
                    IMAGE_FORMAT.file_name(name),
                    encrypt_image(handle.bytes(), &IMAGE_FORMAT, state.encryption_key())?,
                )
            };
            package.add_from_bytes(&file_name, &encrypted)?;
        }

        let state = loaded(&self.state)?;
        let record = DatasourceRecord {
            protection: ProtectionRecord {
                encrypted_counter: new_counter,
            },
            configurations: state.configurations.clone(),
            images: state.image_size().map(|_| ImagesRecord {
                pools: state.pools.records().to_vec(),
            }),
            tags: state.tags.clone(),
            data: state.data.clone(),
        };
        let envelope = seal_record(&record, &state.runtime, state.encryption_key())?;
        package.add_from_text(&self.config.data_file_name, &envelope.to_json()?)?;
        let bytes = package.finalize()?;

        let state = loaded_mut(&mut self.state)?;
        state.protection.encrypted_counter = new_counter;
        self.tracker.mark_core_dirty();
        self.tracker.mark_saved();
        self.encrypts_to_be_done = 0;

        log::info!(
            "Saved {} ({} bytes, {} messages, counter now {})",
            package_name,
            bytes.len(),
            messages,
            state.protection.encrypted_counter
        );
        Ok(SaveOutcome::Saved(SavedPackage {
            name: package_name.to_string(),
            bytes,
            messages,
        }))
    }
}
