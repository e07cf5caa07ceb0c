//! Item Vault - Dumped Item Import
//!
//! Builds a [`DataItem`] from user supplied JSON such as
//! `{"title": "Dune", "color": ["red"], "score": {"score": 4}}`, checking every
//! schema rule on the way. Tags are registered through the store's pending tag
//! patch, so they only land in the registry once the item is placed.

use serde_json::Value;

use super::{loaded, DatasourceStore};
use crate::error::{VaultError, VaultResult};
use crate::model::{DataItem, EntryConfiguration, EntryData, EntryType};
use crate::raster::{load_image, LoadedImage};

/// An imported item, ready for placement
#[derive(Debug, Clone)]
pub struct DumpedItem {
    pub data: DataItem,
    pub images: Option<LoadedImage>,
}

fn invalid(detail: impl Into<String>) -> VaultError {
    VaultError::Validation(detail.into())
}

fn string_loader(value: &Value, config: &EntryConfiguration) -> VaultResult<EntryData> {
    let text = value
        .as_str()
        .ok_or_else(|| invalid(format!("{}: expected a string", config.name)))?;
    if text.is_empty() && !config.optional {
        return Err(invalid(format!("{}: required entry is empty", config.name)));
    }
    Ok(EntryData::string(text))
}

/// Validated tag strings; ids are assigned by the caller
fn tag_loader(value: &Value, config: &EntryConfiguration) -> VaultResult<Vec<String>> {
    let values = value
        .as_array()
        .ok_or_else(|| invalid(format!("{}: expected an array", config.name)))?;
    let tags = values
        .iter()
        .map(|tag| match tag.as_str() {
            Some(tag) if !tag.is_empty() => Ok(tag.to_string()),
            _ => Err(invalid(format!("{}: tags must be non-empty strings", config.name))),
        })
        .collect::<VaultResult<Vec<_>>>()?;

    if config.exclusive && tags.len() > 1 {
        return Err(invalid(format!("{}: exclusive entry takes at most one tag", config.name)));
    }
    if !config.optional && tags.is_empty() {
        return Err(invalid(format!("{}: required entry has no tags", config.name)));
    }
    Ok(tags)
}

fn rating_loader(value: &Value, config: &EntryConfiguration) -> VaultResult<EntryData> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid(format!("{}: expected a rating object", config.name)))?;
    let score = object
        .get("score")
        .and_then(Value::as_u64)
        .and_then(|score| u32::try_from(score).ok())
        .ok_or_else(|| invalid(format!("{}: rating needs a numeric score", config.name)))?;
    if score == 0 && !config.optional {
        return Err(invalid(format!("{}: required rating is zero", config.name)));
    }
    let comment = match object.get("comment") {
        None | Some(Value::Null) => None,
        Some(Value::String(comment)) => Some(comment.clone()),
        Some(_) => return Err(invalid(format!("{}: comment must be a string", config.name))),
    };
    Ok(EntryData::Rating { score, comment })
}

impl DatasourceStore {
    /// Parse a dumped item and, when the schema has images, load its image
    pub fn load_dumped_item(
        &mut self,
        text: &str,
        image: Option<&[u8]>,
    ) -> VaultResult<DumpedItem> {
        let parsed: Value = serde_json::from_str(text)?;
        let object = parsed
            .as_object()
            .ok_or_else(|| invalid("the top level must be an object"))?;

        let state = loaded(&self.state)?;
        let entries = state.entries().to_vec();
        let image_size = state.image_size();

        let mut data = DataItem::default();
        for config in &entries {
            let Some(value) = object.get(&config.name) else {
                if !config.optional {
                    return Err(invalid(format!("{}: required entry is missing", config.name)));
                }
                continue;
            };
            let entry = match config.kind {
                EntryType::String => string_loader(value, config)?,
                EntryType::Rating => rating_loader(value, config)?,
                EntryType::Tag => {
                    let tags = tag_loader(value, config)?;
                    EntryData::tags(self.register_tags(&config.name, &tags)?)
                }
            };
            data.entries.insert(config.name.clone(), entry);
        }

        let images = match image_size {
            Some(size) => {
                let bytes = image.ok_or_else(|| invalid("the schema requires an image"))?;
                Some(load_image(bytes, size, self.config.thumbnail_downscale)?)
            }
            None => None,
        };
        Ok(DumpedItem { data, images })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::text_store;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_full_item() {
        let mut store = text_store(&[]);
        let item = store
            .load_dumped_item(
                r#"{"title": "Dune", "color": ["red", "blue", "red"],
                    "score": {"score": 4, "comment": "long"}}"#,
                None,
            )
            .unwrap();
        assert_eq!(
            item.data,
            DataItem::default()
                .with_entry("title", EntryData::string("Dune"))
                .with_entry("color", EntryData::Tag { tag_ids: vec![0, 1] })
                .with_entry("score", EntryData::Rating { score: 4, comment: Some("long".into()) })
        );
        assert!(item.images.is_none());
    }

    #[test]
    fn test_missing_required_entry() {
        let mut store = text_store(&[]);
        let err = store.load_dumped_item(r#"{"color": ["red"]}"#, None).unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
    }

    #[test]
    fn test_malformed_json() {
        let mut store = text_store(&[]);
        let err = store.load_dumped_item("{title", None).unwrap_err();
        assert!(matches!(err, VaultError::Parse(_)));
        assert!(matches!(store.load_dumped_item("[1, 2]", None), Err(VaultError::Validation(_))));
    }

    #[test]
    fn test_loaders() {
        let required = EntryConfiguration::new("x", EntryType::String);
        assert!(string_loader(&Value::from(""), &required).is_err());
        assert!(string_loader(&Value::from(""), &required.clone().optional()).is_ok());
        assert!(string_loader(&Value::from(3), &required).is_err());

        let exclusive = EntryConfiguration::new("t", EntryType::Tag).exclusive();
        assert!(tag_loader(&serde_json::json!(["a", "b"]), &exclusive).is_err());
        assert!(tag_loader(&serde_json::json!([]), &exclusive).is_err());
        assert!(tag_loader(&serde_json::json!([""]), &exclusive.clone().optional()).is_err());
        assert_eq!(tag_loader(&serde_json::json!(["a"]), &exclusive).unwrap(), vec!["a"]);

        let rating = EntryConfiguration::new("r", EntryType::Rating);
        assert!(rating_loader(&serde_json::json!({"score": 0}), &rating).is_err());
        assert!(rating_loader(&serde_json::json!({"comment": "x"}), &rating).is_err());
        assert_eq!(
            rating_loader(
                &serde_json::json!({"score": 0, "comment": null}),
                &rating.clone().optional()
            )
            .unwrap(),
            EntryData::Rating { score: 0, comment: None }
        );
    }
}
