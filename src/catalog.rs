//! Field Metadata Catalog
//!
//! Canonical list of bindable fields, derived once from the parent RuleSet.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::rules::{LayerKey, RuleSet, TextRule};

/// Synthetic catalog entry for the canvas background.
pub const BACKGROUND_FIELD: &str = "backgroundColor";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMeta {
    pub default_value: String,
    pub metadata_key: Option<String>,
    /// Layer declaring the field; `None` for the synthetic background entry.
    pub layer_key: Option<LayerKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldCatalog {
    fields: BTreeMap<String, FieldMeta>,
}

/// Field name a text layer binds to: its `fieldName`, else its layer key.
pub fn field_key<'r>(layer_key: &'r str, text: &'r TextRule) -> &'r str {
    if text.field_name.trim().is_empty() {
        layer_key
    } else {
        &text.field_name
    }
}

impl FieldCatalog {
    pub fn build(parent: &RuleSet) -> Self {
        let mut fields = BTreeMap::new();

        for (layer_key, text) in parent.text_layers() {
            fields
                .entry(field_key(layer_key, text).to_string())
                .or_insert_with(|| FieldMeta {
                    default_value: text.default_value.clone(),
                    metadata_key: text.metadata_key.clone(),
                    layer_key: Some(layer_key.clone()),
                });
        }

        fields.entry(BACKGROUND_FIELD.to_string()).or_insert_with(|| FieldMeta {
            default_value: parent.background_color.to_string(),
            metadata_key: None,
            layer_key: None,
        });

        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&FieldMeta> {
        self.fields.get(field)
    }

    pub fn default_for(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(|m| m.default_value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldMeta)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
