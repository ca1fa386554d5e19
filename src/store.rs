//! Rule Store - one RuleSet per template id
//!
//! Parent/child relationships are kept in an explicit adjacency index
//! (parent id -> ordered child ids) maintained alongside the rule sets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::rules::{LayerKey, PropertyError, PropertyKey, RuleSet, Size, TemplateId};
use crate::validation::{RuleError, Validator};

#[derive(Debug, Error, PartialEq)]
pub enum EditError {
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template already exists: {0}")]
    DuplicateTemplate(String),

    #[error("Layer {layer} not found in {template}")]
    LayerNotFound { template: String, layer: LayerKey },

    #[error("Layer {layer} already exists in {template}")]
    DuplicateLayer { template: String, layer: LayerKey },

    #[error("Template {0} is not a child template")]
    NotAChild(String),

    #[error("Property {property} of {layer} is not inherited from a parent")]
    NotInherited { layer: LayerKey, property: PropertyKey },

    #[error(transparent)]
    Property(#[from] PropertyError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleStore {
    rule_sets: BTreeMap<TemplateId, RuleSet>,
    children: BTreeMap<TemplateId, Vec<TemplateId>>,
    parents: BTreeMap<TemplateId, TemplateId>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load parent rule sets from `*.json` files. Rejected files are logged and skipped.
    pub fn load_from_dir(dir: &Path) -> Result<Self, std::io::Error> {
        let mut store = Self::new();
        if !dir.exists() {
            return Ok(store);
        }

        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |e| e == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let content = fs::read_to_string(&path)?;
            match crate::validation::import_json(&content) {
                Ok(rules) => {
                    if let Err(e) = store.insert_parent(rules) {
                        tracing::warn!(path = %path.display(), error = %e, "skipping rule file");
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping rule file");
                }
            }
        }
        Ok(store)
    }

    /// Validate and register a parent RuleSet.
    pub fn register_parent(&mut self, rules: RuleSet) -> Result<(), RuleError> {
        let rules = Validator::new().admit(rules)?;
        self.insert_parent(rules)
            .map_err(|e| RuleError::Malformed(e.to_string()))
    }

    fn insert_parent(&mut self, rules: RuleSet) -> Result<(), EditError> {
        if self.rule_sets.contains_key(&rules.id) {
            return Err(EditError::DuplicateTemplate(rules.id));
        }
        self.children.insert(rules.id.clone(), vec![]);
        self.rule_sets.insert(rules.id.clone(), rules);
        Ok(())
    }

    /// Deep-copy the parent into a new child, optionally remapped to a preset canvas.
    pub fn create_child(
        &mut self,
        parent_id: &str,
        child_id: Option<&str>,
        preset: Option<Size>,
    ) -> Result<TemplateId, EditError> {
        if self.parents.contains_key(parent_id) {
            return Err(EditError::NotAChild(format!(
                "{} is itself a child and cannot be derived from",
                parent_id
            )));
        }
        let parent = self
            .rule_sets
            .get(parent_id)
            .ok_or_else(|| EditError::TemplateNotFound(parent_id.to_string()))?;

        let id = child_id.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        if self.rule_sets.contains_key(&id) {
            return Err(EditError::DuplicateTemplate(id));
        }

        let mut child = parent.clone();
        child.id = id.clone();
        if let Some(size) = preset {
            child.width = size.width.max(1);
            child.height = size.height.max(1);
        }

        self.rule_sets.insert(id.clone(), child);
        self.parents.insert(id.clone(), parent_id.to_string());
        self.children.entry(parent_id.to_string()).or_default().push(id.clone());
        tracing::debug!(parent = parent_id, child = %id, "created child template");
        Ok(id)
    }

    /// Remove a child and its adjacency entry. Callers outside the crate go
    /// through `Resolver::remove_child`, which also drops its overrides.
    pub(crate) fn remove_child(&mut self, child_id: &str) -> Result<RuleSet, EditError> {
        let parent = self
            .parents
            .remove(child_id)
            .ok_or_else(|| EditError::NotAChild(child_id.to_string()))?;
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.retain(|c| c != child_id);
        }
        self.rule_sets
            .remove(child_id)
            .ok_or_else(|| EditError::TemplateNotFound(child_id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<&RuleSet> {
        self.rule_sets.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut RuleSet> {
        self.rule_sets.get_mut(id)
    }

    pub(crate) fn require(&self, id: &str) -> Result<&RuleSet, EditError> {
        self.get(id).ok_or_else(|| EditError::TemplateNotFound(id.to_string()))
    }

    pub(crate) fn require_mut(&mut self, id: &str) -> Result<&mut RuleSet, EditError> {
        self.get_mut(id).ok_or_else(|| EditError::TemplateNotFound(id.to_string()))
    }

    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.parents.get(id).map(String::as_str)
    }

    pub fn is_parent(&self, id: &str) -> bool {
        self.rule_sets.contains_key(id) && !self.parents.contains_key(id)
    }

    /// Children in creation order.
    pub fn children_of(&self, id: &str) -> &[TemplateId] {
        self.children.get(id).map_or(&[], Vec::as_slice)
    }

    pub fn ids(&self) -> impl Iterator<Item = &TemplateId> {
        self.rule_sets.keys()
    }

    pub fn len(&self) -> usize {
        self.rule_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rule_sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{FontSize, Layer, TextRule};

    fn parent() -> RuleSet {
        RuleSet::new("parent", 500, 900)
            .with_layer(Layer::text("title", TextRule::new("title", FontSize::Px(32.0))))
    }

    #[test]
    fn test_child_is_deep_copy() {
        let mut store = RuleStore::new();
        store.register_parent(parent()).unwrap();
        let id = store
            .create_child("parent", Some("story"), Some(Size::new(1080, 1920)))
            .unwrap();

        let child = store.get(&id).unwrap();
        assert_eq!(child.canvas(), Size::new(1080, 1920));
        assert_eq!(child.layers, store.get("parent").unwrap().layers);
        assert_eq!(store.children_of("parent"), &["story".to_string()]);
        assert_eq!(store.parent_of("story"), Some("parent"));
    }

    #[test]
    fn test_generated_child_ids_are_unique() {
        let mut store = RuleStore::new();
        store.register_parent(parent()).unwrap();
        let a = store.create_child("parent", None, None).unwrap();
        let b = store.create_child("parent", None, None).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.children_of("parent").len(), 2);
    }

    #[test]
    fn test_grandchildren_rejected() {
        let mut store = RuleStore::new();
        store.register_parent(parent()).unwrap();
        store.create_child("parent", Some("c1"), None).unwrap();
        assert!(store.create_child("c1", Some("c2"), None).is_err());
    }

    #[test]
    fn test_remove_child_updates_index() {
        let mut store = RuleStore::new();
        store.register_parent(parent()).unwrap();
        store.create_child("parent", Some("c1"), None).unwrap();
        store.remove_child("c1").unwrap();
        assert!(store.children_of("parent").is_empty());
        assert!(store.get("c1").is_none());
    }
}
