//! Inheritance Resolver
//!
//! Parent edits are pushed to children on write. A child keeps tracking the
//! parent for a property until it is edited directly; `reset_property`
//! drops the override and re-copies the parent's current value.
//!
//! The rule store and override tracker are mutated only through `Resolver`.

use serde::{Deserialize, Serialize};

use crate::overrides::{InheritanceToggles, OverrideTracker};
use crate::rules::{Layer, PropertyKey, PropertyValue, RuleSet, TemplateId, GENERAL_KEY};
use crate::store::{EditError, RuleStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyStatus {
    /// The template is a parent; its values are the source.
    Source,
    /// Tracking the parent.
    Inherited,
    /// Explicit child value, eligible for reset.
    Overridden,
    /// The layer exists only in the child (or was replaced there).
    Local,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditReport {
    pub updated_children: Vec<TemplateId>,
    pub override_recorded: bool,
}

/// Children that receive a parent write for `(layer_key, key)`.
///
/// Pure over its inputs: the toggle snapshot, the override map and a
/// predicate telling whether a child still holds the layer.
pub fn propagation_targets(
    layer_key: &str,
    key: PropertyKey,
    children: &[TemplateId],
    overrides: &OverrideTracker,
    toggles: InheritanceToggles,
    has_layer: impl Fn(&str) -> bool,
) -> Vec<TemplateId> {
    if !toggles.inherits(layer_key, key) {
        return vec![];
    }
    children
        .iter()
        .filter(|child| has_layer(child))
        .filter(|child| !overrides.is_overridden(child, layer_key, key))
        .cloned()
        .collect()
}

fn holds_layer(rules: &RuleSet, layer_key: &str) -> bool {
    layer_key == GENERAL_KEY || rules.contains_layer(layer_key)
}

/// Whether an edit or override state should be reported for badges.
pub fn property_status(
    store: &RuleStore,
    overrides: &OverrideTracker,
    template_id: &str,
    layer_key: &str,
    key: PropertyKey,
) -> Result<PropertyStatus, EditError> {
    store.require(template_id)?;
    let Some(parent_id) = store.parent_of(template_id) else {
        return Ok(PropertyStatus::Source);
    };
    let parent = store.require(parent_id)?;

    if !holds_layer(parent, layer_key) || overrides.is_layer_overridden(template_id, layer_key) {
        return Ok(PropertyStatus::Local);
    }
    if overrides.is_overridden(template_id, layer_key, key) {
        Ok(PropertyStatus::Overridden)
    } else {
        Ok(PropertyStatus::Inherited)
    }
}

pub struct Resolver<'a> {
    store: &'a mut RuleStore,
    overrides: &'a mut OverrideTracker,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a mut RuleStore, overrides: &'a mut OverrideTracker) -> Self {
        Self { store, overrides }
    }

    /// Write a property on a parent (with write-through) or a child (with override).
    pub fn set_property(
        &mut self,
        template_id: &str,
        layer_key: &str,
        key: PropertyKey,
        value: PropertyValue,
        toggles: InheritanceToggles,
    ) -> Result<EditReport, EditError> {
        if self.store.is_parent(template_id) {
            self.store.require_mut(template_id)?.set_property(layer_key, key, &value)?;

            let store = &*self.store;
            let targets = propagation_targets(
                layer_key,
                key,
                store.children_of(template_id),
                self.overrides,
                toggles,
                |child| store.get(child).map_or(false, |r| holds_layer(r, layer_key)),
            );

            let mut updated = Vec::with_capacity(targets.len());
            for child in targets {
                let rules = self.store.require_mut(&child)?;
                match rules.set_property(layer_key, key, &value) {
                    Ok(()) => updated.push(child),
                    Err(e) => {
                        tracing::warn!(
                            child = %child,
                            layer = layer_key,
                            error = %e,
                            "propagation skipped"
                        );
                    }
                }
            }
            tracing::debug!(
                template = template_id,
                layer = layer_key,
                property = %key,
                children = updated.len(),
                "parent property written"
            );
            return Ok(EditReport { updated_children: updated, override_recorded: false });
        }

        let parent_id = self
            .store
            .parent_of(template_id)
            .ok_or_else(|| EditError::TemplateNotFound(template_id.to_string()))?
            .to_string();
        let tracked = self.store.get(&parent_id).map_or(false, |p| holds_layer(p, layer_key))
            && !self.overrides.is_layer_overridden(template_id, layer_key);

        self.store.require_mut(template_id)?.set_property(layer_key, key, &value)?;
        // Recorded regardless of the toggle state of the property's class.
        if tracked {
            self.overrides.mark(template_id, layer_key, key);
        }
        Ok(EditReport { updated_children: vec![], override_recorded: tracked })
    }

    /// Drop a child's override and copy the parent's current value into it.
    pub fn reset_property(
        &mut self,
        child_id: &str,
        layer_key: &str,
        key: PropertyKey,
    ) -> Result<PropertyValue, EditError> {
        let parent_id = self
            .store
            .parent_of(child_id)
            .ok_or_else(|| EditError::NotAChild(child_id.to_string()))?
            .to_string();
        if self.overrides.is_layer_overridden(child_id, layer_key) {
            return Err(EditError::NotInherited { layer: layer_key.to_string(), property: key });
        }
        let value = self.store.require(&parent_id)?.get_property(layer_key, key).ok_or_else(|| {
            EditError::NotInherited { layer: layer_key.to_string(), property: key }
        })?;

        self.store.require_mut(child_id)?.set_property(layer_key, key, &value)?;
        self.overrides.clear(child_id, layer_key, key);
        Ok(value)
    }

    /// Restore the parent's copy of a layer in a child, dropping all its overrides.
    pub fn reset_layer(&mut self, child_id: &str, layer_key: &str) -> Result<(), EditError> {
        let parent_id = self
            .store
            .parent_of(child_id)
            .ok_or_else(|| EditError::NotAChild(child_id.to_string()))?
            .to_string();
        let parent = self.store.require(&parent_id)?;
        let position = parent.layers.iter().position(|l| l.key == layer_key);
        let layer = parent.layer(layer_key).cloned().ok_or_else(|| EditError::LayerNotFound {
            template: parent_id.clone(),
            layer: layer_key.to_string(),
        })?;

        let child = self.store.require_mut(child_id)?;
        match child.layer_mut(layer_key) {
            Some(existing) => *existing = layer,
            None => {
                let at = position.unwrap_or(child.layers.len()).min(child.layers.len());
                child.layers.insert(at, layer);
            }
        }
        self.overrides.clear_layer(child_id, layer_key);
        Ok(())
    }

    /// Delete a layer. Parent deletions cascade to children without a local copy.
    pub fn delete_layer(&mut self, template_id: &str, layer_key: &str) -> Result<(), EditError> {
        let missing = || EditError::LayerNotFound {
            template: template_id.to_string(),
            layer: layer_key.to_string(),
        };

        if self.store.is_parent(template_id) {
            self.store.require_mut(template_id)?.remove_layer(layer_key).ok_or_else(missing)?;
            let children = self.store.children_of(template_id).to_vec();
            for child in children {
                if !self.overrides.is_layer_overridden(&child, layer_key) {
                    if let Some(rules) = self.store.get_mut(&child) {
                        rules.remove_layer(layer_key);
                    }
                }
                // Whatever remains in the child is now local.
                self.overrides.clear_layer(&child, layer_key);
            }
            return Ok(());
        }

        let parent_id = self
            .store
            .parent_of(template_id)
            .ok_or_else(|| EditError::TemplateNotFound(template_id.to_string()))?
            .to_string();
        self.store.require_mut(template_id)?.remove_layer(layer_key).ok_or_else(missing)?;
        self.overrides.clear_layer(template_id, layer_key);
        if self.store.get(&parent_id).map_or(false, |p| p.contains_layer(layer_key)) {
            self.overrides.mark_layer(template_id, layer_key);
        }
        Ok(())
    }

    /// Add a layer. Parent additions are copied into every child lacking the key.
    pub fn add_layer(&mut self, template_id: &str, layer: Layer) -> Result<EditReport, EditError> {
        let rules = self.store.require(template_id)?;
        if layer.key == GENERAL_KEY || rules.contains_layer(&layer.key) {
            return Err(EditError::DuplicateLayer {
                template: template_id.to_string(),
                layer: layer.key,
            });
        }

        if self.store.is_parent(template_id) {
            let children = self.store.children_of(template_id).to_vec();
            let mut updated = vec![];
            for child in children {
                if let Some(rules) = self.store.get_mut(&child) {
                    if !rules.contains_layer(&layer.key) {
                        rules.layers.push(layer.clone());
                        updated.push(child);
                    }
                }
            }
            self.store.require_mut(template_id)?.layers.push(layer);
            return Ok(EditReport { updated_children: updated, override_recorded: false });
        }

        self.store.require_mut(template_id)?.layers.push(layer);
        Ok(EditReport::default())
    }

    /// Remove a child together with its override flags.
    pub fn remove_child(&mut self, child_id: &str) -> Result<RuleSet, EditError> {
        let removed = self.store.remove_child(child_id)?;
        self.overrides.clear_child(child_id);
        tracing::debug!(child = child_id, "removed child template");
        Ok(removed)
    }

    /// Install a child-local replacement for a layer.
    pub fn replace_child_layer(&mut self, child_id: &str, layer: Layer) -> Result<(), EditError> {
        let parent_id = self
            .store
            .parent_of(child_id)
            .ok_or_else(|| EditError::NotAChild(child_id.to_string()))?
            .to_string();
        let inherited = self.store.get(&parent_id).map_or(false, |p| p.contains_layer(&layer.key));
        let key = layer.key.clone();

        let child = self.store.require_mut(child_id)?;
        match child.layer_mut(&key) {
            Some(existing) => *existing = layer,
            None => child.layers.push(layer),
        }
        if inherited {
            self.overrides.clear_layer(child_id, &key);
            self.overrides.mark_layer(child_id, &key);
        }
        Ok(())
    }

    /// Re-copy every non-overridden inheritable property from the parent.
    ///
    /// Returns the number of properties written.
    pub fn resync_child(
        &mut self,
        child_id: &str,
        toggles: InheritanceToggles,
    ) -> Result<usize, EditError> {
        let parent_id = self
            .store
            .parent_of(child_id)
            .ok_or_else(|| EditError::NotAChild(child_id.to_string()))?
            .to_string();
        let parent = self.store.require(&parent_id)?.clone();

        let mut writes = vec![];
        let layer_keys =
            std::iter::once(GENERAL_KEY).chain(parent.layers.iter().map(|l| l.key.as_str()));
        for layer_key in layer_keys {
            for key in PropertyKey::ALL {
                if !toggles.inherits(layer_key, key)
                    || self.overrides.is_overridden(child_id, layer_key, key)
                {
                    continue;
                }
                if let Some(value) = parent.get_property(layer_key, key) {
                    writes.push((layer_key.to_string(), key, value));
                }
            }
        }

        let child = self.store.require_mut(child_id)?;
        let mut written = 0;
        for (layer_key, key, value) in writes {
            if !holds_layer(child, &layer_key) {
                continue;
            }
            if child.get_property(&layer_key, key).as_ref() == Some(&value) {
                continue;
            }
            match child.set_property(&layer_key, key, &value) {
                Ok(()) => written += 1,
                Err(e) => tracing::warn!(
                    child = child_id,
                    layer = %layer_key,
                    error = %e,
                    "resync skipped"
                ),
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Color, FontSize, ImageRule, TextRule};

    fn family() -> (RuleStore, OverrideTracker) {
        let parent = RuleSet::new("parent", 500, 900)
            .with_layer(Layer::text("title", TextRule::new("title", FontSize::Px(32.0))))
            .with_layer(Layer::image("hero", ImageRule::new(200.0, 300.0)));
        let mut store = RuleStore::new();
        store.register_parent(parent).unwrap();
        store.create_child("parent", Some("square"), None).unwrap();
        store.create_child("parent", Some("story"), None).unwrap();
        (store, OverrideTracker::new())
    }

    fn color(rules: &RuleSet) -> Option<PropertyValue> {
        rules.get_property("title", PropertyKey::Color)
    }

    #[test]
    fn test_parent_write_propagates() {
        let (mut store, mut overrides) = family();
        let red = PropertyValue::Color(Color::parse("ff0000").unwrap());
        let toggles = InheritanceToggles::default();
        let report = Resolver::new(&mut store, &mut overrides)
            .set_property("parent", "title", PropertyKey::Color, red.clone(), toggles)
            .unwrap();

        assert_eq!(report.updated_children, vec!["square".to_string(), "story".to_string()]);
        assert_eq!(color(store.get("story").unwrap()), Some(red));
    }

    #[test]
    fn test_disabled_class_does_not_propagate() {
        let (mut store, mut overrides) = family();
        let toggles = InheritanceToggles { style_props: true, position_props: false };
        Resolver::new(&mut store, &mut overrides)
            .set_property("parent", "title", PropertyKey::X, PropertyValue::Number(40.0), toggles)
            .unwrap();
        assert_eq!(
            store.get("square").unwrap().get_property("title", PropertyKey::X),
            Some(PropertyValue::Number(0.0))
        );
    }

    #[test]
    fn test_override_recorded_even_when_class_disabled() {
        let (mut store, mut overrides) = family();
        let x = PropertyValue::Number(5.0);
        let report = Resolver::new(&mut store, &mut overrides)
            .set_property("story", "title", PropertyKey::X, x, InheritanceToggles::none())
            .unwrap();
        assert!(report.override_recorded);
        assert!(overrides.is_overridden("story", "title", PropertyKey::X));
    }

    #[test]
    fn test_reset_resyncs_to_parent() {
        let (mut store, mut overrides) = family();
        let toggles = InheritanceToggles::default();
        let mut resolver = Resolver::new(&mut store, &mut overrides);
        let roboto = PropertyValue::Text("Roboto".into());
        resolver.set_property("story", "title", PropertyKey::Font, roboto, toggles).unwrap();
        let lato = PropertyValue::Text("Lato".into());
        resolver.set_property("parent", "title", PropertyKey::Font, lato, toggles).unwrap();
        let value = resolver.reset_property("story", "title", PropertyKey::Font).unwrap();

        assert_eq!(value, PropertyValue::Text("Lato".into()));
        assert_eq!(overrides.entry_count("story"), 0);
        assert_eq!(
            store.get("story").unwrap().get_property("title", PropertyKey::Font),
            Some(PropertyValue::Text("Lato".into()))
        );
    }

    #[test]
    fn test_parent_delete_cascades_except_local_copies() {
        let (mut store, mut overrides) = family();
        let mut resolver = Resolver::new(&mut store, &mut overrides);
        let mut local = ImageRule::new(50.0, 50.0);
        local.asset_id = Some("brand/logo".into());
        resolver.replace_child_layer("story", Layer::image("hero", local)).unwrap();
        resolver.delete_layer("parent", "hero").unwrap();

        assert!(!store.get("square").unwrap().contains_layer("hero"));
        assert!(store.get("story").unwrap().contains_layer("hero"));
        assert_eq!(overrides.entry_count("story"), 0);
    }

    #[test]
    fn test_child_delete_sticks() {
        let (mut store, mut overrides) = family();
        let mut resolver = Resolver::new(&mut store, &mut overrides);
        resolver.delete_layer("square", "hero").unwrap();
        let x = PropertyValue::Number(9.0);
        let report = resolver
            .set_property("parent", "hero", PropertyKey::X, x, InheritanceToggles::default())
            .unwrap();
        assert_eq!(report.updated_children, vec!["story".to_string()]);
        assert!(!store.get("square").unwrap().contains_layer("hero"));
        assert!(overrides.is_layer_overridden("square", "hero"));
    }

    #[test]
    fn test_recreated_child_starts_clean() {
        let (mut store, mut overrides) = family();
        let toggles = InheritanceToggles::default();
        let mut resolver = Resolver::new(&mut store, &mut overrides);
        resolver
            .set_property("square", "title", PropertyKey::X, PropertyValue::Number(5.0), toggles)
            .unwrap();
        resolver.remove_child("square").unwrap();
        assert!(resolver.remove_child("square").is_err());

        store.create_child("parent", Some("square"), None).unwrap();
        let report = Resolver::new(&mut store, &mut overrides)
            .set_property("parent", "title", PropertyKey::X, PropertyValue::Number(40.0), toggles)
            .unwrap();
        assert_eq!(report.updated_children, vec!["story".to_string(), "square".to_string()]);
        assert!(!overrides.is_overridden("square", "title", PropertyKey::X));
        assert_eq!(
            store.get("square").unwrap().get_property("title", PropertyKey::X),
            Some(PropertyValue::Number(40.0))
        );
    }

    #[test]
    fn test_child_only_layer_is_local() {
        let (mut store, mut overrides) = family();
        let mut resolver = Resolver::new(&mut store, &mut overrides);
        let sticker = Layer::text("sticker", TextRule::new("sticker", FontSize::Px(20.0)));
        resolver.add_layer("story", sticker).unwrap();
        let y = PropertyValue::Number(3.0);
        let report = resolver
            .set_property("story", "sticker", PropertyKey::Y, y, InheritanceToggles::default())
            .unwrap();
        assert!(!report.override_recorded);
        assert_eq!(
            property_status(&store, &overrides, "story", "sticker", PropertyKey::Y).unwrap(),
            PropertyStatus::Local
        );
    }

    #[test]
    fn test_parent_add_reaches_children() {
        let (mut store, mut overrides) = family();
        let report = Resolver::new(&mut store, &mut overrides)
            .add_layer("parent", Layer::text("price", TextRule::new("price", FontSize::Px(24.0))))
            .unwrap();
        assert_eq!(report.updated_children.len(), 2);
        assert!(store.get("square").unwrap().contains_layer("price"));
    }

    #[test]
    fn test_resync_after_toggle_reenabled() {
        let (mut store, mut overrides) = family();
        let mut resolver = Resolver::new(&mut store, &mut overrides);
        let off = InheritanceToggles { style_props: true, position_props: false };
        resolver
            .set_property("parent", "title", PropertyKey::Y, PropertyValue::Number(77.0), off)
            .unwrap();
        let written = resolver.resync_child("square", InheritanceToggles::default()).unwrap();
        assert_eq!(written, 1);
        assert_eq!(
            store.get("square").unwrap().get_property("title", PropertyKey::Y),
            Some(PropertyValue::Number(77.0))
        );
    }
}
