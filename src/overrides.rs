//! Override Tracker
//!
//! Presence of an entry means the child holds an explicit value for that
//! property and is no longer written through by parent edits.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::rules::{LayerKey, PropertyKey, TemplateId, GENERAL_KEY};

/// Which inheritance class a property belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyClass {
    Style,
    Position,
}

impl PropertyClass {
    /// `None` for canvas width/height, which never inherit.
    pub fn of(layer_key: &str, key: PropertyKey) -> Option<Self> {
        if layer_key == GENERAL_KEY {
            return match key {
                PropertyKey::Width | PropertyKey::Height => None,
                _ => Some(PropertyClass::Style),
            };
        }
        match key {
            PropertyKey::X
            | PropertyKey::Y
            | PropertyKey::Gravity
            | PropertyKey::Order
            | PropertyKey::Width
            | PropertyKey::Height => Some(PropertyClass::Position),
            _ => Some(PropertyClass::Style),
        }
    }
}

/// Snapshot of the process-wide inheritance switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InheritanceToggles {
    pub style_props: bool,
    pub position_props: bool,
}

impl Default for InheritanceToggles {
    fn default() -> Self {
        Self { style_props: true, position_props: true }
    }
}

impl InheritanceToggles {
    pub fn none() -> Self {
        Self { style_props: false, position_props: false }
    }

    pub fn enabled(&self, class: PropertyClass) -> bool {
        match class {
            PropertyClass::Style => self.style_props,
            PropertyClass::Position => self.position_props,
        }
    }

    /// Whether a parent write to this property reaches non-overridden children.
    pub fn inherits(&self, layer_key: &str, key: PropertyKey) -> bool {
        PropertyClass::of(layer_key, key).map_or(false, |class| self.enabled(class))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerOverrides {
    /// The whole layer is local to the child (replaced or deleted there).
    #[serde(default)]
    pub whole_layer: bool,
    #[serde(default)]
    pub properties: BTreeSet<PropertyKey>,
}

impl LayerOverrides {
    fn is_empty(&self) -> bool {
        !self.whole_layer && self.properties.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideTracker {
    entries: BTreeMap<TemplateId, BTreeMap<LayerKey, LayerOverrides>>,
}

impl OverrideTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, child: &str, layer: &str, key: PropertyKey) {
        self.layer_entry(child, layer).properties.insert(key);
    }

    pub fn mark_layer(&mut self, child: &str, layer: &str) {
        self.layer_entry(child, layer).whole_layer = true;
    }

    /// Returns true when a flag was removed.
    pub fn clear(&mut self, child: &str, layer: &str, key: PropertyKey) -> bool {
        let removed = self
            .entries
            .get_mut(child)
            .and_then(|layers| layers.get_mut(layer))
            .map_or(false, |entry| entry.properties.remove(&key));
        self.prune(child, layer);
        removed
    }

    /// Drop every flag recorded for the layer, including the whole-layer flag.
    pub fn clear_layer(&mut self, child: &str, layer: &str) {
        if let Some(layers) = self.entries.get_mut(child) {
            layers.remove(layer);
            if layers.is_empty() {
                self.entries.remove(child);
            }
        }
    }

    pub fn clear_child(&mut self, child: &str) {
        self.entries.remove(child);
    }

    pub fn is_overridden(&self, child: &str, layer: &str, key: PropertyKey) -> bool {
        self.entry(child, layer)
            .map_or(false, |e| e.whole_layer || e.properties.contains(&key))
    }

    pub fn is_layer_overridden(&self, child: &str, layer: &str) -> bool {
        self.entry(child, layer).map_or(false, |e| e.whole_layer)
    }

    pub fn overridden_properties(&self, child: &str, layer: &str) -> Vec<PropertyKey> {
        self.entry(child, layer)
            .map(|e| e.properties.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of (layer, property) flags plus whole-layer flags held by a child.
    pub fn entry_count(&self, child: &str) -> usize {
        self.entries.get(child).map_or(0, |layers| {
            layers
                .values()
                .map(|e| e.properties.len() + usize::from(e.whole_layer))
                .sum()
        })
    }

    fn entry(&self, child: &str, layer: &str) -> Option<&LayerOverrides> {
        self.entries.get(child).and_then(|layers| layers.get(layer))
    }

    fn layer_entry(&mut self, child: &str, layer: &str) -> &mut LayerOverrides {
        self.entries
            .entry(child.to_string())
            .or_default()
            .entry(layer.to_string())
            .or_default()
    }

    fn prune(&mut self, child: &str, layer: &str) {
        if let Some(layers) = self.entries.get_mut(child) {
            if layers.get(layer).map_or(false, LayerOverrides::is_empty) {
                layers.remove(layer);
            }
            if layers.is_empty() {
                self.entries.remove(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canvas_size_has_no_class() {
        assert_eq!(PropertyClass::of(GENERAL_KEY, PropertyKey::Width), None);
        assert_eq!(PropertyClass::of(GENERAL_KEY, PropertyKey::Height), None);
        assert_eq!(
            PropertyClass::of(GENERAL_KEY, PropertyKey::BackgroundColor),
            Some(PropertyClass::Style)
        );
        assert_eq!(PropertyClass::of("hero", PropertyKey::Width), Some(PropertyClass::Position));
        assert!(!InheritanceToggles::default().inherits(GENERAL_KEY, PropertyKey::Width));
    }

    #[test]
    fn test_mark_and_clear() {
        let mut tracker = OverrideTracker::new();
        tracker.mark("story", "title", PropertyKey::Color);
        assert!(tracker.is_overridden("story", "title", PropertyKey::Color));
        assert!(!tracker.is_overridden("story", "title", PropertyKey::X));
        assert_eq!(tracker.entry_count("story"), 1);

        assert!(tracker.clear("story", "title", PropertyKey::Color));
        assert_eq!(tracker.entry_count("story"), 0);
        assert_eq!(tracker, OverrideTracker::new());
    }

    #[test]
    fn test_overridden_properties_in_key_order() {
        let mut tracker = OverrideTracker::new();
        tracker.mark("story", "title", PropertyKey::Color);
        tracker.mark("story", "title", PropertyKey::X);
        tracker.mark("story", "title", PropertyKey::X);
        assert_eq!(
            tracker.overridden_properties("story", "title"),
            vec![PropertyKey::X, PropertyKey::Color]
        );
        assert!(tracker.overridden_properties("story", "price").is_empty());

        // The whole-layer flag is not a property entry.
        tracker.mark_layer("story", "badge");
        assert!(tracker.overridden_properties("story", "badge").is_empty());
    }

    #[test]
    fn test_whole_layer_covers_every_property() {
        let mut tracker = OverrideTracker::new();
        tracker.mark_layer("story", "badge");
        assert!(tracker.is_overridden("story", "badge", PropertyKey::Y));
        assert!(tracker.is_layer_overridden("story", "badge"));
        tracker.clear_layer("story", "badge");
        assert!(!tracker.is_layer_overridden("story", "badge"));
    }
}
