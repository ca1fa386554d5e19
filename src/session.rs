//! Editor Session
//!
//! Holds everything an editing UI works against: the rule store, overrides,
//! toggle snapshot and the field bindings of the active template. Snapshots
//! serialize to a base64 token small enough for browser storage.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

use crate::binder::{BindError, FieldBinding, FieldBindings};
use crate::catalog::{FieldCatalog, BACKGROUND_FIELD};
use crate::compiler::{CompiledSegment, Compiler};
use crate::config::EngineConfig;
use crate::geometry::{Overlay, Projector, Viewport};
use crate::inheritance::{property_status, EditReport, PropertyStatus, Resolver};
use crate::overrides::{InheritanceToggles, OverrideTracker};
use crate::recompile::Recompiler;
use crate::rules::{
    Color, Layer, PropertyKey, PropertyValue, RuleSet, Size, TemplateId, GENERAL_KEY,
};
use crate::segments::{parse, ParsedSegment, ProvenanceTable};
use crate::store::{EditError, RuleStore};

fn is_field_property(key: PropertyKey) -> bool {
    matches!(key, PropertyKey::DefaultValue | PropertyKey::MetadataKey)
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active template")]
    NoActiveTemplate,

    #[error(transparent)]
    Edit(#[from] EditError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid snapshot: {0}")]
    Snapshot(String),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotState {
    store: RuleStore,
    overrides: OverrideTracker,
    toggles: InheritanceToggles,
    fields: FieldBindings,
    active: Option<TemplateId>,
}

pub struct EditorSession {
    store: RuleStore,
    overrides: OverrideTracker,
    toggles: InheritanceToggles,
    catalog: FieldCatalog,
    fields: FieldBindings,
    active: Option<TemplateId>,
    compiler: Compiler,
    projector: Projector,
    recompiler: Recompiler,
}

impl EditorSession {
    pub fn new(store: RuleStore, config: &EngineConfig) -> Self {
        Self {
            store,
            overrides: OverrideTracker::new(),
            toggles: InheritanceToggles::default(),
            catalog: FieldCatalog::default(),
            fields: FieldBindings::default(),
            active: None,
            compiler: Compiler::new(config.compiler.clone()),
            projector: Projector::new(config.geometry.clone(), config.compiler.clone()),
            recompiler: Recompiler::from_millis(config.debounce_ms),
        }
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    pub fn overrides(&self) -> &OverrideTracker {
        &self.overrides
    }

    pub fn toggles(&self) -> InheritanceToggles {
        self.toggles
    }

    pub fn set_toggles(&mut self, toggles: InheritanceToggles) {
        self.toggles = toggles;
    }

    pub fn catalog(&self) -> &FieldCatalog {
        &self.catalog
    }

    pub fn fields(&self) -> &FieldBindings {
        &self.fields
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active(&self) -> Result<&RuleSet, SessionError> {
        let id = self.active.as_deref().ok_or(SessionError::NoActiveTemplate)?;
        Ok(self.store.require(id)?)
    }

    fn active_owned(&self) -> Result<TemplateId, SessionError> {
        self.active.clone().ok_or(SessionError::NoActiveTemplate)
    }

    /// Switch templates. The catalog comes from the family's parent; bindings
    /// are reseeded from the active template's own field defaults.
    pub fn set_active(&mut self, id: &str) -> Result<(), SessionError> {
        let active = self.store.require(id)?;
        self.fields.reinitialize(&FieldCatalog::build(active));
        let parent_id = self.store.parent_of(id).unwrap_or(id).to_string();
        self.catalog = FieldCatalog::build(self.store.require(&parent_id)?);
        self.active = Some(id.to_string());
        self.recompiler.note_edit(Instant::now());
        tracing::debug!(template = id, fields = self.catalog.len(), "active template changed");
        Ok(())
    }

    /// Create a child of the active template's family and make it active.
    pub fn create_child(
        &mut self,
        child_id: Option<&str>,
        preset: Option<Size>,
    ) -> Result<TemplateId, SessionError> {
        let active = self.active_owned()?;
        let parent_id = self.store.parent_of(&active).unwrap_or(&active).to_string();
        let id = self.store.create_child(&parent_id, child_id, preset)?;
        self.set_active(&id)?;
        Ok(id)
    }

    /// Remove a child of the active family. Removing the active child
    /// activates its parent.
    pub fn remove_child(&mut self, child_id: &str) -> Result<RuleSet, SessionError> {
        let parent_id = self
            .store
            .parent_of(child_id)
            .ok_or_else(|| EditError::NotAChild(child_id.to_string()))?
            .to_string();
        let removed = Resolver::new(&mut self.store, &mut self.overrides).remove_child(child_id)?;
        if self.active.as_deref() == Some(child_id) {
            self.set_active(&parent_id)?;
        }
        Ok(removed)
    }

    /// Field bindings follow the rule's own default and metadata key once
    /// either is edited as a property.
    fn reseed_field(&mut self, layer_key: &str) -> Result<(), SessionError> {
        let active = self.active_owned()?;
        let rules = self.store.require(&active)?;
        if self.store.is_parent(&active) {
            self.catalog = FieldCatalog::build(rules);
        }
        if let Some(text) = rules.layer(layer_key).and_then(|l| l.rule.as_text()) {
            self.fields.reseed_from_rule(layer_key, text);
        }
        Ok(())
    }

    // --- property edits ---

    pub fn set_property(
        &mut self,
        layer_key: &str,
        key: PropertyKey,
        value: PropertyValue,
    ) -> Result<EditReport, SessionError> {
        let active = self.active_owned()?;
        let report = Resolver::new(&mut self.store, &mut self.overrides)
            .set_property(&active, layer_key, key, value, self.toggles)?;
        if is_field_property(key) {
            self.reseed_field(layer_key)?;
        }
        self.recompiler.note_edit(Instant::now());
        Ok(report)
    }

    pub fn reset_property(
        &mut self,
        layer_key: &str,
        key: PropertyKey,
    ) -> Result<PropertyValue, SessionError> {
        let active = self.active_owned()?;
        let value = Resolver::new(&mut self.store, &mut self.overrides)
            .reset_property(&active, layer_key, key)?;
        if is_field_property(key) {
            self.reseed_field(layer_key)?;
        }
        self.recompiler.note_edit(Instant::now());
        Ok(value)
    }

    pub fn add_layer(&mut self, layer: Layer) -> Result<EditReport, SessionError> {
        let active = self.active_owned()?;
        let report = Resolver::new(&mut self.store, &mut self.overrides).add_layer(&active, layer)?;
        self.recompiler.note_edit(Instant::now());
        Ok(report)
    }

    pub fn delete_layer(&mut self, layer_key: &str) -> Result<(), SessionError> {
        let active = self.active_owned()?;
        Resolver::new(&mut self.store, &mut self.overrides).delete_layer(&active, layer_key)?;
        self.recompiler.note_edit(Instant::now());
        Ok(())
    }

    pub fn reset_layer(&mut self, layer_key: &str) -> Result<(), SessionError> {
        let active = self.active_owned()?;
        Resolver::new(&mut self.store, &mut self.overrides).reset_layer(&active, layer_key)?;
        self.reseed_field(layer_key)?;
        self.recompiler.note_edit(Instant::now());
        Ok(())
    }

    pub fn badge(&self, layer_key: &str, key: PropertyKey) -> Result<PropertyStatus, SessionError> {
        let active = self.active.as_deref().ok_or(SessionError::NoActiveTemplate)?;
        Ok(property_status(&self.store, &self.overrides, active, layer_key, key)?)
    }

    // --- field edits ---

    /// Set a field's literal. The background field edits the canvas color instead.
    pub fn set_field(&mut self, field: &str, value: &str) -> Result<(), SessionError> {
        if field == BACKGROUND_FIELD {
            let color = Color::parse(value).map_err(|e| SessionError::InvalidValue {
                field: field.to_string(),
                reason: e.to_string(),
            })?;
            let value = PropertyValue::Color(color);
            self.set_property(GENERAL_KEY, PropertyKey::BackgroundColor, value)?;
        } else {
            self.recompiler.note_edit(Instant::now());
        }
        self.fields.set_literal(field, value);
        Ok(())
    }

    pub fn bind_field(&mut self, field: &str, metadata_key: &str) -> Result<(), SessionError> {
        self.fields.bind_metadata(field, metadata_key)?;
        self.recompiler.note_edit(Instant::now());
        Ok(())
    }

    pub fn unbind_field(&mut self, field: &str) -> Result<FieldBinding, SessionError> {
        let binding = self.fields.unbind(field, &self.catalog)?.clone();
        self.recompiler.note_edit(Instant::now());
        Ok(binding)
    }

    // --- outputs ---

    fn canvas_or_active(&self, canvas: Option<Size>) -> Result<Size, SessionError> {
        Ok(canvas.unwrap_or(self.active()?.canvas()))
    }

    pub fn compile_active(
        &self,
        canvas: Option<Size>,
        asset_id: &str,
    ) -> Result<String, SessionError> {
        let canvas = self.canvas_or_active(canvas)?;
        Ok(self.compiler.compile(self.active()?, &self.fields, canvas, asset_id))
    }

    pub fn compiled_segments_active(
        &self,
        canvas: Option<Size>,
        asset_id: &str,
    ) -> Result<Vec<CompiledSegment>, SessionError> {
        let canvas = self.canvas_or_active(canvas)?;
        Ok(self.compiler.compile_segments(self.active()?, &self.fields, canvas, asset_id))
    }

    /// Compile, then tag each fragment with its source layer.
    pub fn segments_active(
        &self,
        canvas: Option<Size>,
        asset_id: &str,
    ) -> Result<Vec<ParsedSegment>, SessionError> {
        let canvas = self.canvas_or_active(canvas)?;
        let plan = self.compiler.plan(self.active()?, &self.fields, canvas, asset_id);
        Ok(parse(&plan.transformation(), &ProvenanceTable::build(&plan)))
    }

    pub fn overlays_active(
        &self,
        rendered: Size,
        viewport: Viewport,
    ) -> Result<Vec<Overlay>, SessionError> {
        let rules = self.active()?;
        Ok(self.projector.project_all(rules, &self.fields, rules.canvas(), rendered, viewport))
    }

    /// Compile once edits have settled.
    pub fn poll_recompile(
        &mut self,
        now: Instant,
        asset_id: &str,
    ) -> Option<Result<String, SessionError>> {
        let Self { recompiler, compiler, store, fields, active, .. } = self;
        recompiler.poll(now, || -> Result<String, SessionError> {
            let id = active.as_deref().ok_or(SessionError::NoActiveTemplate)?;
            let rules = store.require(id)?;
            Ok(compiler.compile(rules, fields, rules.canvas(), asset_id))
        })
    }

    pub fn is_recompile_pending(&self) -> bool {
        self.recompiler.is_pending()
    }

    // --- snapshots ---

    pub fn snapshot(&self) -> Result<String, SessionError> {
        let state = SnapshotState {
            store: self.store.clone(),
            overrides: self.overrides.clone(),
            toggles: self.toggles,
            fields: self.fields.clone(),
            active: self.active.clone(),
        };
        let json = serde_json::to_vec(&state).map_err(|e| SessionError::Snapshot(e.to_string()))?;
        Ok(STANDARD.encode(json))
    }

    pub fn restore(token: &str, config: &EngineConfig) -> Result<Self, SessionError> {
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|e| SessionError::Snapshot(e.to_string()))?;
        let state: SnapshotState =
            serde_json::from_slice(&bytes).map_err(|e| SessionError::Snapshot(e.to_string()))?;

        let mut session = Self::new(state.store, config);
        session.overrides = state.overrides;
        session.toggles = state.toggles;
        if let Some(id) = state.active.as_deref() {
            session.set_active(id)?;
        }
        session.fields = state.fields;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{FontSize, TextRule};

    fn session() -> EditorSession {
        let mut title = TextRule::new("title", FontSize::Px(32.0));
        title.default_value = "Hello".into();
        let mut store = RuleStore::new();
        let rules = RuleSet::new("story", 500, 900).with_layer(Layer::text("title", title));
        store.register_parent(rules).unwrap();
        let mut session = EditorSession::new(store, &EngineConfig::default());
        session.set_active("story").unwrap();
        session
    }

    #[test]
    fn test_field_edits_flow_into_compile() {
        let mut s = session();
        s.set_field("title", "Big Sale").unwrap();
        let out = s.compile_active(None, "bag").unwrap();
        assert!(out.contains("l_text:Arial_32:Big%20Sale"));

        s.bind_field("title", "ptitle").unwrap();
        let out = s.compile_active(None, "bag").unwrap();
        assert!(out.contains("$ftitle_!Big%20Sale!/$mtitle_md:!ptitle!"));
        assert!(out.contains("l_text:Arial_32:$(ftitle)"));
    }

    #[test]
    fn test_background_field_routes_to_canvas() {
        let mut s = session();
        s.set_field(BACKGROUND_FIELD, "#123456").unwrap();
        assert_eq!(s.active().unwrap().background_color.hex(), "123456");
        assert!(s.bind_field(BACKGROUND_FIELD, "bg").is_err());
        assert!(s.set_field(BACKGROUND_FIELD, "not a color").is_err());
    }

    #[test]
    fn test_child_badges() {
        let mut s = session();
        s.create_child(Some("square"), Some(Size::new(1080, 1080))).unwrap();
        assert_eq!(s.badge("title", PropertyKey::X).unwrap(), PropertyStatus::Inherited);

        s.set_property("title", PropertyKey::X, PropertyValue::Number(12.0)).unwrap();
        assert_eq!(s.badge("title", PropertyKey::X).unwrap(), PropertyStatus::Overridden);

        s.reset_property("title", PropertyKey::X).unwrap();
        assert_eq!(s.badge("title", PropertyKey::X).unwrap(), PropertyStatus::Inherited);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut s = session();
        s.create_child(Some("square"), None).unwrap();
        s.set_property("title", PropertyKey::Y, PropertyValue::Number(40.0)).unwrap();
        s.bind_field("title", "ptitle").unwrap();

        let token = s.snapshot().unwrap();
        let restored = EditorSession::restore(&token, &EngineConfig::default()).unwrap();
        assert_eq!(restored.active_id(), Some("square"));
        assert!(restored.overrides().is_overridden("square", "title", PropertyKey::Y));
        assert!(restored.fields().get("title").unwrap().is_metadata_bound);
        assert_eq!(
            restored.compile_active(None, "bag").unwrap(),
            s.compile_active(None, "bag").unwrap()
        );

        assert!(matches!(
            EditorSession::restore("%%%", &EngineConfig::default()),
            Err(SessionError::Snapshot(_))
        ));
    }

    #[test]
    fn test_edits_debounce_to_one_compile() {
        let mut s = session();
        s.set_field("title", "a").unwrap();
        s.set_field("title", "ab").unwrap();
        assert!(s.is_recompile_pending());

        let later = Instant::now() + std::time::Duration::from_secs(1);
        let out = s.poll_recompile(later, "bag").unwrap().unwrap();
        assert!(out.contains(":ab/"));
        assert!(s.poll_recompile(later, "bag").is_none());
    }

    #[test]
    fn test_child_field_default_override_compiles() {
        let mut s = session();
        s.create_child(Some("square"), None).unwrap();
        let report = s
            .set_property("title", PropertyKey::DefaultValue, PropertyValue::Text("Child".into()))
            .unwrap();
        assert!(report.override_recorded);
        assert!(s.compile_active(None, "bag").unwrap().contains("l_text:Arial_32:Child"));

        s.set_property("title", PropertyKey::MetadataKey, PropertyValue::Text("ptitle".into()))
            .unwrap();
        let out = s.compile_active(None, "bag").unwrap();
        assert!(out.contains("$ftitle_!Child!/$mtitle_md:!ptitle!"));

        // Leaving and returning keeps the child's own default.
        s.set_active("story").unwrap();
        assert!(s.compile_active(None, "bag").unwrap().contains(":Hello/"));
        s.set_active("square").unwrap();
        assert!(s.compile_active(None, "bag").unwrap().contains("$mtitle_md:!ptitle!"));

        s.reset_property("title", PropertyKey::MetadataKey).unwrap();
        s.reset_property("title", PropertyKey::DefaultValue).unwrap();
        assert!(s.compile_active(None, "bag").unwrap().contains("l_text:Arial_32:Hello"));
    }

    #[test]
    fn test_parent_field_default_edit_compiles() {
        let mut s = session();
        s.set_property("title", PropertyKey::DefaultValue, PropertyValue::Text("Welcome".into()))
            .unwrap();
        assert!(s.compile_active(None, "bag").unwrap().contains("l_text:Arial_32:Welcome"));
        assert_eq!(s.catalog().default_for("title"), Some("Welcome"));
    }

    #[test]
    fn test_switching_templates_discards_field_edits() {
        let mut s = session();
        s.create_child(Some("square"), None).unwrap();
        s.set_active("story").unwrap();
        s.set_field("title", "Edited").unwrap();
        s.bind_field("title", "ptitle").unwrap();

        s.set_active("square").unwrap();
        s.set_active("story").unwrap();
        let title = s.fields().get("title").unwrap();
        assert_eq!(title.current_literal, "Hello");
        assert!(!title.is_metadata_bound);
    }

    #[test]
    fn test_compiled_segments_match_compile() {
        let s = session();
        let segments = s.compiled_segments_active(None, "bag").unwrap();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[2].provenance_key.as_deref(), Some("title"));
        let joined: Vec<_> = segments.iter().map(|seg| seg.tokens.as_str()).collect();
        assert_eq!(joined.join("/"), s.compile_active(None, "bag").unwrap());
    }

    #[test]
    fn test_remove_active_child_clears_its_overrides() {
        let mut s = session();
        s.create_child(Some("square"), None).unwrap();
        s.set_property("title", PropertyKey::X, PropertyValue::Number(12.0)).unwrap();

        s.remove_child("square").unwrap();
        assert_eq!(s.active_id(), Some("story"));
        assert_eq!(s.overrides().entry_count("square"), 0);
        assert!(matches!(
            s.remove_child("story"),
            Err(SessionError::Edit(EditError::NotAChild(_)))
        ));
    }

    #[test]
    fn test_no_active_template() {
        let s = EditorSession::new(RuleStore::new(), &EngineConfig::default());
        assert!(matches!(s.compile_active(None, "bag"), Err(SessionError::NoActiveTemplate)));
    }
}
