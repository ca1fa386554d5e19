//! Render Pipeline - Single Entry Point
//!
//! `render` always validates the stored RuleSet before compiling. The
//! manifest pins the transformation and the renderer URL built from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::binder::FieldBindings;
use crate::catalog::FieldCatalog;
use crate::compiler::{CompiledSegment, Compiler};
use crate::config::{EngineConfig, RendererConfig};
use crate::hashing::{compute_render_digest, compute_rule_set_hash};
use crate::rules::Size;
use crate::store::RuleStore;
use crate::validation::{ValidationResult, Validator};
use crate::ENGINE_VERSION;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static VALIDATION_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_validation_call_count() -> u32 {
    VALIDATION_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_validation_call_count() {
    VALIDATION_CALL_COUNT.store(0, Ordering::SeqCst);
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("No asset given for template {0}")]
    MissingAsset(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub template_id: String,
    /// Asset path on the renderer, without extension.
    pub asset_id: String,
    /// Defaults to the template's own canvas.
    #[serde(default)]
    pub canvas: Option<Size>,
    /// Defaults to the family catalog's values.
    #[serde(default)]
    pub fields: Option<FieldBindings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderManifest {
    pub id: String,
    pub template_id: String,
    pub engine_version: String,
    pub created_at: DateTime<Utc>,
    pub canvas: Size,
    pub rule_set_hash: String,
    pub digest: String,
    pub transformation: String,
    pub url: String,
    pub validation: ValidationResult,
    pub segments: Vec<CompiledSegment>,
}

pub struct RenderPipeline {
    store: RuleStore,
    validator: Validator,
    compiler: Compiler,
    renderer: RendererConfig,
}

impl RenderPipeline {
    pub fn new(store: RuleStore, config: &EngineConfig) -> Self {
        Self {
            store,
            validator: Validator::new(),
            compiler: Compiler::new(config.compiler.clone()),
            renderer: config.renderer.clone(),
        }
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    /// The only validation entry point.
    pub fn validate(&self, template_id: &str) -> Result<ValidationResult, PipelineError> {
        #[cfg(feature = "test-hooks")]
        VALIDATION_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        let rules = self
            .store
            .get(template_id)
            .ok_or_else(|| PipelineError::TemplateNotFound(template_id.to_string()))?;
        Ok(self.validator.validate(rules))
    }

    /// Renderer URL: base, transformation, then the asset path with extension.
    pub fn url_for(&self, transformation: &str, asset_id: &str) -> String {
        format!(
            "{}/{}/{}.{}",
            self.renderer.base_url.trim_end_matches('/'),
            transformation,
            asset_id.trim_matches('/'),
            self.renderer.extension
        )
    }

    pub fn render(&self, request: &RenderRequest) -> Result<RenderManifest, PipelineError> {
        let rules = self
            .store
            .get(&request.template_id)
            .ok_or_else(|| PipelineError::TemplateNotFound(request.template_id.clone()))?;

        let validation = self.validate(&request.template_id)?;
        if !validation.valid {
            let messages: Vec<_> = validation
                .violations
                .iter()
                .map(|v| format!("{}: {}", v.rule, v.message))
                .collect();
            return Err(PipelineError::ValidationFailed(messages.join("; ")));
        }

        if request.asset_id.trim().is_empty() {
            return Err(PipelineError::MissingAsset(request.template_id.clone()));
        }

        let fields = match &request.fields {
            Some(fields) => fields.clone(),
            None => {
                let family =
                    self.store.parent_of(&request.template_id).unwrap_or(&request.template_id);
                let parent = self
                    .store
                    .get(family)
                    .ok_or_else(|| PipelineError::TemplateNotFound(family.to_string()))?;
                FieldBindings::seed(&FieldCatalog::build(parent))
            }
        };

        let canvas = request.canvas.unwrap_or(rules.canvas());
        let plan = self.compiler.plan(rules, &fields, canvas, &request.asset_id);
        let transformation = plan.transformation();
        let rule_set_hash = compute_rule_set_hash(rules)?;
        let digest = compute_render_digest(
            &request.template_id,
            &rule_set_hash,
            &transformation,
            ENGINE_VERSION,
        );

        tracing::info!(
            template = %request.template_id,
            %canvas,
            digest = %digest,
            "rendered transformation"
        );

        Ok(RenderManifest {
            id: Uuid::new_v4().to_string(),
            template_id: request.template_id.clone(),
            engine_version: ENGINE_VERSION.to_string(),
            created_at: Utc::now(),
            canvas,
            rule_set_hash,
            digest,
            url: self.url_for(&transformation, &request.asset_id),
            transformation,
            validation,
            segments: plan.segments(),
        })
    }
}

impl Default for RenderPipeline {
    fn default() -> Self {
        Self::new(RuleStore::default(), &EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{FontSize, Layer, RuleSet, TextRule};

    fn pipeline() -> RenderPipeline {
        let mut title = TextRule::new("title", FontSize::Px(32.0));
        title.default_value = "Hi".into();
        let mut store = RuleStore::new();
        let rules = RuleSet::new("story", 500, 900).with_layer(Layer::text("title", title));
        store.register_parent(rules).unwrap();
        RenderPipeline::new(store, &EngineConfig::default())
    }

    fn request(asset: &str) -> RenderRequest {
        RenderRequest {
            template_id: "story".into(),
            asset_id: asset.into(),
            canvas: None,
            fields: None,
        }
    }

    #[test]
    fn test_render_builds_url() {
        let manifest = pipeline().render(&request("shoes/red")).unwrap();
        let prefix = "https://res.cloudinary.com/demo/image/upload/$subject_!shoes:red!/";
        assert!(manifest.url.starts_with(prefix));
        assert!(manifest.url.ends_with("/shoes/red.jpg"));
        assert_eq!(manifest.segments.len(), 4);
        assert_eq!(manifest.canvas, Size::new(500, 900));
    }

    #[test]
    fn test_digest_stable_across_renders() {
        let p = pipeline();
        let a = p.render(&request("bag")).unwrap();
        let b = p.render(&request("bag")).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_missing_asset_and_template() {
        let p = pipeline();
        assert!(matches!(p.render(&request("  ")), Err(PipelineError::MissingAsset(_))));
        let mut r = request("bag");
        r.template_id = "nope".into();
        assert!(matches!(p.render(&r), Err(PipelineError::TemplateNotFound(_))));
    }
}
