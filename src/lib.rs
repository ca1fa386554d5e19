//! DesignRule Core - Design Rule Compiler
//!
//! Turns declarative template rules into a URL transformation string for a
//! remote renderer, and maps that string back to the layers that produced it.
//!
//! # Guarantees
//! 1. Malformed rules never enter the store
//! 2. Parent edits push to children unless overridden
//! 3. Identical inputs compile to identical strings
//! 4. Every compiled fragment parses back to its layer
//! 5. Bound fields are never empty at render time
//! 6. Overlays share the compiler's position math

pub mod binder;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod geometry;
pub mod hashing;
pub mod inheritance;
pub mod logging;
pub mod overrides;
pub mod pipeline;
pub mod recompile;
pub mod rules;
pub mod segments;
pub mod session;
pub mod store;
pub mod validation;

pub use binder::{FieldBinding, FieldBindings};
pub use catalog::FieldCatalog;
pub use compiler::{CompiledSegment, Compiler, SegmentKind};
pub use config::EngineConfig;
pub use geometry::{Overlay, Projector, Rect, Viewport};
pub use hashing::{canonical_json, compute_rule_set_hash};
pub use inheritance::{PropertyStatus, Resolver};
pub use overrides::{InheritanceToggles, OverrideTracker};
pub use pipeline::{PipelineError, RenderManifest, RenderPipeline, RenderRequest};
pub use rules::{Layer, LayerRule, PropertyKey, PropertyValue, RuleSet, Size, TemplateId};
pub use segments::{parse, ParsedSegment, ProvenanceTable};
pub use session::{EditorSession, SessionError};
pub use store::{EditError, RuleStore};
pub use validation::{import_json, RuleError, ValidationResult, Validator};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Import envelope version this engine reads (same major accepted).
pub const FORMAT_VERSION: &str = "1.0.0";
