//! Validation System - Import Boundary
//!
//! Rules produce structured violations.
//! Policy maps violations to accept/reject: any Error keeps the RuleSet out
//! of the store, warnings are recorded and the layer degrades at compile time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

use crate::rules::{LayerRole, LayerRule, RuleSet, GENERAL_KEY};
use crate::FORMAT_VERSION;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Malformed rule input: {0}")]
    Malformed(String),

    #[error("Rule set rejected: {}", format_violations(.0))]
    Rejected(Vec<ValidationViolation>),

    #[error("Unsupported format version {0}, engine reads {1}")]
    UnsupportedFormat(String, String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_violations(violations: &[ValidationViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.rule, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub layer: Option<String>,
    pub remediation: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
    pub rule_set_id: String,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.violations.iter().filter(|v| v.severity == ViolationSeverity::Warning)
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule {
    fn name(&self) -> &'static str;
    fn validate(&self, rules: &RuleSet) -> Vec<ValidationViolation>;
}

fn violation(
    rule: &str,
    severity: ViolationSeverity,
    layer: Option<&str>,
    message: String,
    remediation: &str,
) -> ValidationViolation {
    ValidationViolation {
        rule: rule.to_string(),
        severity,
        message,
        layer: layer.map(str::to_string),
        remediation: vec![remediation.to_string()],
    }
}

// --- Concrete Rules ---

pub struct CanvasDimensionsRule;

impl ValidationRule for CanvasDimensionsRule {
    fn name(&self) -> &'static str { "canvas_dimensions" }

    fn validate(&self, rules: &RuleSet) -> Vec<ValidationViolation> {
        if rules.width > 0 && rules.height > 0 {
            return vec![];
        }
        vec![violation(
            self.name(),
            ViolationSeverity::Error,
            None,
            format!("Canvas must be positive, got {}x{}", rules.width, rules.height),
            "Set width and height to at least 1 pixel",
        )]
    }
}

pub struct LayerKeyRule;

impl ValidationRule for LayerKeyRule {
    fn name(&self) -> &'static str { "layer_keys" }

    fn validate(&self, rules: &RuleSet) -> Vec<ValidationViolation> {
        let mut seen = HashSet::new();
        let mut violations = vec![];

        for layer in &rules.layers {
            if layer.key.trim().is_empty() {
                violations.push(violation(
                    self.name(),
                    ViolationSeverity::Error,
                    None,
                    "Layer key is empty".to_string(),
                    "Give every layer a unique key",
                ));
            } else if layer.key == GENERAL_KEY {
                violations.push(violation(
                    self.name(),
                    ViolationSeverity::Error,
                    Some(&layer.key),
                    format!("Layer key {} is reserved for canvas properties", GENERAL_KEY),
                    "Rename the layer",
                ));
            } else if !seen.insert(layer.key.as_str()) {
                violations.push(violation(
                    self.name(),
                    ViolationSeverity::Error,
                    Some(&layer.key),
                    format!("Duplicate layer key {}", layer.key),
                    "Give every layer a unique key",
                ));
            }
        }

        violations
    }
}

pub struct LayerGeometryRule;

impl ValidationRule for LayerGeometryRule {
    fn name(&self) -> &'static str { "layer_geometry" }

    fn validate(&self, rules: &RuleSet) -> Vec<ValidationViolation> {
        let mut violations = vec![];

        for layer in &rules.layers {
            let finite = match &layer.rule {
                LayerRule::Text(t) => t.x.is_finite() && t.y.is_finite(),
                LayerRule::Image(i) => i.x.is_finite() && i.y.is_finite(),
            };
            if !finite {
                violations.push(violation(
                    self.name(),
                    ViolationSeverity::Error,
                    Some(&layer.key),
                    "Layer position is not a finite number".to_string(),
                    "Provide numeric x and y",
                ));
            }

            if let LayerRule::Image(image) = &layer.rule {
                if !(image.width > 0.0 && image.height > 0.0) {
                    violations.push(violation(
                        self.name(),
                        ViolationSeverity::Error,
                        Some(&layer.key),
                        format!(
                            "Image size must be positive, got {}x{}",
                            image.width, image.height
                        ),
                        "Set image width and height",
                    ));
                }
            }
        }

        violations
    }
}

/// Unresolvable references are accepted; the compiler skips the binding.
pub struct ReferenceRule;

impl ValidationRule for ReferenceRule {
    fn name(&self) -> &'static str { "references" }

    fn validate(&self, rules: &RuleSet) -> Vec<ValidationViolation> {
        let mut violations = vec![];

        for (key, text) in rules.text_layers() {
            let Some(calc) = &text.calculation else { continue };

            let target_is_text = rules
                .layer(&calc.depends_on)
                .map_or(false, |l| matches!(l.rule, LayerRule::Text(_)));
            if !target_is_text || &calc.depends_on == key {
                violations.push(violation(
                    self.name(),
                    ViolationSeverity::Warning,
                    Some(key),
                    format!("Calculation depends on unknown text layer {}", calc.depends_on),
                    "Point dependsOn at an existing text layer",
                ));
            }
            if let Err(e) = calc.steps() {
                violations.push(violation(
                    self.name(),
                    ViolationSeverity::Warning,
                    Some(key),
                    e.to_string(),
                    "Use '<op> <number>' pairs such as '* 0.8'",
                ));
            }
        }

        violations
    }
}

pub struct RoleRule;

impl ValidationRule for RoleRule {
    fn name(&self) -> &'static str { "roles" }

    fn validate(&self, rules: &RuleSet) -> Vec<ValidationViolation> {
        rules
            .layers
            .iter()
            .filter_map(|layer| match &layer.rule {
                LayerRule::Image(image)
                    if image.role == Some(LayerRole::Logo) && image.asset_id.is_none() =>
                {
                    Some(violation(
                        self.name(),
                        ViolationSeverity::Warning,
                        Some(&layer.key),
                        "Logo layer has no fixed asset and will show the subject".to_string(),
                        "Assign an assetId to the logo layer",
                    ))
                }
                _ => None,
            })
            .collect()
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(CanvasDimensionsRule),
                Box::new(LayerKeyRule),
                Box::new(LayerGeometryRule),
                Box::new(ReferenceRule),
                Box::new(RoleRule),
            ],
        }
    }

    pub fn validate(&self, rules: &RuleSet) -> ValidationResult {
        let violations: Vec<_> = self.rules.iter().flat_map(|r| r.validate(rules)).collect();
        let valid = !violations.iter().any(|v| v.severity == ViolationSeverity::Error);

        ValidationResult { valid, violations, rule_set_id: rules.id.clone() }
    }

    /// Reject a RuleSet carrying any Error-severity violation.
    pub fn admit(&self, rules: RuleSet) -> Result<RuleSet, RuleError> {
        let result = self.validate(&rules);
        for warning in result.warnings() {
            tracing::warn!(
                rule_set = %rules.id,
                rule = %warning.rule,
                layer = warning.layer.as_deref().unwrap_or("-"),
                "{}",
                warning.message
            );
        }
        if result.valid {
            Ok(rules)
        } else {
            let errors = result
                .violations
                .into_iter()
                .filter(|v| v.severity == ViolationSeverity::Error)
                .collect();
            Err(RuleError::Rejected(errors))
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportEnvelope {
    format_version: String,
    rule_set: Value,
}

/// Parse a RuleSet from an import adapter, plain or wrapped in a versioned envelope.
pub fn import_json(input: &str) -> Result<RuleSet, RuleError> {
    let raw: Value = serde_json::from_str(input)?;

    let body = if raw.get("ruleSet").is_some() {
        let envelope: ImportEnvelope = serde_json::from_value(raw)?;
        check_format_version(&envelope.format_version)?;
        envelope.rule_set
    } else {
        raw
    };

    let rules: RuleSet =
        serde_json::from_value(body).map_err(|e| RuleError::Malformed(e.to_string()))?;
    Validator::new().admit(rules)
}

fn check_format_version(version: &str) -> Result<(), RuleError> {
    let unsupported =
        || RuleError::UnsupportedFormat(version.to_string(), FORMAT_VERSION.to_string());
    let ours = semver::Version::parse(FORMAT_VERSION).map_err(|_| unsupported())?;
    let theirs = semver::Version::parse(version).map_err(|_| unsupported())?;
    if ours.major != theirs.major {
        return Err(unsupported());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_canvas() {
        let err = import_json(r#"{"id":"p","width":0,"height":900}"#).unwrap_err();
        assert!(matches!(err, RuleError::Rejected(_)));
    }

    #[test]
    fn test_rejects_undiscriminated_layer() {
        let json = r#"{"id":"p","width":500,"height":900,
            "layers":[{"key":"title","fontSize":32}]}"#;
        let err = import_json(json).unwrap_err();
        assert!(matches!(err, RuleError::Malformed(_)));
    }

    #[test]
    fn test_rejects_duplicate_keys() {
        let json = r#"{"id":"p","width":500,"height":900,"layers":[
            {"key":"a","kind":"text","fontSize":32},
            {"key":"a","kind":"image","width":10,"height":10}]}"#;
        let err = import_json(json).unwrap_err();
        assert!(err.to_string().contains("Duplicate layer key"));
    }

    #[test]
    fn test_missing_reference_is_a_warning() {
        let json = r#"{"id":"p","width":500,"height":900,"layers":[
            {"key":"sale","kind":"text","fontSize":32,
             "calculation":{"formula":"* 0.8","dependsOn":"ghost"}}]}"#;
        let rules = import_json(json).unwrap();
        let result = Validator::new().validate(&rules);
        assert!(result.valid);
        assert_eq!(result.warnings().count(), 1);
    }

    #[test]
    fn test_envelope_version_checked() {
        let ok = r#"{"formatVersion":"1.2.0","ruleSet":{"id":"p","width":5,"height":5}}"#;
        assert!(import_json(ok).is_ok());

        let newer = r#"{"formatVersion":"2.0.0","ruleSet":{"id":"p","width":5,"height":5}}"#;
        assert!(matches!(
            import_json(newer).unwrap_err(),
            RuleError::UnsupportedFormat(_, _)
        ));
    }
}
