//! Engine Configuration
//!
//! Loaded from JSON; every field has a default so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn default_base_width() -> u32 { 500 }
fn default_base_font_size() -> f64 { 32.0 }
fn default_width_multiplier() -> f64 { 0.6 }
fn default_line_height() -> f64 { 1.2 }
fn default_placeholder_width() -> f64 { 120.0 }
fn default_placeholder_height() -> f64 { 40.0 }
fn default_base_url() -> String { "https://res.cloudinary.com/demo/image/upload".to_string() }
fn default_extension() -> String { "jpg".to_string() }
fn default_debounce_ms() -> u64 { 300 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerConfig {
    /// Canvas width the rules were authored at; positions scale against it.
    #[serde(default = "default_base_width")]
    pub base_width: u32,
    /// Used when the first text layer has no face-value size.
    #[serde(default = "default_base_font_size")]
    pub default_base_font_size: f64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            base_width: default_base_width(),
            default_base_font_size: default_base_font_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeometryConfig {
    #[serde(default = "default_width_multiplier")]
    pub width_multiplier: f64,
    #[serde(default = "default_line_height")]
    pub line_height: f64,
    #[serde(default = "default_placeholder_width")]
    pub placeholder_width: f64,
    #[serde(default = "default_placeholder_height")]
    pub placeholder_height: f64,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            width_multiplier: default_width_multiplier(),
            line_height: default_line_height(),
            placeholder_width: default_placeholder_width(),
            placeholder_height: default_placeholder_height(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self { base_url: default_base_url(), extension: default_extension() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compiler: CompilerConfig::default(),
            geometry: GeometryConfig::default(),
            renderer: RendererConfig::default(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        if self.compiler.base_width == 0 {
            return Err(ConfigError::Invalid("compiler.baseWidth must be positive".into()));
        }
        if !(self.compiler.default_base_font_size > 0.0) {
            return Err(ConfigError::Invalid(
                "compiler.defaultBaseFontSize must be positive".into(),
            ));
        }
        if !(self.geometry.width_multiplier > 0.0 && self.geometry.line_height > 0.0) {
            return Err(ConfigError::Invalid("geometry multipliers must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"compiler": {{"baseWidth": 1080}}}}"#).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.compiler.base_width, 1080);
        assert_eq!(config.compiler.default_base_font_size, 32.0);
        assert_eq!(config.renderer.extension, "jpg");
    }

    #[test]
    fn test_rejects_zero_base_width() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"compiler": {{"baseWidth": 0}}}}"#).unwrap();
        assert!(matches!(EngineConfig::load(file.path()), Err(ConfigError::Invalid(_))));
    }
}
