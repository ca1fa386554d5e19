//! Rule Model - Declarative Template Descriptions
//!
//! A RuleSet describes one template: its canvas and an ordered list of
//! text/image layers. Layer kinds are discriminated by the `kind` tag at
//! construction and matched exhaustively everywhere else.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type TemplateId = String;
pub type LayerKey = String;

/// Layer key addressing canvas-level properties (width, height, background).
pub const GENERAL_KEY: &str = "_general";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("Invalid color: {0}")]
    Color(String),

    #[error("Invalid font size: {0}")]
    FontSize(String),

    #[error("Unknown gravity: {0}")]
    Gravity(String),

    #[error("Unknown property: {0}")]
    Property(String),

    #[error("Malformed formula '{0}'")]
    Formula(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PropertyError {
    #[error("Property {property} does not exist on layer {layer}")]
    Unknown { layer: LayerKey, property: PropertyKey },

    #[error("Property {property} expects a {expected} value")]
    TypeMismatch { property: PropertyKey, expected: &'static str },

    #[error("Invalid value for {property}: {reason}")]
    Invalid { property: PropertyKey, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once('x')
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
        let width = w.trim().parse::<u32>().map_err(|e| e.to_string())?;
        let height = h.trim().parse::<u32>().map_err(|e| e.to_string())?;
        Ok(Self { width, height })
    }
}

// --- Color ---

/// Normalized lowercase hex color (6 or 8 digits, no leading '#').
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Color(String);

impl Color {
    pub fn parse(input: &str) -> Result<Self, ValueError> {
        let trimmed = input.trim();
        let hex = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ValueError::Color(input.to_string()));
        }
        let normalized = match hex.len() {
            3 => hex.chars().flat_map(|c| [c, c]).collect::<String>(),
            6 | 8 => hex.to_string(),
            _ => return Err(ValueError::Color(input.to_string())),
        };
        Ok(Self(normalized.to_ascii_lowercase()))
    }

    pub fn white() -> Self {
        Self("ffffff".to_string())
    }

    pub fn black() -> Self {
        Self("000000".to_string())
    }

    pub fn hex(&self) -> &str {
        &self.0
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::white()
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl FromStr for Color {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Color::parse(s)
    }
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Color::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// --- Font size ---

/// Either an absolute size or a percentage of the base font size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FontSize {
    Px(f64),
    Percent(f64),
}

impl FontSize {
    /// Resolve against the base font size. Percent sizes round to whole pixels.
    pub fn resolve(&self, base: f64) -> f64 {
        match self {
            FontSize::Px(size) => *size,
            FontSize::Percent(pct) => (base * pct / 100.0).round(),
        }
    }
}

impl FromStr for FontSize {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || ValueError::FontSize(s.to_string());
        if let Some(pct) = trimmed.strip_suffix('%') {
            let value = pct.trim().parse::<f64>().map_err(|_| invalid())?;
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid());
            }
            return Ok(FontSize::Percent(value));
        }
        let number = trimmed.strip_suffix("px").unwrap_or(trimmed);
        let value = number.trim().parse::<f64>().map_err(|_| invalid())?;
        if !value.is_finite() || value <= 0.0 {
            return Err(invalid());
        }
        Ok(FontSize::Px(value))
    }
}

impl fmt::Display for FontSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FontSize::Px(size) => write!(f, "{}", crate::binder::format_number(*size)),
            FontSize::Percent(pct) => write!(f, "{}%", crate::binder::format_number(*pct)),
        }
    }
}

impl Serialize for FontSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FontSize::Px(size) => serializer.serialize_f64(*size),
            FontSize::Percent(_) => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for FontSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(size) if size.is_finite() && size > 0.0 => Ok(FontSize::Px(size)),
            Repr::Number(size) => Err(serde::de::Error::custom(ValueError::FontSize(
                size.to_string(),
            ))),
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

// --- Gravity ---

/// Reference point from which a layer's (x, y) offset is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gravity {
    #[default]
    NorthWest,
    North,
    NorthEast,
    West,
    Center,
    East,
    SouthWest,
    South,
    SouthEast,
}

impl Gravity {
    pub const ALL: [Gravity; 9] = [
        Gravity::NorthWest,
        Gravity::North,
        Gravity::NorthEast,
        Gravity::West,
        Gravity::Center,
        Gravity::East,
        Gravity::SouthWest,
        Gravity::South,
        Gravity::SouthEast,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            Gravity::NorthWest => "north_west",
            Gravity::North => "north",
            Gravity::NorthEast => "north_east",
            Gravity::West => "west",
            Gravity::Center => "center",
            Gravity::East => "east",
            Gravity::SouthWest => "south_west",
            Gravity::South => "south",
            Gravity::SouthEast => "south_east",
        }
    }
}

impl FromStr for Gravity {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Gravity::ALL
            .into_iter()
            .find(|g| g.token() == normalized || g.token().replace('_', "") == normalized)
            .ok_or_else(|| ValueError::Gravity(s.to_string()))
    }
}

// --- Layers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerRole {
    Logo,
    Badge,
    Headline,
    Subject,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextFlags {
    #[serde(default)]
    pub no_overflow: bool,
    #[serde(default)]
    pub disallow_overflow: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl ArithOp {
    pub fn token(&self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::Mod => "mod",
            ArithOp::Pow => "pow",
        }
    }

    fn from_symbol(c: char) -> Option<Self> {
        match c {
            '+' => Some(ArithOp::Add),
            '-' => Some(ArithOp::Sub),
            '*' => Some(ArithOp::Mul),
            '/' => Some(ArithOp::Div),
            '%' => Some(ArithOp::Mod),
            '^' => Some(ArithOp::Pow),
            _ => None,
        }
    }

    pub fn apply(&self, lhs: f64, rhs: f64) -> f64 {
        match self {
            ArithOp::Add => lhs + rhs,
            ArithOp::Sub => lhs - rhs,
            ArithOp::Mul => lhs * rhs,
            ArithOp::Div => lhs / rhs,
            ArithOp::Mod => lhs % rhs,
            ArithOp::Pow => lhs.powf(rhs),
        }
    }
}

/// Derives a field from another layer's resolved value.
///
/// The formula is a left-to-right chain of `<op> <number>` pairs applied to
/// the dependency, e.g. `"* 0.8 + 1"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Calculation {
    pub formula: String,
    pub depends_on: LayerKey,
}

impl Calculation {
    pub fn steps(&self) -> Result<Vec<(ArithOp, f64)>, ValueError> {
        let malformed = || ValueError::Formula(self.formula.clone());
        let chars: Vec<char> = self.formula.chars().collect();
        let mut steps = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            if chars[i].is_whitespace() {
                i += 1;
                continue;
            }
            let op = ArithOp::from_symbol(chars[i]).ok_or_else(malformed)?;
            i += 1;
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            let start = i;
            if i < chars.len() && (chars[i] == '-' || chars[i] == '+') {
                i += 1;
            }
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let operand = literal.parse::<f64>().map_err(|_| malformed())?;
            if !operand.is_finite() {
                return Err(malformed());
            }
            steps.push((op, operand));
        }

        if steps.is_empty() {
            return Err(malformed());
        }
        Ok(steps)
    }

    pub fn evaluate(&self, input: f64) -> Option<f64> {
        let steps = self.steps().ok()?;
        let value = steps.iter().fold(input, |acc, (op, rhs)| op.apply(acc, *rhs));
        value.is_finite().then_some(value)
    }
}

fn default_font() -> String {
    "Arial".to_string()
}

fn default_text_color() -> Color {
    Color::black()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRule {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub gravity: Gravity,
    pub font_size: FontSize,
    #[serde(default = "default_text_color")]
    pub color: Color,
    #[serde(default = "default_font")]
    pub font: String,
    #[serde(default)]
    pub wrap: bool,
    #[serde(default)]
    pub wrap_width: Option<f64>,
    #[serde(default)]
    pub flags: TextFlags,
    #[serde(default)]
    pub field_name: String,
    #[serde(default)]
    pub metadata_key: Option<String>,
    #[serde(default)]
    pub default_value: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub width_multiplier: Option<f64>,
    #[serde(default)]
    pub calculation: Option<Calculation>,
    #[serde(default)]
    pub order: Option<i32>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role: Option<LayerRole>,
}

impl TextRule {
    pub fn new(field_name: &str, font_size: FontSize) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            gravity: Gravity::default(),
            font_size,
            color: default_text_color(),
            font: default_font(),
            wrap: false,
            wrap_width: None,
            flags: TextFlags::default(),
            field_name: field_name.to_string(),
            metadata_key: None,
            default_value: String::new(),
            prefix: String::new(),
            suffix: String::new(),
            width_multiplier: None,
            calculation: None,
            order: None,
            display_name: String::new(),
            role: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRule {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub gravity: Gravity,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default = "default_true")]
    pub show: bool,
    #[serde(default)]
    pub is_main_subject: bool,
    #[serde(default)]
    pub order: Option<i32>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role: Option<LayerRole>,
}

impl ImageRule {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            gravity: Gravity::default(),
            asset_id: None,
            show: true,
            is_main_subject: false,
            order: None,
            display_name: String::new(),
            role: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LayerRule {
    Text(TextRule),
    Image(ImageRule),
}

impl LayerRule {
    pub fn order(&self) -> Option<i32> {
        match self {
            LayerRule::Text(t) => t.order,
            LayerRule::Image(i) => i.order,
        }
    }

    pub fn as_text(&self) -> Option<&TextRule> {
        match self {
            LayerRule::Text(t) => Some(t),
            LayerRule::Image(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub key: LayerKey,
    #[serde(flatten)]
    pub rule: LayerRule,
}

impl Layer {
    pub fn text(key: &str, rule: TextRule) -> Self {
        Self { key: key.to_string(), rule: LayerRule::Text(rule) }
    }

    pub fn image(key: &str, rule: ImageRule) -> Self {
        Self { key: key.to_string(), rule: LayerRule::Image(rule) }
    }
}

// --- Properties ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyKey {
    X,
    Y,
    Gravity,
    Order,
    DisplayName,
    FontSize,
    Color,
    Font,
    Wrap,
    WrapWidth,
    NoOverflow,
    DisallowOverflow,
    FieldName,
    MetadataKey,
    DefaultValue,
    Prefix,
    Suffix,
    WidthMultiplier,
    Width,
    Height,
    AssetId,
    Show,
    IsMainSubject,
    BackgroundColor,
}

impl PropertyKey {
    pub const ALL: [PropertyKey; 24] = [
        PropertyKey::X,
        PropertyKey::Y,
        PropertyKey::Gravity,
        PropertyKey::Order,
        PropertyKey::DisplayName,
        PropertyKey::FontSize,
        PropertyKey::Color,
        PropertyKey::Font,
        PropertyKey::Wrap,
        PropertyKey::WrapWidth,
        PropertyKey::NoOverflow,
        PropertyKey::DisallowOverflow,
        PropertyKey::FieldName,
        PropertyKey::MetadataKey,
        PropertyKey::DefaultValue,
        PropertyKey::Prefix,
        PropertyKey::Suffix,
        PropertyKey::WidthMultiplier,
        PropertyKey::Width,
        PropertyKey::Height,
        PropertyKey::AssetId,
        PropertyKey::Show,
        PropertyKey::IsMainSubject,
        PropertyKey::BackgroundColor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKey::X => "x",
            PropertyKey::Y => "y",
            PropertyKey::Gravity => "gravity",
            PropertyKey::Order => "order",
            PropertyKey::DisplayName => "displayName",
            PropertyKey::FontSize => "fontSize",
            PropertyKey::Color => "color",
            PropertyKey::Font => "font",
            PropertyKey::Wrap => "wrap",
            PropertyKey::WrapWidth => "wrapWidth",
            PropertyKey::NoOverflow => "noOverflow",
            PropertyKey::DisallowOverflow => "disallowOverflow",
            PropertyKey::FieldName => "fieldName",
            PropertyKey::MetadataKey => "metadataKey",
            PropertyKey::DefaultValue => "defaultValue",
            PropertyKey::Prefix => "prefix",
            PropertyKey::Suffix => "suffix",
            PropertyKey::WidthMultiplier => "widthMultiplier",
            PropertyKey::Width => "width",
            PropertyKey::Height => "height",
            PropertyKey::AssetId => "assetId",
            PropertyKey::Show => "show",
            PropertyKey::IsMainSubject => "isMainSubject",
            PropertyKey::BackgroundColor => "backgroundColor",
        }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyKey {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PropertyKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ValueError::Property(s.to_string()))
    }
}

/// A typed value written through `set_property`.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
    Flag(bool),
    FontSize(FontSize),
    Gravity(Gravity),
    Color(Color),
    Unset,
}

impl PropertyValue {
    fn number(&self, key: PropertyKey) -> Result<f64, PropertyError> {
        match self {
            PropertyValue::Number(n) if n.is_finite() => Ok(*n),
            _ => Err(PropertyError::TypeMismatch { property: key, expected: "number" }),
        }
    }

    fn optional_number(&self, key: PropertyKey) -> Result<Option<f64>, PropertyError> {
        match self {
            PropertyValue::Unset => Ok(None),
            other => other.number(key).map(Some),
        }
    }

    fn text(&self, key: PropertyKey) -> Result<String, PropertyError> {
        match self {
            PropertyValue::Text(s) => Ok(s.clone()),
            _ => Err(PropertyError::TypeMismatch { property: key, expected: "text" }),
        }
    }

    fn optional_text(&self, key: PropertyKey) -> Result<Option<String>, PropertyError> {
        match self {
            PropertyValue::Unset => Ok(None),
            PropertyValue::Text(s) if s.is_empty() => Ok(None),
            other => other.text(key).map(Some),
        }
    }

    fn flag(&self, key: PropertyKey) -> Result<bool, PropertyError> {
        match self {
            PropertyValue::Flag(b) => Ok(*b),
            _ => Err(PropertyError::TypeMismatch { property: key, expected: "boolean" }),
        }
    }

    fn order(&self, key: PropertyKey) -> Result<Option<i32>, PropertyError> {
        Ok(self.optional_number(key)?.map(|n| n.round() as i32))
    }

    fn font_size(&self, key: PropertyKey) -> Result<FontSize, PropertyError> {
        match self {
            PropertyValue::FontSize(size) => Ok(*size),
            PropertyValue::Number(n) if n.is_finite() && *n > 0.0 => Ok(FontSize::Px(*n)),
            PropertyValue::Text(s) => s.parse().map_err(|e: ValueError| PropertyError::Invalid {
                property: key,
                reason: e.to_string(),
            }),
            _ => Err(PropertyError::TypeMismatch { property: key, expected: "font size" }),
        }
    }

    fn gravity(&self, key: PropertyKey) -> Result<Gravity, PropertyError> {
        match self {
            PropertyValue::Gravity(g) => Ok(*g),
            PropertyValue::Text(s) => s.parse().map_err(|e: ValueError| PropertyError::Invalid {
                property: key,
                reason: e.to_string(),
            }),
            _ => Err(PropertyError::TypeMismatch { property: key, expected: "gravity" }),
        }
    }

    fn color(&self, key: PropertyKey) -> Result<Color, PropertyError> {
        match self {
            PropertyValue::Color(c) => Ok(c.clone()),
            PropertyValue::Text(s) => Color::parse(s).map_err(|e| PropertyError::Invalid {
                property: key,
                reason: e.to_string(),
            }),
            _ => Err(PropertyError::TypeMismatch { property: key, expected: "color" }),
        }
    }
}

fn optional_number_value(value: Option<f64>) -> PropertyValue {
    value.map_or(PropertyValue::Unset, PropertyValue::Number)
}

fn optional_text_value(value: &Option<String>) -> PropertyValue {
    value.clone().map_or(PropertyValue::Unset, PropertyValue::Text)
}

impl LayerRule {
    /// Read a property; `None` when the key does not apply to this layer kind.
    pub fn get(&self, key: PropertyKey) -> Option<PropertyValue> {
        match self {
            LayerRule::Text(t) => match key {
                PropertyKey::X => Some(PropertyValue::Number(t.x)),
                PropertyKey::Y => Some(PropertyValue::Number(t.y)),
                PropertyKey::Gravity => Some(PropertyValue::Gravity(t.gravity)),
                PropertyKey::Order => Some(optional_number_value(t.order.map(f64::from))),
                PropertyKey::DisplayName => Some(PropertyValue::Text(t.display_name.clone())),
                PropertyKey::FontSize => Some(PropertyValue::FontSize(t.font_size)),
                PropertyKey::Color => Some(PropertyValue::Color(t.color.clone())),
                PropertyKey::Font => Some(PropertyValue::Text(t.font.clone())),
                PropertyKey::Wrap => Some(PropertyValue::Flag(t.wrap)),
                PropertyKey::WrapWidth => Some(optional_number_value(t.wrap_width)),
                PropertyKey::NoOverflow => Some(PropertyValue::Flag(t.flags.no_overflow)),
                PropertyKey::DisallowOverflow => {
                    Some(PropertyValue::Flag(t.flags.disallow_overflow))
                }
                PropertyKey::FieldName => Some(PropertyValue::Text(t.field_name.clone())),
                PropertyKey::MetadataKey => Some(optional_text_value(&t.metadata_key)),
                PropertyKey::DefaultValue => Some(PropertyValue::Text(t.default_value.clone())),
                PropertyKey::Prefix => Some(PropertyValue::Text(t.prefix.clone())),
                PropertyKey::Suffix => Some(PropertyValue::Text(t.suffix.clone())),
                PropertyKey::WidthMultiplier => Some(optional_number_value(t.width_multiplier)),
                PropertyKey::Width
                | PropertyKey::Height
                | PropertyKey::AssetId
                | PropertyKey::Show
                | PropertyKey::IsMainSubject
                | PropertyKey::BackgroundColor => None,
            },
            LayerRule::Image(i) => match key {
                PropertyKey::X => Some(PropertyValue::Number(i.x)),
                PropertyKey::Y => Some(PropertyValue::Number(i.y)),
                PropertyKey::Gravity => Some(PropertyValue::Gravity(i.gravity)),
                PropertyKey::Order => Some(optional_number_value(i.order.map(f64::from))),
                PropertyKey::DisplayName => Some(PropertyValue::Text(i.display_name.clone())),
                PropertyKey::Width => Some(PropertyValue::Number(i.width)),
                PropertyKey::Height => Some(PropertyValue::Number(i.height)),
                PropertyKey::AssetId => Some(optional_text_value(&i.asset_id)),
                PropertyKey::Show => Some(PropertyValue::Flag(i.show)),
                PropertyKey::IsMainSubject => Some(PropertyValue::Flag(i.is_main_subject)),
                _ => None,
            },
        }
    }

    /// Write a property, checking that the value type matches the key.
    pub fn set(
        &mut self,
        layer: &str,
        key: PropertyKey,
        value: &PropertyValue,
    ) -> Result<(), PropertyError> {
        let unknown = || PropertyError::Unknown { layer: layer.to_string(), property: key };
        match self {
            LayerRule::Text(t) => match key {
                PropertyKey::X => t.x = value.number(key)?,
                PropertyKey::Y => t.y = value.number(key)?,
                PropertyKey::Gravity => t.gravity = value.gravity(key)?,
                PropertyKey::Order => t.order = value.order(key)?,
                PropertyKey::DisplayName => t.display_name = value.text(key)?,
                PropertyKey::FontSize => t.font_size = value.font_size(key)?,
                PropertyKey::Color => t.color = value.color(key)?,
                PropertyKey::Font => t.font = value.text(key)?,
                PropertyKey::Wrap => t.wrap = value.flag(key)?,
                PropertyKey::WrapWidth => t.wrap_width = value.optional_number(key)?,
                PropertyKey::NoOverflow => t.flags.no_overflow = value.flag(key)?,
                PropertyKey::DisallowOverflow => t.flags.disallow_overflow = value.flag(key)?,
                PropertyKey::FieldName => t.field_name = value.text(key)?,
                PropertyKey::MetadataKey => t.metadata_key = value.optional_text(key)?,
                PropertyKey::DefaultValue => t.default_value = value.text(key)?,
                PropertyKey::Prefix => t.prefix = value.text(key)?,
                PropertyKey::Suffix => t.suffix = value.text(key)?,
                PropertyKey::WidthMultiplier => t.width_multiplier = value.optional_number(key)?,
                _ => return Err(unknown()),
            },
            LayerRule::Image(i) => match key {
                PropertyKey::X => i.x = value.number(key)?,
                PropertyKey::Y => i.y = value.number(key)?,
                PropertyKey::Gravity => i.gravity = value.gravity(key)?,
                PropertyKey::Order => i.order = value.order(key)?,
                PropertyKey::DisplayName => i.display_name = value.text(key)?,
                PropertyKey::Width => i.width = value.number(key)?,
                PropertyKey::Height => i.height = value.number(key)?,
                PropertyKey::AssetId => i.asset_id = value.optional_text(key)?,
                PropertyKey::Show => i.show = value.flag(key)?,
                PropertyKey::IsMainSubject => i.is_main_subject = value.flag(key)?,
                _ => return Err(unknown()),
            },
        }
        Ok(())
    }
}

// --- RuleSet ---

fn default_background() -> Color {
    Color::white()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    pub id: TemplateId,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_background")]
    pub background_color: Color,
    #[serde(default)]
    pub layers: Vec<Layer>,
}

impl RuleSet {
    pub fn new(id: &str, width: u32, height: u32) -> Self {
        Self {
            id: id.to_string(),
            width,
            height,
            background_color: default_background(),
            layers: vec![],
        }
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn canvas(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn layer(&self, key: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.key == key)
    }

    pub fn layer_mut(&mut self, key: &str) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.key == key)
    }

    pub fn contains_layer(&self, key: &str) -> bool {
        self.layer(key).is_some()
    }

    pub fn remove_layer(&mut self, key: &str) -> Option<Layer> {
        let index = self.layers.iter().position(|l| l.key == key)?;
        Some(self.layers.remove(index))
    }

    pub fn text_layers(&self) -> impl Iterator<Item = (&LayerKey, &TextRule)> {
        self.layers.iter().filter_map(|l| match &l.rule {
            LayerRule::Text(t) => Some((&l.key, t)),
            LayerRule::Image(_) => None,
        })
    }

    /// Layers sorted by explicit `order` (stable); unordered layers last in declaration order.
    pub fn draw_order(&self) -> Vec<&Layer> {
        let mut layers: Vec<&Layer> = self.layers.iter().collect();
        layers.sort_by_key(|l| match l.rule.order() {
            Some(order) => (0, order),
            None => (1, 0),
        });
        layers
    }

    /// Face-value font size of the first declared text layer.
    pub fn base_font_size(&self) -> Option<f64> {
        self.text_layers().next().and_then(|(_, t)| match t.font_size {
            FontSize::Px(size) => Some(size),
            FontSize::Percent(_) => None,
        })
    }

    /// Read a property. `layer_key == "_general"` addresses the canvas.
    pub fn get_property(&self, layer_key: &str, key: PropertyKey) -> Option<PropertyValue> {
        if layer_key == GENERAL_KEY {
            return match key {
                PropertyKey::Width => Some(PropertyValue::Number(f64::from(self.width))),
                PropertyKey::Height => Some(PropertyValue::Number(f64::from(self.height))),
                PropertyKey::BackgroundColor => {
                    Some(PropertyValue::Color(self.background_color.clone()))
                }
                _ => None,
            };
        }
        self.layer(layer_key).and_then(|l| l.rule.get(key))
    }

    /// Write a property. Fails when the layer lacks the key or the type is wrong.
    pub fn set_property(
        &mut self,
        layer_key: &str,
        key: PropertyKey,
        value: &PropertyValue,
    ) -> Result<(), PropertyError> {
        if layer_key == GENERAL_KEY {
            match key {
                PropertyKey::Width | PropertyKey::Height => {
                    let n = value.number(key)?.round();
                    if n < 1.0 || n > f64::from(u32::MAX) {
                        return Err(PropertyError::Invalid {
                            property: key,
                            reason: "canvas dimensions must be positive".to_string(),
                        });
                    }
                    if key == PropertyKey::Width {
                        self.width = n as u32;
                    } else {
                        self.height = n as u32;
                    }
                }
                PropertyKey::BackgroundColor => self.background_color = value.color(key)?,
                _ => {
                    return Err(PropertyError::Unknown {
                        layer: layer_key.to_string(),
                        property: key,
                    })
                }
            }
            return Ok(());
        }

        let layer = self.layer_mut(layer_key).ok_or_else(|| PropertyError::Unknown {
            layer: layer_key.to_string(),
            property: key,
        })?;
        layer.rule.set(layer_key, key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_normalization() {
        assert_eq!(Color::parse("#FFF").unwrap().hex(), "ffffff");
        assert_eq!(Color::parse("00AAbb").unwrap().hex(), "00aabb");
        assert!(Color::parse("#12345").is_err());
        assert!(Color::parse("zzzzzz").is_err());
    }

    #[test]
    fn test_font_size_parsing() {
        assert_eq!("150%".parse::<FontSize>().unwrap(), FontSize::Percent(150.0));
        assert_eq!("32px".parse::<FontSize>().unwrap(), FontSize::Px(32.0));
        assert!("-4".parse::<FontSize>().is_err());
        assert_eq!(FontSize::Percent(150.0).resolve(32.0), 48.0);
    }

    #[test]
    fn test_layer_kind_is_tagged() {
        let json = r#"{"key":"title","kind":"text","fontSize":"120%","fieldName":"title"}"#;
        let layer: Layer = serde_json::from_str(json).unwrap();
        assert!(matches!(layer.rule, LayerRule::Text(_)));

        let untagged = r#"{"key":"title","fontSize":32}"#;
        assert!(serde_json::from_str::<Layer>(untagged).is_err());
    }

    #[test]
    fn test_formula_steps() {
        let calc = Calculation { formula: "* 0.8 + 1".to_string(), depends_on: "price".into() };
        let steps = calc.steps().unwrap();
        assert_eq!(steps, vec![(ArithOp::Mul, 0.8), (ArithOp::Add, 1.0)]);
        assert_eq!(calc.evaluate(10.0), Some(9.0));

        let bad = Calculation { formula: "times two".to_string(), depends_on: "price".into() };
        assert!(bad.steps().is_err());
    }

    #[test]
    fn test_property_type_checked() {
        let mut rules = RuleSet::new("p", 500, 900)
            .with_layer(Layer::text("title", TextRule::new("title", FontSize::Px(32.0))));
        rules
            .set_property("title", PropertyKey::X, &PropertyValue::Number(12.0))
            .unwrap();
        assert_eq!(rules.get_property("title", PropertyKey::X), Some(PropertyValue::Number(12.0)));

        let err = rules
            .set_property("title", PropertyKey::X, &PropertyValue::Flag(true))
            .unwrap_err();
        assert!(matches!(err, PropertyError::TypeMismatch { .. }));

        let err = rules
            .set_property("title", PropertyKey::AssetId, &PropertyValue::Text("a".into()))
            .unwrap_err();
        assert!(matches!(err, PropertyError::Unknown { .. }));

        assert!(rules
            .set_property(GENERAL_KEY, PropertyKey::Width, &PropertyValue::Number(0.0))
            .is_err());
    }
}
