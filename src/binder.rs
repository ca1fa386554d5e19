//! Variable Binder
//!
//! Resolves each text field into a literal, a metadata lookup with a literal
//! fallback, or an arithmetic derivation of another field.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::catalog::{field_key, FieldCatalog, BACKGROUND_FIELD};
use crate::rules::{ArithOp, Calculation, LayerKey, RuleSet, TextRule};

#[derive(Debug, Error, PartialEq)]
pub enum BindError {
    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Field {0} cannot be bound to metadata")]
    NotBindable(String),

    #[error("Layer {layer} references missing or invalid layer {target}")]
    UnresolvableReference { layer: LayerKey, target: LayerKey },

    #[error("Layer {layer} has a malformed formula '{formula}'")]
    MalformedFormula { layer: LayerKey, formula: String },
}

/// Format a number without a trailing `.0` for integral values.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

const ESCAPES: [(char, &str); 8] = [
    ('%', "%25"),
    ('!', "%21"),
    ('/', "%2F"),
    (',', "%2C"),
    ('$', "%24"),
    (':', "%3A"),
    (' ', "%20"),
    ('\n', "%0A"),
];

/// Percent-escape characters reserved by the transformation syntax.
pub fn escape_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match ESCAPES.iter().find(|(ch, _)| *ch == c) {
            Some((_, code)) => out.push_str(code),
            None => out.push(c),
        }
    }
    out
}

/// Exact inverse of `escape_text`.
pub fn unescape_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];
        match ESCAPES.iter().find(|(_, code)| tail.starts_with(code)) {
            Some((ch, code)) => {
                out.push(*ch);
                rest = &tail[code.len()..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

// --- Variable names ---

/// Variable names for one field: value `$f<name>`, scratch `$m<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldVariable {
    pub name: String,
}

impl FieldVariable {
    pub fn value(&self) -> String {
        format!("$f{}", self.name)
    }

    pub fn scratch(&self) -> String {
        format!("$m{}", self.name)
    }

    /// Interpolation form used inside text overlays.
    pub fn reference(&self) -> String {
        format!("$(f{})", self.name)
    }
}

/// One variable per distinct field, in declaration order, with collisions
/// between sanitized names resolved by a numeric suffix.
pub fn assign_variables(rules: &RuleSet) -> BTreeMap<String, FieldVariable> {
    let mut assigned = BTreeMap::new();
    let mut taken: HashSet<String> = HashSet::new();

    for (layer_key, text) in rules.text_layers() {
        let field = field_key(layer_key, text);
        if assigned.contains_key(field) {
            continue;
        }
        let mut base: String = field.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        if base.is_empty() {
            base = "field".to_string();
        }
        let mut name = base.clone();
        let mut n = 2;
        while !taken.insert(name.clone()) {
            name = format!("{}{}", base, n);
            n += 1;
        }
        assigned.insert(field.to_string(), FieldVariable { name });
    }
    assigned
}

// --- Literals and expressions ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiteralValue {
    /// Decimal digits kept exactly as entered.
    Number(String),
    Text(String),
}

fn is_plain_number(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    let (int, frac) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };
    !int.is_empty()
        && int.chars().all(|c| c.is_ascii_digit())
        && frac.map_or(true, |f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()))
}

impl LiteralValue {
    pub fn classify(raw: &str) -> Self {
        if is_plain_number(raw) {
            LiteralValue::Number(raw.to_string())
        } else {
            LiteralValue::Text(raw.to_string())
        }
    }

    /// Token form: numbers bare, strings delimited and escaped.
    pub fn token(&self) -> String {
        match self {
            LiteralValue::Number(n) => n.clone(),
            LiteralValue::Text(s) => format!("!{}!", escape_text(s)),
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            LiteralValue::Number(n) | LiteralValue::Text(n) => n,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Inlined into the text overlay; no variable is defined.
    Literal(LiteralValue),
    /// Literal held in a variable so a derived field can reference it.
    Assign { var: FieldVariable, value: LiteralValue },
    /// Default, then metadata lookup, then conditional overwrite when non-empty.
    Metadata { var: FieldVariable, default: LiteralValue, key: String },
    /// Arithmetic derivation of another field's variable.
    Derived { var: FieldVariable, source: FieldVariable, steps: Vec<(ArithOp, f64)> },
}

impl Expression {
    pub fn variable(&self) -> Option<&FieldVariable> {
        match self {
            Expression::Literal(_) => None,
            Expression::Assign { var, .. }
            | Expression::Metadata { var, .. }
            | Expression::Derived { var, .. } => Some(var),
        }
    }

    /// Variable-definition commands, in emission order.
    pub fn definitions(&self) -> Vec<String> {
        match self {
            Expression::Literal(_) => vec![],
            Expression::Assign { var, value } => vec![format!("{}_{}", var.value(), value.token())],
            Expression::Metadata { var, default, key } => vec![
                format!("{}_{}", var.value(), default.token()),
                format!("{}_md:!{}!", var.scratch(), escape_text(key)),
                format!("if_{}_ne_!!", var.scratch()),
                format!("{}_{}", var.value(), var.scratch()),
                "if_end".to_string(),
            ],
            Expression::Derived { var, source, steps } => {
                let mut command = format!("{}_{}", var.value(), source.value());
                for (op, operand) in steps {
                    command.push_str(&format!("_{}_{}", op.token(), format_number(*operand)));
                }
                vec![command]
            }
        }
    }
}

/// Resolve a field binding into an expression.
///
/// A metadata-bound field with an empty literal falls back to a single space,
/// so the variable is never empty at render time.
pub fn bind(binding: &FieldBinding, var: &FieldVariable, needs_variable: bool) -> Expression {
    if binding.is_metadata_bound && !binding.metadata_key.is_empty() {
        let default = if binding.current_literal.is_empty() {
            LiteralValue::Text(" ".to_string())
        } else {
            LiteralValue::classify(&binding.current_literal)
        };
        return Expression::Metadata {
            var: var.clone(),
            default,
            key: binding.metadata_key.clone(),
        };
    }

    let value = LiteralValue::classify(&binding.current_literal);
    if needs_variable {
        Expression::Assign { var: var.clone(), value }
    } else {
        Expression::Literal(value)
    }
}

pub fn derive(
    layer: &str,
    var: &FieldVariable,
    source: &FieldVariable,
    calculation: &Calculation,
) -> Result<Expression, BindError> {
    let steps = calculation.steps().map_err(|_| BindError::MalformedFormula {
        layer: layer.to_string(),
        formula: calculation.formula.clone(),
    })?;
    Ok(Expression::Derived { var: var.clone(), source: source.clone(), steps })
}

// --- Field bindings ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldBinding {
    pub field_name: String,
    pub current_literal: String,
    pub is_metadata_bound: bool,
    /// Empty while unbound.
    pub metadata_key: String,
    #[serde(default)]
    pub saved_literal_before_binding: Option<String>,
}

impl FieldBinding {
    pub fn literal(field_name: &str, value: &str) -> Self {
        Self {
            field_name: field_name.to_string(),
            current_literal: value.to_string(),
            is_metadata_bound: false,
            metadata_key: String::new(),
            saved_literal_before_binding: None,
        }
    }

    /// Whether the field yields a non-empty variable at render time.
    pub fn holds_value(&self) -> bool {
        let bound = self.is_metadata_bound && !self.metadata_key.is_empty();
        bound || !self.current_literal.is_empty()
    }

    fn from_rule(field_name: &str, text: &TextRule) -> Self {
        let mut binding = Self::literal(field_name, &text.default_value);
        if let Some(key) = text.metadata_key.as_deref().filter(|k| !k.is_empty()) {
            binding.is_metadata_bound = true;
            binding.metadata_key = key.to_string();
        }
        binding
    }
}

/// Per-field editor state, seeded from the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldBindings {
    fields: BTreeMap<String, FieldBinding>,
}

impl FieldBindings {
    pub fn seed(catalog: &FieldCatalog) -> Self {
        let mut bindings = Self::default();
        bindings.reinitialize(catalog);
        bindings
    }

    /// Reset every binding to the catalog's defaults in place.
    pub fn reinitialize(&mut self, catalog: &FieldCatalog) {
        self.fields.clear();
        for (name, meta) in catalog.iter() {
            let mut binding = FieldBinding::literal(name, &meta.default_value);
            if let Some(key) = meta.metadata_key.as_deref().filter(|k| !k.is_empty()) {
                binding.is_metadata_bound = true;
                binding.metadata_key = key.to_string();
            }
            self.fields.insert(name.clone(), binding);
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldBinding> {
        self.fields.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldBinding> {
        self.fields.values()
    }

    /// Set the literal value. While bound, this is the fallback default.
    pub fn set_literal(&mut self, field: &str, value: &str) {
        self.fields
            .entry(field.to_string())
            .or_insert_with(|| FieldBinding::literal(field, ""))
            .current_literal = value.to_string();
    }

    /// Bind a field to a metadata key, remembering the literal it had.
    pub fn bind_metadata(&mut self, field: &str, key: &str) -> Result<(), BindError> {
        if field == BACKGROUND_FIELD {
            return Err(BindError::NotBindable(field.to_string()));
        }
        let binding = self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| FieldBinding::literal(field, ""));
        if !binding.is_metadata_bound {
            binding.saved_literal_before_binding = Some(binding.current_literal.clone());
        }
        binding.is_metadata_bound = true;
        binding.metadata_key = key.to_string();
        Ok(())
    }

    /// Return to a literal: the saved pre-binding literal, else the catalog default.
    pub fn unbind(
        &mut self,
        field: &str,
        catalog: &FieldCatalog,
    ) -> Result<&FieldBinding, BindError> {
        let binding = self
            .fields
            .get_mut(field)
            .ok_or_else(|| BindError::UnknownField(field.to_string()))?;
        if binding.is_metadata_bound {
            let restored = binding
                .saved_literal_before_binding
                .take()
                .or_else(|| catalog.default_for(field).map(str::to_string))
                .unwrap_or_default();
            binding.current_literal = restored;
            binding.is_metadata_bound = false;
            binding.metadata_key.clear();
        }
        Ok(binding)
    }

    /// Replace a field's state with the rule's own default and metadata key.
    pub fn reseed_from_rule(&mut self, layer_key: &str, text: &TextRule) {
        let field = field_key(layer_key, text);
        self.fields.insert(field.to_string(), FieldBinding::from_rule(field, text));
    }

    /// Binding for a text layer: session state when present, else the rule's own values.
    pub fn resolve_for(&self, layer_key: &str, text: &TextRule) -> FieldBinding {
        let field = field_key(layer_key, text);
        self.fields
            .get(field)
            .cloned()
            .unwrap_or_else(|| FieldBinding::from_rule(field, text))
    }

    /// Text a layer would show before rendering, or `None` when it depends on
    /// metadata only known at render time.
    pub fn preview_text(&self, rules: &RuleSet, layer_key: &str) -> Option<String> {
        let text = rules.layer(layer_key)?.rule.as_text()?;
        let value = self.preview_value(rules, layer_key, 0)?;
        Some(format!("{}{}{}", text.prefix, value, text.suffix))
    }

    fn preview_value(&self, rules: &RuleSet, layer_key: &str, depth: usize) -> Option<String> {
        let text = rules.layer(layer_key)?.rule.as_text()?;
        let binding = self.resolve_for(layer_key, text);

        if let Some(calc) = &text.calculation {
            let dependency_is_text = rules
                .layer(&calc.depends_on)
                .map_or(false, |l| l.rule.as_text().is_some());
            let usable = dependency_is_text && calc.depends_on != layer_key && calc.steps().is_ok();
            if depth < 16 && usable {
                let source = self.preview_value(rules, &calc.depends_on, depth + 1)?;
                let evaluated = source.trim().parse::<f64>().ok().and_then(|v| calc.evaluate(v));
                if let Some(value) = evaluated {
                    return Some(format_number(value));
                }
            }
        }

        if binding.is_metadata_bound && !binding.metadata_key.is_empty() {
            None
        } else {
            Some(binding.current_literal)
        }
    }
}
