//! Transformation Compiler
//!
//! Emits, in fixed order: the base-asset binding, variable bindings in layer
//! declaration order (each derived field right after its dependency), the
//! canvas pad, then one content + apply pair per visible layer in draw order.
//!
//! Iteration only ever walks the RuleSet's layer Vec, so identical inputs
//! produce byte-identical output.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::binder::{self, escape_text, format_number, Expression, FieldBindings, FieldVariable};
use crate::catalog::field_key;
use crate::config::CompilerConfig;
use crate::geometry::{scale, scale_ratio, Placement};
use crate::rules::{
    Calculation, ImageRule, LayerKey, LayerRule, RuleSet, Size, TextRule, GENERAL_KEY,
};

/// Command separator of the transformation syntax.
pub const SEPARATOR: char = '/';

/// Shared variable holding the base asset.
pub const SUBJECT_VARIABLE: &str = "$subject";

const STYLE_WORDS: [&str; 12] = [
    "thin", "extralight", "light", "normal", "medium", "semibold", "bold", "extrabold", "black",
    "italic", "oblique", "underline",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    AssetBinding,
    Variable,
    Canvas,
    TextContent,
    ImageContent,
    Apply,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledSegment {
    pub tokens: String,
    pub provenance_key: Option<String>,
    pub kind: SegmentKind,
}

impl CompiledSegment {
    fn new(tokens: String, provenance_key: Option<&str>, kind: SegmentKind) -> Self {
        Self { tokens, provenance_key: provenance_key.map(str::to_string), kind }
    }
}

/// One visible layer's content and apply commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEmission {
    pub key: LayerKey,
    pub kind: SegmentKind,
    pub content: String,
    pub apply: String,
    /// Identifier the parser looks for: text payload or image asset token.
    pub identifier: String,
}

/// Everything the compiler decided for one (RuleSet, canvas, asset) input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub asset_binding: CompiledSegment,
    pub bindings: Vec<CompiledSegment>,
    pub canvas: CompiledSegment,
    pub layers: Vec<LayerEmission>,
    /// Variables defined in the bindings, with the layer that defined them.
    pub variables: Vec<(LayerKey, FieldVariable)>,
}

impl Plan {
    pub fn segments(&self) -> Vec<CompiledSegment> {
        let mut segments = Vec::with_capacity(2 + self.bindings.len() + self.layers.len() * 2);
        segments.push(self.asset_binding.clone());
        segments.extend(self.bindings.iter().cloned());
        segments.push(self.canvas.clone());
        for layer in &self.layers {
            let key = Some(layer.key.as_str());
            segments.push(CompiledSegment::new(layer.content.clone(), key, layer.kind));
            segments.push(CompiledSegment::new(layer.apply.clone(), key, SegmentKind::Apply));
        }
        segments
    }

    pub fn transformation(&self) -> String {
        join_segments(&self.segments())
    }
}

pub fn join_segments(segments: &[CompiledSegment]) -> String {
    segments
        .iter()
        .map(|s| s.tokens.as_str())
        .collect::<Vec<_>>()
        .join(&SEPARATOR.to_string())
}

/// Asset path as a single command token: path separators become `:`.
pub fn asset_token(asset_id: &str) -> String {
    asset_id
        .split('/')
        .map(escape_text)
        .collect::<Vec<_>>()
        .join(":")
}

/// Font family token with trailing style words (`Open Sans Bold` -> `Open%20Sans_bold`).
pub fn font_token(font: &str, size: f64) -> String {
    let mut family = vec![];
    let mut styles = vec![];
    for word in font.split_whitespace() {
        let lower = word.to_ascii_lowercase();
        if STYLE_WORDS.contains(&lower.as_str()) {
            styles.push(lower);
        } else {
            family.push(word);
        }
    }
    let family = if family.is_empty() {
        "Arial".to_string()
    } else {
        escape_text(&family.join(" "))
    };

    let mut token = format!("{}_{}", family, format_number(size));
    for style in styles {
        token.push('_');
        token.push_str(&style);
    }
    token
}

pub struct Compiler {
    config: CompilerConfig,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn compile(
        &self,
        rules: &RuleSet,
        fields: &FieldBindings,
        canvas: Size,
        asset_id: &str,
    ) -> String {
        self.plan(rules, fields, canvas, asset_id).transformation()
    }

    pub fn compile_segments(
        &self,
        rules: &RuleSet,
        fields: &FieldBindings,
        canvas: Size,
        asset_id: &str,
    ) -> Vec<CompiledSegment> {
        self.plan(rules, fields, canvas, asset_id).segments()
    }

    pub fn plan(
        &self,
        rules: &RuleSet,
        fields: &FieldBindings,
        canvas: Size,
        asset_id: &str,
    ) -> Plan {
        let asset_binding = CompiledSegment::new(
            format!("{}_!{}!", SUBJECT_VARIABLE, asset_token(asset_id)),
            None,
            SegmentKind::AssetBinding,
        );

        let (bindings, variables, defined) = self.plan_bindings(rules, fields);

        let canvas_segment = CompiledSegment::new(
            format!(
                "b_rgb:{},c_pad,w_{},h_{}",
                rules.background_color.hex(),
                canvas.width,
                canvas.height
            ),
            Some(GENERAL_KEY),
            SegmentKind::Canvas,
        );

        let ratio = scale_ratio(canvas, self.config.base_width);
        let base_font = rules.base_font_size().unwrap_or(self.config.default_base_font_size);
        let vars = binder::assign_variables(rules);

        let layers = rules
            .draw_order()
            .into_iter()
            .filter_map(|layer| match &layer.rule {
                LayerRule::Text(text) => {
                    let field = field_key(&layer.key, text);
                    let variable = vars.get(field).filter(|_| defined.contains(field));
                    let binding = fields.resolve_for(&layer.key, text);
                    let literal = binding.current_literal.as_str();
                    self.emit_text(&layer.key, text, literal, variable, base_font, ratio)
                }
                LayerRule::Image(image) => self.emit_image(&layer.key, image, ratio),
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            rule_set = %rules.id,
            %canvas,
            bindings = bindings.len(),
            layers = layers.len(),
            "compiled rule set"
        );

        Plan { asset_binding, bindings, canvas: canvas_segment, layers, variables }
    }

    /// Variable bindings plus the set of field keys that ended up with a variable.
    fn plan_bindings(
        &self,
        rules: &RuleSet,
        fields: &FieldBindings,
    ) -> (Vec<CompiledSegment>, Vec<(LayerKey, FieldVariable)>, HashSet<String>) {
        let vars = binder::assign_variables(rules);
        let mut derived = resolve_calculations(rules);
        drop_empty_sources(rules, fields, &mut derived);

        let dependencies: HashSet<&str> = derived.values().map(|(dep, _)| dep.as_str()).collect();

        let mut state = BindingState {
            rules,
            fields,
            vars: &vars,
            derived: &derived,
            dependencies: &dependencies,
            segments: vec![],
            variables: vec![],
            defined: HashSet::new(),
            emitted_layers: HashSet::new(),
        };

        for (layer_key, _) in rules.text_layers() {
            if !derived.contains_key(layer_key.as_str()) {
                state.emit(layer_key);
            }
        }

        (state.segments, state.variables, state.defined)
    }

    fn emit_text(
        &self,
        key: &str,
        text: &TextRule,
        literal: &str,
        variable: Option<&FieldVariable>,
        base_font: f64,
        ratio: f64,
    ) -> Option<LayerEmission> {
        let core = match variable {
            Some(var) => var.reference(),
            None => escape_text(literal),
        };
        let payload = format!("{}{}{}", escape_text(&text.prefix), core, escape_text(&text.suffix));
        if payload.is_empty() {
            tracing::debug!(layer = key, "empty text layer skipped");
            return None;
        }

        let size = text.font_size.resolve(base_font);
        let mut params = vec![];
        if let Some(width) = text.wrap_width.filter(|w| text.wrap && *w > 0.0) {
            params.push("c_fit".to_string());
            params.push(format!("w_{}", width.round() as i64));
        }
        params.push(format!("co_rgb:{}", text.color.hex()));
        if text.flags.no_overflow {
            params.push("fl_no_overflow".to_string());
        }
        if text.flags.disallow_overflow {
            params.push("fl_text_disallow_overflow".to_string());
        }
        params.push(format!("l_text:{}:{}", font_token(&text.font, size), payload));

        Some(LayerEmission {
            key: key.to_string(),
            kind: SegmentKind::TextContent,
            content: params.join(","),
            apply: Placement::compute(text.x, text.y, text.gravity, ratio).apply_command(),
            identifier: payload,
        })
    }

    fn emit_image(&self, key: &str, image: &ImageRule, ratio: f64) -> Option<LayerEmission> {
        if !image.show {
            return None;
        }
        let token = match image.asset_id.as_deref().filter(|a| !a.is_empty()) {
            Some(asset) => asset_token(asset),
            None => SUBJECT_VARIABLE.to_string(),
        };
        let width = scale(image.width, ratio).max(1);
        let height = scale(image.height, ratio).max(1);

        Some(LayerEmission {
            key: key.to_string(),
            kind: SegmentKind::ImageContent,
            content: format!("l_{},c_fit,w_{},h_{}", token, width, height),
            apply: Placement::compute(image.x, image.y, image.gravity, ratio).apply_command(),
            identifier: token,
        })
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompilerConfig::default())
    }
}

struct BindingState<'a> {
    rules: &'a RuleSet,
    fields: &'a FieldBindings,
    vars: &'a BTreeMap<String, FieldVariable>,
    derived: &'a BTreeMap<String, (LayerKey, Expression)>,
    dependencies: &'a HashSet<&'a str>,
    segments: Vec<CompiledSegment>,
    variables: Vec<(LayerKey, FieldVariable)>,
    defined: HashSet<String>,
    emitted_layers: HashSet<String>,
}

impl BindingState<'_> {
    /// Emit a layer's binding, then every derived layer depending on it.
    fn emit(&mut self, layer_key: &str) {
        if !self.emitted_layers.insert(layer_key.to_string()) {
            return;
        }
        let (rules, derived, vars) = (self.rules, self.derived, self.vars);
        let Some(text) = rules.layer(layer_key).and_then(|l| l.rule.as_text()) else {
            return;
        };
        let field = field_key(layer_key, text).to_string();

        if let Some(var) = vars.get(&field) {
            let expression = match derived.get(layer_key) {
                Some((_, expression)) => expression.clone(),
                None => {
                    let binding = self.fields.resolve_for(layer_key, text);
                    binder::bind(&binding, var, self.dependencies.contains(layer_key))
                }
            };
            // A field shared by several layers is defined once, by the first.
            if let Some(defined_var) = expression.variable() {
                if self.defined.insert(field) {
                    self.variables.push((layer_key.to_string(), defined_var.clone()));
                    for tokens in expression.definitions() {
                        self.segments.push(CompiledSegment::new(
                            tokens,
                            Some(layer_key),
                            SegmentKind::Variable,
                        ));
                    }
                }
            }
        }

        let dependents: Vec<String> = rules
            .text_layers()
            .filter(|(key, _)| {
                derived
                    .get(key.as_str())
                    .map_or(false, |(dep, _)| dep == layer_key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for dependent in dependents {
            self.emit(&dependent);
        }
    }
}

/// Derived-field expressions that can be emitted, keyed by layer, with their dependency.
///
/// Missing, non-text, self or cyclic references and malformed formulas are
/// logged and dropped; those layers fall back to their literal value.
fn resolve_calculations(rules: &RuleSet) -> BTreeMap<String, (LayerKey, Expression)> {
    let vars = binder::assign_variables(rules);
    let mut derived = BTreeMap::new();

    for (layer_key, text) in rules.text_layers() {
        let Some(calc) = &text.calculation else { continue };

        if let Err(reason) = check_chain(rules, layer_key) {
            tracing::warn!(
                layer = %layer_key,
                depends_on = %calc.depends_on,
                reason,
                "unresolvable calculation reference, binding skipped"
            );
            continue;
        }

        let dep_text = match rules.layer(&calc.depends_on).map(|l| &l.rule) {
            Some(LayerRule::Text(dep)) => dep,
            _ => continue,
        };
        let (Some(var), Some(source)) = (
            vars.get(field_key(layer_key, text)),
            vars.get(field_key(&calc.depends_on, dep_text)),
        ) else {
            continue;
        };
        if var == source {
            tracing::warn!(
                layer = %layer_key,
                "calculation shares its dependency's field, binding skipped"
            );
            continue;
        }

        match binder::derive(layer_key, var, source, calc) {
            Ok(expression) => {
                derived.insert(layer_key.clone(), (calc.depends_on.clone(), expression));
            }
            Err(e) => tracing::warn!(layer = %layer_key, error = %e, "binding skipped"),
        }
    }
    derived
}

/// Drop derivations whose source would render as an empty variable.
///
/// Repeats until stable so a chain collapses behind a dropped link.
fn drop_empty_sources(
    rules: &RuleSet,
    fields: &FieldBindings,
    derived: &mut BTreeMap<String, (LayerKey, Expression)>,
) {
    loop {
        let empty: Vec<String> = derived
            .iter()
            .filter(|(_, (dep, _))| {
                !derived.contains_key(dep.as_str())
                    && rules
                        .layer(dep)
                        .and_then(|l| l.rule.as_text())
                        .map_or(false, |text| !fields.resolve_for(dep, text).holds_value())
            })
            .map(|(key, _)| key.clone())
            .collect();
        if empty.is_empty() {
            return;
        }
        for key in empty {
            if let Some((dep, _)) = derived.remove(&key) {
                tracing::warn!(
                    layer = %key,
                    depends_on = %dep,
                    "calculation source is empty, binding skipped"
                );
            }
        }
    }
}

fn calculation_of<'r>(rules: &'r RuleSet, key: &str) -> Option<&'r Calculation> {
    rules
        .layer(key)
        .and_then(|l| l.rule.as_text())
        .and_then(|t| t.calculation.as_ref())
}

/// Check a derived layer's own reference, then walk its chain looking for a cycle.
fn check_chain(rules: &RuleSet, start: &str) -> Result<(), &'static str> {
    let Some(calc) = calculation_of(rules, start) else {
        return Ok(());
    };
    if calc.steps().is_err() {
        return Err("malformed formula");
    }
    if calc.depends_on == start {
        return Err("self reference");
    }
    match rules.layer(&calc.depends_on) {
        None => return Err("dependency does not exist"),
        Some(layer) if layer.rule.as_text().is_none() => {
            return Err("dependency is not a text layer")
        }
        Some(_) => {}
    }

    let mut visited = HashSet::from([start]);
    let mut current = calc.depends_on.as_str();
    while let Some(link) = calculation_of(rules, current) {
        visited.insert(current);
        current = link.depends_on.as_str();
        if visited.contains(current) {
            return Err("cyclic dependency");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Color, FontSize, Gravity, Layer};

    fn title_rules() -> RuleSet {
        let mut title = TextRule::new("title", FontSize::Px(32.0));
        title.default_value = "Now on Sale".to_string();
        RuleSet::new("p", 500, 900).with_layer(Layer::text("title", title))
    }

    fn plan_for(rules: &RuleSet) -> Plan {
        Compiler::default().plan(rules, &FieldBindings::default(), Size::new(500, 500), "a")
    }

    #[test]
    fn test_compile_order() {
        let fields = FieldBindings::default();
        let canvas = Size::new(500, 900);
        let out = Compiler::default().compile(&title_rules(), &fields, canvas, "shoes/red");
        assert_eq!(
            out,
            "$subject_!shoes:red!/b_rgb:ffffff,c_pad,w_500,h_900/\
             co_rgb:000000,l_text:Arial_32:Now%20on%20Sale/\
             fl_layer_apply,g_north_west,x_0,y_0"
        );
    }

    #[test]
    fn test_positions_scale_but_font_does_not() {
        let mut rules = title_rules();
        if let LayerRule::Text(t) = &mut rules.layers[0].rule {
            t.x = 10.0;
            t.y = 25.0;
            t.gravity = Gravity::South;
        }
        let segments = Compiler::default().compile_segments(
            &rules,
            &FieldBindings::default(),
            Size::new(1000, 1800),
            "a",
        );
        assert!(segments[2].tokens.contains("Arial_32:"));
        assert_eq!(segments[3].tokens, "fl_layer_apply,g_south,x_20,y_50");
    }

    #[test]
    fn test_percent_font_resolves_against_first_text_layer() {
        let rules = title_rules().with_layer(Layer::text("sub", {
            let mut t = TextRule::new("sub", FontSize::Percent(150.0));
            t.default_value = "x".into();
            t.font = "Open Sans Bold".into();
            t
        }));
        let fields = FieldBindings::default();
        let out = Compiler::default().compile(&rules, &fields, Size::new(1080, 1920), "a");
        assert!(out.contains("l_text:Open%20Sans_48_bold:x"));
    }

    #[test]
    fn test_draw_order_is_stable() {
        let mut base = ImageRule::new(10.0, 10.0);
        base.order = Some(2);
        let mut top = ImageRule::new(10.0, 10.0);
        top.order = Some(1);
        let rules = RuleSet::new("p", 500, 500)
            .with_layer(Layer::image("unordered", ImageRule::new(10.0, 10.0)))
            .with_layer(Layer::image("second", base))
            .with_layer(Layer::image("first", top));

        let plan = plan_for(&rules);
        let keys: Vec<_> = plan.layers.iter().map(|l| l.key.as_str()).collect();
        assert_eq!(keys, vec!["first", "second", "unordered"]);
    }

    #[test]
    fn test_hidden_images_skipped() {
        let mut hidden = ImageRule::new(10.0, 10.0);
        hidden.show = false;
        let mut logo = ImageRule::new(10.0, 10.0);
        logo.asset_id = Some("brand/logo".into());
        let rules = RuleSet::new("p", 500, 500)
            .with_layer(Layer::image("hidden", hidden))
            .with_layer(Layer::image("logo", logo))
            .with_layer(Layer::image("subject", ImageRule::new(40.0, 40.0)));

        let plan = plan_for(&rules);
        let contents: Vec<_> = plan.layers.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(contents, vec!["l_brand:logo,c_fit,w_10,h_10", "l_$subject,c_fit,w_40,h_40"]);
    }

    #[test]
    fn test_calculation_follows_dependency() {
        let mut sale = TextRule::new("sale", FontSize::Px(20.0));
        sale.calculation =
            Some(Calculation { formula: "* 0.8".into(), depends_on: "price".into() });
        let mut price = TextRule::new("price", FontSize::Px(20.0));
        price.default_value = "25".into();
        let mut title = TextRule::new("title", FontSize::Px(20.0));
        title.default_value = "Hi".into();
        let rules = RuleSet::new("p", 500, 500)
            .with_layer(Layer::text("sale", sale))
            .with_layer(Layer::text("price", price))
            .with_layer(Layer::text("title", title));

        let plan = plan_for(&rules);
        let bindings: Vec<_> = plan.bindings.iter().map(|s| s.tokens.as_str()).collect();
        assert_eq!(bindings, vec!["$fprice_25", "$fsale_$fprice_mul_0.8"]);
        assert!(plan.layers[0].content.ends_with(":$(fsale)"));
        assert!(plan.layers[1].content.ends_with(":$(fprice)"));
        assert!(plan.layers[2].content.ends_with(":Hi"));
    }

    #[test]
    fn test_unresolvable_calculation_degrades_to_literal() {
        let mut sale = TextRule::new("sale", FontSize::Px(20.0));
        sale.default_value = "n/a".into();
        sale.calculation =
            Some(Calculation { formula: "* 0.8".into(), depends_on: "ghost".into() });
        let mut a = TextRule::new("a", FontSize::Px(20.0));
        a.calculation = Some(Calculation { formula: "+ 1".into(), depends_on: "b".into() });
        let mut b = TextRule::new("b", FontSize::Px(20.0));
        b.default_value = "5".into();
        b.calculation = Some(Calculation { formula: "+ 1".into(), depends_on: "a".into() });
        let rules = RuleSet::new("p", 500, 500)
            .with_layer(Layer::text("sale", sale))
            .with_layer(Layer::text("a", a))
            .with_layer(Layer::text("b", b));

        let plan = plan_for(&rules);
        assert!(plan.bindings.is_empty());
        assert!(plan.layers[0].content.ends_with(":n%2Fa"));
        assert_eq!(plan.layers.len(), 2);
    }

    #[test]
    fn test_empty_source_degrades_to_literal() {
        let mut sale = TextRule::new("sale", FontSize::Px(20.0));
        sale.default_value = "soon".into();
        sale.calculation =
            Some(Calculation { formula: "* 0.8".into(), depends_on: "price".into() });
        let rules = RuleSet::new("p", 500, 500)
            .with_layer(Layer::text("price", TextRule::new("price", FontSize::Px(20.0))))
            .with_layer(Layer::text("sale", sale));

        let out = plan_for(&rules).transformation();
        assert!(!out.contains("$fprice"));
        assert!(!out.contains("$fsale"));
        assert!(out.contains("l_text:Arial_20:soon"));

        let mut fields = FieldBindings::default();
        fields.set_literal("price", "10");
        let out = Compiler::default().compile(&rules, &fields, Size::new(500, 500), "a");
        assert!(out.contains("$fprice_10/$fsale_$fprice_mul_0.8"));
    }

    #[test]
    fn test_text_params() {
        let mut t = TextRule::new("title", FontSize::Px(30.0));
        t.default_value = "Wrap me".into();
        t.wrap = true;
        t.wrap_width = Some(300.0);
        t.color = Color::parse("#FF0000").unwrap();
        t.flags.no_overflow = true;
        t.prefix = "$".into();
        let rules = RuleSet::new("p", 500, 500).with_layer(Layer::text("title", t));
        let plan = plan_for(&rules);
        assert_eq!(
            plan.layers[0].content,
            "c_fit,w_300,co_rgb:ff0000,fl_no_overflow,l_text:Arial_30:%24Wrap%20me"
        );
    }
}
