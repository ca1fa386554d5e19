//! Segment Parser
//!
//! Splits a compiled transformation back into fragments tagged with the
//! layer that produced them, for click-to-highlight.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::binder::unescape_text;
use crate::compiler::{Plan, SegmentKind, SEPARATOR, SUBJECT_VARIABLE};
use crate::rules::{LayerKey, GENERAL_KEY};

const APPLY_LOOKBACK: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedSegment {
    pub text: String,
    pub provenance_key: Option<String>,
    pub kind: SegmentKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Variable,
    Text,
    Image,
}

#[derive(Debug, Clone)]
struct Needle {
    value: String,
    layer: LayerKey,
    category: Category,
}

/// Layer identifiers the parser searches for.
#[derive(Debug, Clone, Default)]
pub struct ProvenanceTable {
    needles: Vec<Needle>,
    /// For each needle, the longer needles of other layers that contain it.
    exclusions: Vec<Vec<usize>>,
}

impl ProvenanceTable {
    pub fn build(plan: &Plan) -> Self {
        let mut needles = vec![];
        for (layer, var) in &plan.variables {
            for value in [var.value(), var.scratch()] {
                needles.push(Needle { value, layer: layer.clone(), category: Category::Variable });
            }
        }
        for layer in &plan.layers {
            let category = match layer.kind {
                SegmentKind::TextContent => Category::Text,
                SegmentKind::ImageContent => Category::Image,
                _ => continue,
            };
            needles.push(Needle {
                value: layer.identifier.clone(),
                layer: layer.key.clone(),
                category,
            });
        }

        let exclusions = needles
            .iter()
            .map(|short| {
                needles
                    .iter()
                    .enumerate()
                    .filter(|(_, long)| {
                        long.category == short.category
                            && long.layer != short.layer
                            && long.value.len() > short.value.len()
                            && long.value.contains(short.value.as_str())
                    })
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect();

        Self { needles, exclusions }
    }

    pub fn len(&self) -> usize {
        self.needles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    /// Earliest occurrence of needle `i` in `region` not covered by an excluding needle.
    fn position(&self, i: usize, region: &str) -> Option<usize> {
        let needle = &self.needles[i].value;
        if needle.is_empty() {
            return None;
        }
        let covers: Vec<(usize, usize)> = self.exclusions[i]
            .iter()
            .flat_map(|&j| {
                let long = &self.needles[j].value;
                region.match_indices(long.as_str()).map(move |(at, _)| (at, at + long.len()))
            })
            .collect();

        region
            .match_indices(needle.as_str())
            .map(|(at, _)| at)
            .find(|&at| !covers.iter().any(|&(start, end)| start <= at && at + needle.len() <= end))
    }

    /// Pick the needle that explains `region`; content needles are claimed so
    /// identical identifiers map to successive layers.
    fn resolve(
        &self,
        category: Category,
        region: &str,
        claimed: &mut HashSet<usize>,
    ) -> Option<&LayerKey> {
        let candidates: Vec<usize> = (0..self.needles.len())
            .filter(|&i| self.needles[i].category == category)
            .collect();

        let exact = candidates.iter().copied().filter(|&i| self.needles[i].value == region);
        let chosen = match first_unclaimed(exact, claimed) {
            Some(i) => Some(i),
            None => {
                let mut best: Option<(usize, usize, usize)> = None;
                for &i in &candidates {
                    let Some(at) = self.position(i, region) else { continue };
                    let len = self.needles[i].value.len();
                    let better = match best {
                        None => true,
                        Some((best_at, best_len, best_i)) => {
                            at < best_at
                                || (at == best_at && len > best_len)
                                || (at == best_at
                                    && len == best_len
                                    && claimed.contains(&best_i)
                                    && !claimed.contains(&i))
                        }
                    };
                    if better {
                        best = Some((at, len, i));
                    }
                }
                best.map(|(_, _, i)| i)
            }
        };

        let i = chosen?;
        if category != Category::Variable {
            claimed.insert(i);
        }
        Some(&self.needles[i].layer)
    }
}

fn first_unclaimed(
    mut matches: impl Iterator<Item = usize>,
    claimed: &HashSet<usize>,
) -> Option<usize> {
    let first = matches.next()?;
    if !claimed.contains(&first) {
        return Some(first);
    }
    Some(matches.find(|i| !claimed.contains(i)).unwrap_or(first))
}

/// Overlay text carried by a text-content fragment, unescaped.
pub fn decode_text(fragment: &str) -> Option<String> {
    text_payload(fragment).map(unescape_text)
}

fn text_payload(fragment: &str) -> Option<&str> {
    fragment
        .split(',')
        .find_map(|p| p.strip_prefix("l_text:"))
        .and_then(|font_and_text| font_and_text.splitn(2, ':').nth(1))
}

fn image_token(fragment: &str) -> Option<&str> {
    fragment.split(',').next().and_then(|p| p.strip_prefix("l_"))
}

/// Tag every fragment of `compiled` with its kind and originating layer.
pub fn parse(compiled: &str, table: &ProvenanceTable) -> Vec<ParsedSegment> {
    let mut parsed: Vec<ParsedSegment> = vec![];
    let mut claimed = HashSet::new();

    for fragment in compiled.split(SEPARATOR).filter(|f| !f.is_empty()) {
        let params: Vec<&str> = fragment.split(',').collect();
        let first = params.first().copied().unwrap_or_default();

        let (kind, provenance_key) = if fragment.starts_with(&format!("{}_", SUBJECT_VARIABLE)) {
            (SegmentKind::AssetBinding, None)
        } else if fragment == "if_end" {
            let previous = parsed
                .last()
                .filter(|s| s.kind == SegmentKind::Variable)
                .and_then(|s| s.provenance_key.clone());
            (SegmentKind::Variable, previous)
        } else if fragment.starts_with('$') || fragment.starts_with("if_") {
            let key = table.resolve(Category::Variable, fragment, &mut claimed).cloned();
            (SegmentKind::Variable, key)
        } else if first.starts_with("b_") && params.contains(&"c_pad") {
            (SegmentKind::Canvas, Some(GENERAL_KEY.to_string()))
        } else if let Some(payload) = text_payload(fragment) {
            let key = table.resolve(Category::Text, payload, &mut claimed).cloned();
            (SegmentKind::TextContent, key)
        } else if let Some(token) = image_token(fragment) {
            let key = table.resolve(Category::Image, token, &mut claimed).cloned();
            (SegmentKind::ImageContent, key)
        } else if first == "fl_layer_apply" {
            (SegmentKind::Apply, applied_layer(&parsed))
        } else {
            (SegmentKind::Generic, None)
        };

        parsed.push(ParsedSegment { text: fragment.to_string(), provenance_key, kind });
    }
    parsed
}

/// Apply commands carry no identifier; they belong to the content just before them.
fn applied_layer(parsed: &[ParsedSegment]) -> Option<String> {
    parsed
        .iter()
        .rev()
        .take(APPLY_LOOKBACK)
        .take_while(|s| s.kind != SegmentKind::Apply)
        .find(|s| matches!(s.kind, SegmentKind::TextContent | SegmentKind::ImageContent))
        .and_then(|s| s.provenance_key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::FieldBindings;
    use crate::compiler::Compiler;
    use crate::rules::{FontSize, ImageRule, Layer, RuleSet, TextRule};

    fn text(field: &str, value: &str) -> TextRule {
        let mut t = TextRule::new(field, FontSize::Px(20.0));
        t.default_value = value.to_string();
        t
    }

    fn plan_for(rules: &RuleSet) -> Plan {
        Compiler::default().plan(rules, &FieldBindings::default(), rules.canvas(), "bag")
    }

    #[test]
    fn test_parse_recovers_compiled_provenance() {
        let rules = RuleSet::new("p", 500, 900)
            .with_layer(Layer::text("title", text("title", "Now on Sale")))
            .with_layer(Layer::image("subject", ImageRule::new(300.0, 300.0)));
        let plan = plan_for(&rules);
        let table = ProvenanceTable::build(&plan);

        let parsed = parse(&plan.transformation(), &table);
        let expected = plan.segments();
        assert_eq!(parsed.len(), expected.len());
        for (p, e) in parsed.iter().zip(&expected) {
            assert_eq!(p.text, e.tokens);
            assert_eq!(p.kind, e.kind);
            assert_eq!(p.provenance_key, e.provenance_key);
        }
    }

    #[test]
    fn test_longer_identifier_excludes_shorter() {
        let rules = RuleSet::new("p", 500, 900)
            .with_layer(Layer::text("price", text("price", "PRICE")))
            .with_layer(Layer::text("origPrice", text("origPrice", "ORIG PRICE")));
        let table = ProvenanceTable::build(&plan_for(&rules));

        let parsed = parse("co_rgb:000000,l_text:Arial_20:was%20ORIG%20PRICE", &table);
        assert_eq!(parsed[0].provenance_key.as_deref(), Some("origPrice"));

        let parsed = parse("co_rgb:000000,l_text:Arial_20:PRICE%20now", &table);
        assert_eq!(parsed[0].provenance_key.as_deref(), Some("price"));
    }

    #[test]
    fn test_identical_payloads_claimed_in_order() {
        let rules = RuleSet::new("p", 500, 900)
            .with_layer(Layer::text("a", text("a", "SALE")))
            .with_layer(Layer::text("b", text("b", "SALE")));
        let plan = plan_for(&rules);
        let parsed = parse(&plan.transformation(), &ProvenanceTable::build(&plan));

        let keys: Vec<_> = parsed
            .iter()
            .filter(|s| s.kind == SegmentKind::TextContent)
            .map(|s| s.provenance_key.as_deref())
            .collect();
        assert_eq!(keys, vec![Some("a"), Some("b")]);
    }

    #[test]
    fn test_metadata_block_belongs_to_one_layer() {
        let mut title = text("title", "SALE");
        title.metadata_key = Some("ptitle".into());
        let rules = RuleSet::new("p", 500, 900).with_layer(Layer::text("title", title));
        let plan = plan_for(&rules);
        let parsed = parse(&plan.transformation(), &ProvenanceTable::build(&plan));

        let variables: Vec<_> = parsed.iter().filter(|s| s.kind == SegmentKind::Variable).collect();
        assert_eq!(variables.len(), 5);
        assert!(variables.iter().all(|s| s.provenance_key.as_deref() == Some("title")));
    }

    #[test]
    fn test_unknown_fragments_are_generic() {
        let table = ProvenanceTable::default();
        let parsed = parse("e_grayscale/fl_layer_apply,g_center,x_0,y_0", &table);
        assert_eq!(parsed[0].kind, SegmentKind::Generic);
        assert_eq!(parsed[0].provenance_key, None);
        assert_eq!(parsed[1].kind, SegmentKind::Apply);
        assert_eq!(parsed[1].provenance_key, None);
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(
            decode_text("co_rgb:000000,l_text:Arial_32_bold:50%25%20off%21").as_deref(),
            Some("50% off!")
        );
        assert_eq!(decode_text("b_rgb:ffffff,c_pad,w_1,h_1"), None);
    }

    #[test]
    fn test_canvas_tagged_general() {
        let plan = plan_for(&RuleSet::new("p", 500, 900));
        let parsed = parse(&plan.transformation(), &ProvenanceTable::build(&plan));
        assert_eq!(parsed[1].kind, SegmentKind::Canvas);
        assert_eq!(parsed[1].provenance_key.as_deref(), Some(GENERAL_KEY));
    }
}
