//! Geometry Projector
//!
//! Positional math shared by the compiler's apply command and the overlay
//! boxes, so highlights line up with the rendered output.

use serde::{Deserialize, Serialize};

use crate::binder::FieldBindings;
use crate::config::{CompilerConfig, GeometryConfig};
use crate::rules::{Gravity, LayerKey, LayerRule, RuleSet, Size};

/// Ratio applied to positions and image sizes (never to font sizes).
pub fn scale_ratio(canvas: Size, base_width: u32) -> f64 {
    if base_width == 0 {
        1.0
    } else {
        f64::from(canvas.width) / f64::from(base_width)
    }
}

pub fn scale(value: f64, ratio: f64) -> i64 {
    (value * ratio).round() as i64
}

/// Gravity-relative offset of a layer after scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub gravity: Gravity,
    pub x: i64,
    pub y: i64,
}

impl Placement {
    pub fn compute(x: f64, y: f64, gravity: Gravity, ratio: f64) -> Self {
        Self { gravity, x: scale(x, ratio), y: scale(y, ratio) }
    }

    pub fn apply_command(&self) -> String {
        format!("fl_layer_apply,g_{},x_{},y_{}", self.gravity.token(), self.x, self.y)
    }

    /// Top-left corner of a `width` x `height` box on `canvas`.
    ///
    /// Offsets push away from the anchored edge; on centered axes they move
    /// right/down from the center.
    pub fn origin(&self, canvas: Size, width: f64, height: f64) -> (f64, f64) {
        let (cw, ch) = (f64::from(canvas.width), f64::from(canvas.height));
        let (x, y) = (self.x as f64, self.y as f64);

        let left = match self.gravity {
            Gravity::NorthWest | Gravity::West | Gravity::SouthWest => x,
            Gravity::North | Gravity::Center | Gravity::South => (cw - width) / 2.0 + x,
            Gravity::NorthEast | Gravity::East | Gravity::SouthEast => cw - width - x,
        };
        let top = match self.gravity {
            Gravity::NorthWest | Gravity::North | Gravity::NorthEast => y,
            Gravity::West | Gravity::Center | Gravity::East => (ch - height) / 2.0 + y,
            Gravity::SouthWest | Gravity::South | Gravity::SouthEast => ch - height - y,
        };
        (left, top)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
    pub layer_key: LayerKey,
    pub rect: Rect,
}

/// How a rendered preview maps onto the screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub scale: f64,
    pub offset: (f64, f64),
}

impl Default for Viewport {
    fn default() -> Self {
        Self { scale: 1.0, offset: (0.0, 0.0) }
    }
}

pub struct Projector {
    geometry: GeometryConfig,
    compiler: CompilerConfig,
}

impl Projector {
    pub fn new(geometry: GeometryConfig, compiler: CompilerConfig) -> Self {
        Self { geometry, compiler }
    }

    /// On-screen box for one layer. `content` is the text it will show, or
    /// `None` when that is only known at render time.
    pub fn project(
        &self,
        rule: &LayerRule,
        content: Option<&str>,
        base_font_size: f64,
        canvas: Size,
        viewport: Viewport,
    ) -> Option<Rect> {
        let ratio = scale_ratio(canvas, self.compiler.base_width);

        let (placement, width, height) = match rule {
            LayerRule::Text(text) => {
                let size = text.font_size.resolve(base_font_size);
                let (width, height) = match content {
                    None => (self.geometry.placeholder_width, self.geometry.placeholder_height),
                    Some("") => return None,
                    Some(content) => {
                        let multiplier =
                            text.width_multiplier.unwrap_or(self.geometry.width_multiplier);
                        let estimated = content.chars().count() as f64 * size * multiplier;
                        let wrap = text.wrap_width.filter(|w| text.wrap && *w > 0.0);
                        let (width, lines) = match wrap {
                            Some(limit) if estimated > limit => (limit, (estimated / limit).ceil()),
                            _ => (estimated, 1.0),
                        };
                        (width, lines * size * self.geometry.line_height)
                    }
                };
                (Placement::compute(text.x, text.y, text.gravity, ratio), width, height)
            }
            LayerRule::Image(image) => {
                if !image.show {
                    return None;
                }
                (
                    Placement::compute(image.x, image.y, image.gravity, ratio),
                    scale(image.width, ratio) as f64,
                    scale(image.height, ratio) as f64,
                )
            }
        };

        let (left, top) = placement.origin(canvas, width, height);
        Some(Rect {
            left: viewport.offset.0 + left * viewport.scale,
            top: viewport.offset.1 + top * viewport.scale,
            width: width * viewport.scale,
            height: height * viewport.scale,
        })
    }

    /// Boxes for every visible layer in draw order.
    ///
    /// Returns nothing when the rendered asset does not match `canvas`,
    /// since the boxes would be misaligned.
    pub fn project_all(
        &self,
        rules: &RuleSet,
        fields: &FieldBindings,
        canvas: Size,
        rendered: Size,
        viewport: Viewport,
    ) -> Vec<Overlay> {
        if rendered != canvas {
            tracing::debug!(%canvas, %rendered, "stale geometry, no overlays");
            return vec![];
        }

        let base_font = rules
            .base_font_size()
            .unwrap_or(self.compiler.default_base_font_size);

        rules
            .draw_order()
            .into_iter()
            .filter_map(|layer| {
                let content = match &layer.rule {
                    LayerRule::Text(_) => fields.preview_text(rules, &layer.key),
                    LayerRule::Image(_) => None,
                };
                self.project(&layer.rule, content.as_deref(), base_font, canvas, viewport)
                    .map(|rect| Overlay { layer_key: layer.key.clone(), rect })
            })
            .collect()
    }
}

impl Default for Projector {
    fn default() -> Self {
        Self::new(GeometryConfig::default(), CompilerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{FontSize, ImageRule, Layer, TextRule};

    #[test]
    fn test_gravity_origins() {
        let canvas = Size::new(500, 900);
        let at = |gravity| Placement { gravity, x: 10, y: 20 }.origin(canvas, 100.0, 50.0);

        assert_eq!(at(Gravity::NorthWest), (10.0, 20.0));
        assert_eq!(at(Gravity::North), (210.0, 20.0));
        assert_eq!(at(Gravity::NorthEast), (390.0, 20.0));
        assert_eq!(at(Gravity::Center), (210.0, 445.0));
        assert_eq!(at(Gravity::SouthEast), (390.0, 830.0));
        assert_eq!(at(Gravity::SouthWest), (10.0, 830.0));
    }

    #[test]
    fn test_image_scales_with_canvas() {
        let mut image = ImageRule::new(100.0, 50.0);
        image.x = 10.0;
        let projector = Projector::default();
        let rule = LayerRule::Image(image);
        let rect = projector
            .project(&rule, None, 32.0, Size::new(1000, 1800), Viewport::default())
            .unwrap();
        assert_eq!(rect, Rect { left: 20.0, top: 0.0, width: 200.0, height: 100.0 });
    }

    #[test]
    fn test_text_size_does_not_scale() {
        let text = TextRule::new("title", FontSize::Px(10.0));
        let projector = Projector::default();
        let rule = LayerRule::Text(text);
        let rect = projector
            .project(&rule, Some("abcde"), 10.0, Size::new(1000, 1000), Viewport::default())
            .unwrap();
        assert!((rect.width - 30.0).abs() < 1e-9);
        assert!((rect.height - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_stale_geometry_yields_nothing() {
        let rules = RuleSet::new("p", 500, 900)
            .with_layer(Layer::text("title", TextRule::new("title", FontSize::Px(32.0))));
        let projector = Projector::default();
        let overlays = projector.project_all(
            &rules,
            &FieldBindings::default(),
            Size::new(500, 900),
            Size::new(1080, 1920),
            Viewport::default(),
        );
        assert!(overlays.is_empty());
    }

    #[test]
    fn test_viewport_transform() {
        let image = ImageRule::new(100.0, 100.0);
        let rect = Projector::default()
            .project(
                &LayerRule::Image(image),
                None,
                32.0,
                Size::new(500, 500),
                Viewport { scale: 0.5, offset: (8.0, 4.0) },
            )
            .unwrap();
        assert_eq!(rect, Rect { left: 8.0, top: 4.0, width: 50.0, height: 50.0 });
    }
}
