// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Style descriptors and their resolved render form.
//!
//! Callers describe a marker with [`StyleOptions`] (an icon or a vector shape plus
//! optional text and badge). The engines resolve that into a [`Style`], which is what
//! a renderer consumes. Resolution results are memoised in a [`StyleCache`].
//!
//! The cache is keyed by the *identity* of the `Arc<StyleOptions>` handed in, not by
//! its contents. Sharing one `Arc` across many markers shares one resolved style;
//! two distinct `Arc`s with identical contents resolve twice.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

/// RGBA colour, straight (non-premultiplied) alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const BLACK: Color = Color::rgb(0, 0, 0);

    #[must_use]
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    #[must_use]
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    #[must_use]
    pub const fn with_alpha(self, a: u8) -> Self {
        Self { a, ..self }
    }

    /// Parse `#rgb`, `#rrggbb` or `#rrggbbaa`.
    #[must_use]
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#')?;
        let nibble = |i: usize| u8::from_str_radix(digits.get(i..=i)?, 16).ok();
        let byte = |i: usize| u8::from_str_radix(digits.get(i..i + 2)?, 16).ok();
        match digits.len() {
            3 => Some(Self::rgb(nibble(0)? * 17, nibble(1)? * 17, nibble(2)? * 17)),
            6 => Some(Self::rgb(byte(0)?, byte(2)?, byte(4)?)),
            8 => Some(Self::rgba(byte(0)?, byte(2)?, byte(4)?, byte(6)?)),
            _ => None,
        }
    }

    /// Linear interpolation between two colours, `t` in `[0, 1]`.
    #[must_use]
    pub fn lerp(self, other: Color, t: f64) -> Color {
        let t = t.clamp(0.0, 1.0);
        let mix = |a: u8, b: u8| (f64::from(a) + (f64::from(b) - f64::from(a)) * t).round() as u8;
        Color::rgba(
            mix(self.r, other.r),
            mix(self.g, other.g),
            mix(self.b, other.b),
            mix(self.a, other.a),
        )
    }
}

/// Area fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Fill {
    Solid(Color),
    /// Radial gradient from the shape centre outwards; stops are `(offset, colour)`.
    RadialGradient(Vec<(f64, Color)>),
}

impl Fill {
    #[must_use]
    pub fn is_transparent(&self) -> bool {
        match self {
            Fill::Solid(c) => c.a == 0,
            Fill::RadialGradient(stops) => stops.iter().all(|(_, c)| c.a == 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub color: Color,
    pub width: f64,
    #[serde(default)]
    pub dash: Option<Vec<f64>>,
}

impl Stroke {
    #[must_use]
    pub fn new(color: Color, width: f64) -> Self {
        Self {
            color,
            width,
            dash: None,
        }
    }
}

/// Point symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Image {
    Circle {
        radius: f64,
        fill: Option<Fill>,
        stroke: Option<Stroke>,
    },
    /// Regular polygon or star with `points` corners.
    RegularShape {
        points: u32,
        radius: f64,
        rotation: f64,
        fill: Option<Fill>,
        stroke: Option<Stroke>,
    },
    Icon {
        src: String,
        scale: f64,
        rotation: f64,
        anchor: [f64; 2],
        opacity: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text {
    pub text: String,
    pub font: String,
    pub fill: Color,
    pub stroke: Option<Stroke>,
    pub offset: [f64; 2],
    pub background: Option<Color>,
}

/// A resolved, renderable style.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Style {
    pub image: Option<Image>,
    pub fill: Option<Fill>,
    pub stroke: Option<Stroke>,
    pub text: Option<Text>,
    pub z_index: Option<i32>,
}

impl Style {
    /// Fully transparent style used to hide features without removing them.
    #[must_use]
    pub fn invisible() -> Self {
        Self {
            image: Some(Image::Circle {
                radius: 0.0,
                fill: Some(Fill::Solid(Color::TRANSPARENT)),
                stroke: Some(Stroke::new(Color::TRANSPARENT, 0.0)),
            }),
            fill: Some(Fill::Solid(Color::TRANSPARENT)),
            stroke: Some(Stroke::new(Color::TRANSPARENT, 0.0)),
            text: None,
            z_index: None,
        }
    }

    #[must_use]
    pub fn is_invisible(&self) -> bool {
        *self == Self::invisible()
    }

    /// Plain line style.
    #[must_use]
    pub fn line(color: Color, width: f64) -> Self {
        Self {
            stroke: Some(Stroke::new(color, width)),
            ..Self::default()
        }
    }

    /// Filled circle point style.
    #[must_use]
    pub fn circle(radius: f64, fill: Color, stroke: Option<Stroke>) -> Self {
        Self {
            image: Some(Image::Circle {
                radius,
                fill: Some(Fill::Solid(fill)),
                stroke,
            }),
            ..Self::default()
        }
    }
}

/// Vector shape descriptor for a marker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShapeOptions {
    /// Number of corners; `None` or fewer than 3 draws a circle.
    pub points: Option<u32>,
    pub radius: Option<f64>,
    pub rotation: Option<f64>,
    pub fill_color: Option<Color>,
    pub stroke_color: Option<Color>,
    pub stroke_width: Option<f64>,
}

/// Raster icon descriptor for a marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IconOptions {
    pub src: String,
    pub scale: Option<f64>,
    pub rotation: Option<f64>,
    pub anchor: Option<[f64; 2]>,
    pub opacity: Option<f64>,
}

/// Label drawn next to a marker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TextOptions {
    pub text: String,
    pub font: Option<String>,
    pub color: Option<Color>,
    pub outline_color: Option<Color>,
    pub offset: Option<[f64; 2]>,
    pub background: Option<Color>,
}

/// Caller-facing marker style description.
///
/// Every field is optional so a partial value can be merged onto a stored one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StyleOptions {
    pub icon: Option<IconOptions>,
    pub shape: Option<ShapeOptions>,
    pub text: Option<TextOptions>,
    /// Short badge (e.g. a count) drawn above the symbol. Only drawn when `text` is unset.
    pub badge: Option<String>,
    pub z_index: Option<i32>,
}

const DEFAULT_RADIUS: f64 = 6.0;
const DEFAULT_FILL: Color = Color::rgb(51, 153, 204);
const DEFAULT_FONT: &str = "12px sans-serif";
const BADGE_FONT: &str = "bold 10px sans-serif";

impl StyleOptions {
    /// Overlay `patch` onto `self`; fields present in `patch` win.
    pub fn merge(&mut self, patch: &StyleOptions) {
        if patch.icon.is_some() {
            self.icon.clone_from(&patch.icon);
            self.shape = None;
        }
        if let Some(shape) = &patch.shape {
            let base = self.shape.get_or_insert_with(ShapeOptions::default);
            base.points = shape.points.or(base.points);
            base.radius = shape.radius.or(base.radius);
            base.rotation = shape.rotation.or(base.rotation);
            base.fill_color = shape.fill_color.or(base.fill_color);
            base.stroke_color = shape.stroke_color.or(base.stroke_color);
            base.stroke_width = shape.stroke_width.or(base.stroke_width);
            self.icon = None;
        }
        if patch.text.is_some() {
            self.text.clone_from(&patch.text);
        }
        if patch.badge.is_some() {
            self.badge.clone_from(&patch.badge);
        }
        if patch.z_index.is_some() {
            self.z_index = patch.z_index;
        }
    }

    /// Resolve into a renderable style. Missing symbol data falls back to a circle.
    ///
    /// A style carries one text slot: `text` wins over `badge` when both are set.
    #[must_use]
    pub fn resolve(&self) -> Style {
        let image = if let Some(icon) = &self.icon {
            Image::Icon {
                src: icon.src.clone(),
                scale: icon.scale.unwrap_or(1.0),
                rotation: icon.rotation.unwrap_or(0.0),
                anchor: icon.anchor.unwrap_or([0.5, 0.5]),
                opacity: icon.opacity.unwrap_or(1.0),
            }
        } else {
            let shape = self.shape.clone().unwrap_or_default();
            let fill = Some(Fill::Solid(shape.fill_color.unwrap_or(DEFAULT_FILL)));
            let stroke = Some(Stroke::new(
                shape.stroke_color.unwrap_or(Color::WHITE),
                shape.stroke_width.unwrap_or(1.5),
            ));
            let radius = shape.radius.unwrap_or(DEFAULT_RADIUS);
            match shape.points {
                Some(points) if points >= 3 => Image::RegularShape {
                    points,
                    radius,
                    rotation: shape.rotation.unwrap_or(0.0),
                    fill,
                    stroke,
                },
                _ => Image::Circle { radius, fill, stroke },
            }
        };

        let text = match (&self.text, &self.badge) {
            (Some(t), _) => Some(Text {
                text: t.text.clone(),
                font: t.font.clone().unwrap_or_else(|| DEFAULT_FONT.to_string()),
                fill: t.color.unwrap_or(Color::BLACK),
                stroke: t.outline_color.map(|c| Stroke::new(c, 2.0)),
                offset: t.offset.unwrap_or([0.0, -15.0]),
                background: t.background,
            }),
            (None, Some(badge)) => Some(Text {
                text: badge.clone(),
                font: BADGE_FONT.to_string(),
                fill: Color::WHITE,
                stroke: None,
                offset: [10.0, -10.0],
                background: Some(Color::rgb(220, 53, 69)),
            }),
            (None, None) => None,
        };

        Style {
            image: Some(image),
            fill: None,
            stroke: None,
            text,
            z_index: self.z_index,
        }
    }
}

struct CacheEntry {
    owner: Weak<StyleOptions>,
    style: Arc<Style>,
}

/// Resolved-style cache keyed by `Arc<StyleOptions>` identity.
///
/// The key is the allocation address; the stored `Weak` guards against a freed
/// allocation being reused by an unrelated `Arc` at the same address.
#[derive(Default)]
pub struct StyleCache {
    entries: HashMap<usize, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl std::fmt::Debug for StyleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StyleCache")
            .field("entries", &self.entries.len())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

impl StyleCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `options`, reusing the cached style when the same `Arc` was seen before.
    pub fn resolve(&mut self, options: &Arc<StyleOptions>) -> Arc<Style> {
        let key = Arc::as_ptr(options) as usize;
        if let Some(entry) = self.entries.get(&key) {
            if entry
                .owner
                .upgrade()
                .is_some_and(|owner| Arc::ptr_eq(&owner, options))
            {
                self.hits += 1;
                return Arc::clone(&entry.style);
            }
        }

        self.misses += 1;
        let style = Arc::new(options.resolve());
        self.entries.insert(
            key,
            CacheEntry {
                owner: Arc::downgrade(options),
                style: Arc::clone(&style),
            },
        );
        style
    }

    /// Drop entries whose option objects have been freed.
    pub fn prune(&mut self) {
        self.entries.retain(|_, entry| entry.owner.strong_count() > 0);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits = 0;
        self.misses = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since creation or the last clear.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_from_hex() {
        assert_eq!(Color::from_hex("#f00"), Some(Color::rgb(255, 0, 0)));
        assert_eq!(Color::from_hex("#00ff00"), Some(Color::rgb(0, 255, 0)));
        assert_eq!(Color::from_hex("#0000ff80"), Some(Color::rgba(0, 0, 255, 128)));
        assert_eq!(Color::from_hex("red"), None);
        assert_eq!(Color::from_hex("#12"), None);
    }

    #[test]
    fn test_cache_hits_on_same_arc() {
        let mut cache = StyleCache::new();
        let opts = Arc::new(StyleOptions::default());
        let a = cache.resolve(&opts);
        let b = cache.resolve(&opts);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_cache_misses_on_equal_but_distinct_arc() {
        let mut cache = StyleCache::new();
        let first = Arc::new(StyleOptions::default());
        let second = Arc::new(StyleOptions::default());
        cache.resolve(&first);
        cache.resolve(&second);
        assert_eq!(cache.stats(), (0, 2));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_prune_drops_dead_entries() {
        let mut cache = StyleCache::new();
        {
            let opts = Arc::new(StyleOptions::default());
            cache.resolve(&opts);
        }
        cache.prune();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_merge_keeps_unset_shape_fields() {
        let mut base = StyleOptions {
            shape: Some(ShapeOptions {
                radius: Some(8.0),
                fill_color: Some(Color::rgb(1, 2, 3)),
                ..ShapeOptions::default()
            }),
            ..StyleOptions::default()
        };
        base.merge(&StyleOptions {
            shape: Some(ShapeOptions {
                radius: Some(12.0),
                ..ShapeOptions::default()
            }),
            ..StyleOptions::default()
        });
        let shape = base.shape.unwrap();
        assert_eq!(shape.radius, Some(12.0));
        assert_eq!(shape.fill_color, Some(Color::rgb(1, 2, 3)));
    }

    #[test]
    fn test_resolve_regular_shape_and_badge() {
        let opts = StyleOptions {
            shape: Some(ShapeOptions {
                points: Some(3),
                ..ShapeOptions::default()
            }),
            badge: Some("7".to_string()),
            ..StyleOptions::default()
        };
        let style = opts.resolve();
        assert!(matches!(style.image, Some(Image::RegularShape { points: 3, .. })));
        assert_eq!(style.text.unwrap().text, "7");
    }

    #[test]
    fn test_text_takes_precedence_over_badge() {
        let opts = StyleOptions {
            text: Some(TextOptions {
                text: "Ningbo".to_string(),
                ..TextOptions::default()
            }),
            badge: Some("3".to_string()),
            ..StyleOptions::default()
        };
        let text = opts.resolve().text.unwrap();
        assert_eq!(text.text, "Ningbo");
        assert_eq!(text.background, None);
    }

    #[test]
    fn test_invisible_style_is_transparent() {
        let style = Style::invisible();
        assert!(style.is_invisible());
        match style.image {
            Some(Image::Circle { radius, fill, .. }) => {
                assert!(radius.abs() < f64::EPSILON);
                assert!(fill.unwrap().is_transparent());
            }
            other => panic!("unexpected image {other:?}"),
        }
    }
}
