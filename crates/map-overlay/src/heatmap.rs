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

//! Weighted density layer.
//!
//! The heatmap is independent of the marker engine: it owns one layer on the
//! surface and a weighted point collection that is always replaced wholesale.
//! [`HeatmapEngine::rasterize`] turns the points inside the current view into a
//! normalised, colourised density grid.

use geojson::{FeatureCollection, GeoJson};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OverlayError, Result};
use crate::feature::{Feature, Geometry};
use crate::geo::LonLat;
use crate::layer::{LayerKind, VectorLayer};
use crate::style::Color;
use crate::surface::{read_surface, write_surface, SharedSurface};

/// Canonical weight property on heat features.
pub const WEIGHT_PROPERTY: &str = "weight";

/// One weighted sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatPoint {
    pub coordinate: LonLat,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl HeatPoint {
    #[must_use]
    pub fn new(coordinate: impl Into<LonLat>) -> Self {
        Self {
            coordinate: coordinate.into(),
            weight: default_weight(),
        }
    }

    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Appearance of the heat layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapOptions {
    pub title: String,
    pub visible: bool,
    pub z_index: i32,
    /// Full-intensity radius around each point, in pixels.
    pub radius: f64,
    /// Fade-out distance beyond the radius, in pixels.
    pub blur: f64,
    /// Colour stops from lowest to highest density.
    pub gradient: Vec<Color>,
}

impl Default for HeatmapOptions {
    fn default() -> Self {
        Self {
            title: "Heatmap".to_string(),
            visible: true,
            z_index: 0,
            radius: 8.0,
            blur: 15.0,
            gradient: vec![
                Color::rgb(0, 0, 255),
                Color::rgb(0, 255, 255),
                Color::rgb(0, 255, 0),
                Color::rgb(255, 255, 0),
                Color::rgb(255, 0, 0),
            ],
        }
    }
}

/// Read a weight that may be a JSON number or a numeric string.
fn parse_weight(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|w| w.is_finite()).unwrap_or(1.0)
}

/// Colour at `t` in `[0, 1]` along evenly spaced `stops`.
#[must_use]
pub fn sample_gradient(stops: &[Color], t: f64) -> Color {
    match stops {
        [] => Color::TRANSPARENT,
        [only] => *only,
        _ => {
            let scaled = t.clamp(0.0, 1.0) * (stops.len() - 1) as f64;
            let lower = (scaled.floor() as usize).min(stops.len() - 2);
            stops[lower].lerp(stops[lower + 1], scaled - lower as f64)
        }
    }
}

/// Rendered density surface.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityGrid {
    pub width: usize,
    pub height: usize,
    /// Row-major intensities normalised to `[0, 1]`.
    pub values: Vec<f64>,
    /// Row-major colours; alpha follows intensity.
    pub colors: Vec<Color>,
}

impl DensityGrid {
    #[must_use]
    pub fn value(&self, x: usize, y: usize) -> Option<f64> {
        (x < self.width && y < self.height).then(|| self.values[y * self.width + x])
    }

    #[must_use]
    pub fn color(&self, x: usize, y: usize) -> Option<Color> {
        (x < self.width && y < self.height).then(|| self.colors[y * self.width + x])
    }

    /// Cell with the highest intensity, `(x, y)`.
    #[must_use]
    pub fn peak(&self) -> Option<(usize, usize)> {
        let (index, value) = self
            .values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))?;
        (*value > 0.0).then_some((index % self.width, index / self.width))
    }
}

#[derive(Debug, Default)]
pub struct HeatmapEngine {
    surface: Option<SharedSurface>,
    layer: Option<VectorLayer>,
    options: HeatmapOptions,
    points: Vec<HeatPoint>,
}

impl HeatmapEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the heat layer on `surface`. A second call only applies `options`.
    pub fn init(&mut self, surface: SharedSurface, options: HeatmapOptions) {
        if self.layer.is_some() {
            debug!("Heatmap already initialized, applying options");
            self.options = options;
            self.push_appearance();
            self.set_map(surface);
            return;
        }

        let mut layer = VectorLayer::new(options.title.clone(), LayerKind::Heatmap, options.z_index);
        layer.visible = options.visible;
        write_surface(&surface, |s| s.add_layer(&layer.info()));
        info!("Heatmap layer '{}' created", options.title);

        self.layer = Some(layer);
        self.options = options;
        self.surface = Some(surface);
        self.rebuild_features();
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.layer.is_some()
    }

    /// Replace every point (clear, then bulk add).
    pub fn set_data(&mut self, points: Vec<HeatPoint>) {
        self.points = points;
        self.rebuild_features();
        debug!("Heatmap data replaced with {} points", self.points.len());
    }

    /// Replace every point from a GeoJSON `FeatureCollection` string.
    ///
    /// `weight_property` names the attribute holding the weight; missing or
    /// non-numeric weights count as 1. Non-point features are skipped.
    pub fn set_geojson(&mut self, input: &str, weight_property: &str) -> Result<usize> {
        match input.parse::<GeoJson>()? {
            GeoJson::FeatureCollection(collection) => Ok(self.set_feature_collection(collection, weight_property)),
            _ => Err(OverlayError::NotAFeatureCollection),
        }
    }

    /// Replace every point from an already parsed collection.
    pub fn set_feature_collection(&mut self, collection: FeatureCollection, weight_property: &str) -> usize {
        let mut skipped = 0usize;
        let points: Vec<HeatPoint> = collection
            .features
            .into_iter()
            .filter_map(|feature| {
                let point = match feature.geometry.map(|g| g.value) {
                    Some(geojson::Value::Point(coords)) if coords.len() >= 2 => LonLat::new(coords[0], coords[1]),
                    _ => {
                        skipped += 1;
                        return None;
                    }
                };
                let weight = parse_weight(feature.properties.as_ref().and_then(|p| p.get(weight_property)));
                Some(HeatPoint::new(point).with_weight(weight))
            })
            .collect();
        if skipped > 0 {
            debug!("Skipped {skipped} non-point heatmap features");
        }
        let count = points.len();
        self.set_data(points);
        count
    }

    pub fn set_radius(&mut self, radius: f64) {
        self.options.radius = radius.max(0.0);
    }

    pub fn set_blur(&mut self, blur: f64) {
        self.options.blur = blur.max(0.0);
    }

    /// Replace the colour stops. An empty gradient is rejected.
    pub fn set_gradient(&mut self, gradient: Vec<Color>) -> bool {
        if gradient.is_empty() {
            warn!("Ignoring empty heatmap gradient");
            return false;
        }
        self.options.gradient = gradient;
        true
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.options.visible = visible;
        self.push_appearance();
    }

    pub fn set_z_index(&mut self, z_index: i32) {
        self.options.z_index = z_index;
        self.push_appearance();
    }

    fn push_appearance(&mut self) {
        let Some(layer) = self.layer.as_mut() else {
            return;
        };
        layer.visible = self.options.visible;
        layer.z_index = self.options.z_index;
        if let Some(surface) = &self.surface {
            let (id, visible, z_index) = (layer.id, layer.visible, layer.z_index);
            write_surface(surface, |s| {
                s.set_layer_visible(id, visible);
                s.set_layer_z_index(id, z_index);
            });
        }
    }

    /// Move the layer to a replacement surface, keeping the data.
    pub fn set_map(&mut self, surface: SharedSurface) {
        let Some(layer) = &self.layer else {
            self.surface = Some(surface);
            return;
        };
        if let Some(old) = self.surface.take() {
            write_surface(&old, |s| s.remove_layer(layer.id));
        }
        write_surface(&surface, |s| s.add_layer(&layer.info()));
        self.surface = Some(surface);
        self.rebuild_features();
        info!("Heatmap moved to a new surface");
    }

    fn rebuild_features(&mut self) {
        let (Some(layer), Some(surface)) = (self.layer.as_mut(), &self.surface) else {
            return;
        };
        let points = &self.points;
        let Some(features) = read_surface(surface, |s| {
            points
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    Feature::new(format!("heat:{i}"), Geometry::Point(s.project(p.coordinate)))
                        .with_property(WEIGHT_PROPERTY, p.weight)
                })
                .collect::<Vec<_>>()
        }) else {
            return;
        };
        layer.source.clear();
        layer.source.add_features(features);
    }

    /// Render the current view into a `width` x `height` density grid.
    ///
    /// Each point contributes its weight at full strength within `radius` pixels
    /// and fades linearly to zero over the next `blur` pixels. Returns `None`
    /// without a surface or for an empty grid.
    #[must_use]
    pub fn rasterize(&self, width: usize, height: usize) -> Option<DensityGrid> {
        if width == 0 || height == 0 {
            return None;
        }
        let surface = self.surface.as_ref()?;
        let layer = self.layer.as_ref()?;
        let view = read_surface(surface, |s| s.view())?;

        let scale = width as f64 / view.size[0].max(1.0);
        let core = self.options.radius * scale;
        let fade = self.options.blur * scale;
        let reach = core + fade;

        let mut values = vec![0.0f64; width * height];
        for feature in layer.source.features() {
            let Some(position) = feature.geometry.as_point() else {
                continue;
            };
            let weight = parse_weight(feature.properties.get(WEIGHT_PROPERTY));
            let [px, py] = view.to_pixel(position);
            let (cx, cy) = (px * scale, py * scale);
            if cx + reach < 0.0 || cy + reach < 0.0 || cx - reach >= width as f64 || cy - reach >= height as f64 {
                continue;
            }

            let x0 = (cx - reach).floor().max(0.0) as usize;
            let y0 = (cy - reach).floor().max(0.0) as usize;
            let x1 = ((cx + reach).ceil() as usize).min(width - 1);
            let y1 = ((cy + reach).ceil() as usize).min(height - 1);
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let dx = x as f64 + 0.5 - cx;
                    let dy = y as f64 + 0.5 - cy;
                    let d = dx.hypot(dy);
                    let falloff = if d <= core {
                        1.0
                    } else if d < reach && fade > 0.0 {
                        1.0 - (d - core) / fade
                    } else {
                        0.0
                    };
                    values[y * width + x] += weight * falloff;
                }
            }
        }

        let max = values.iter().copied().fold(0.0f64, f64::max);
        if max > 0.0 {
            for v in &mut values {
                *v = (*v / max).max(0.0);
            }
        }
        let colors = values
            .iter()
            .map(|&v| {
                if v <= 0.0 {
                    Color::TRANSPARENT
                } else {
                    sample_gradient(&self.options.gradient, v).with_alpha((v * 255.0).round() as u8)
                }
            })
            .collect();

        Some(DensityGrid {
            width,
            height,
            values,
            colors,
        })
    }

    /// Drop every point but keep the layer.
    pub fn clear(&mut self) {
        self.points.clear();
        if let Some(layer) = self.layer.as_mut() {
            layer.source.clear();
        }
    }

    /// Detach the layer and forget all state. Safe to repeat.
    pub fn destroy(&mut self) {
        if let (Some(layer), Some(surface)) = (self.layer.take(), self.surface.take()) {
            write_surface(&surface, |s| s.remove_layer(layer.id));
            info!("Heatmap layer '{}' destroyed", layer.name);
        }
        self.layer = None;
        self.surface = None;
        self.points.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn points(&self) -> &[HeatPoint] {
        &self.points
    }

    #[must_use]
    pub fn options(&self) -> &HeatmapOptions {
        &self.options
    }

    #[must_use]
    pub fn layer(&self) -> Option<&VectorLayer> {
        self.layer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::MemorySurface;

    const SAMPLE: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "geometry": {"type": "Point", "coordinates": [121.0, 29.0]}, "properties": {"mag": 2}},
            {"type": "Feature", "geometry": {"type": "Point", "coordinates": [121.1, 29.1]}, "properties": {"mag": "3.5"}},
            {"type": "Feature", "geometry": {"type": "Point", "coordinates": [121.2, 29.2]}, "properties": {"mag": "n/a"}},
            {"type": "Feature", "geometry": {"type": "Point", "coordinates": [121.3, 29.3]}, "properties": null},
            {"type": "Feature", "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0]]}, "properties": {}}
        ]
    }"#;

    fn engine() -> (HeatmapEngine, std::sync::Arc<std::sync::RwLock<MemorySurface>>) {
        let memory = MemorySurface::new(LonLat::new(121.0, 29.0), 10.0, [800.0, 600.0]).shared();
        let mut heat = HeatmapEngine::new();
        heat.init(memory.clone(), HeatmapOptions::default());
        (heat, memory)
    }

    #[test]
    fn test_defaults() {
        let options = HeatmapOptions::default();
        assert!((options.radius - 8.0).abs() < f64::EPSILON);
        assert!((options.blur - 15.0).abs() < f64::EPSILON);
        assert_eq!(options.gradient.first(), Some(&Color::from_hex("#00f").unwrap()));
        assert_eq!(options.gradient.last(), Some(&Color::from_hex("#f00").unwrap()));
        assert_eq!(options.z_index, 0);
        assert!(options.visible);
    }

    #[test]
    fn test_init_creates_single_layer() {
        let (mut heat, memory) = engine();
        assert_eq!(memory.read().unwrap().layer_count(), 1);
        heat.init(memory.clone(), HeatmapOptions::default());
        assert_eq!(memory.read().unwrap().layer_count(), 1);
    }

    #[test]
    fn test_set_data_replaces() {
        let (mut heat, _memory) = engine();
        heat.set_data(vec![HeatPoint::new([121.0, 29.0]), HeatPoint::new([121.1, 29.0])]);
        heat.set_data(vec![HeatPoint::new([121.0, 29.0]).with_weight(4.0)]);
        assert_eq!(heat.len(), 1);
        assert_eq!(heat.layer().unwrap().source.len(), 1);
        let point: HeatPoint = serde_json::from_str(r#"{"coordinate": {"lon": 1.0, "lat": 2.0}}"#).unwrap();
        assert!((point.weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_set_geojson_normalises_weights() {
        let (mut heat, _memory) = engine();
        assert_eq!(heat.set_geojson(SAMPLE, "mag").unwrap(), 4);
        let weights: Vec<f64> = heat.points().iter().map(|p| p.weight).collect();
        assert_eq!(weights, vec![2.0, 3.5, 1.0, 1.0]);
        let feature = &heat.layer().unwrap().source.features()[1];
        assert_eq!(feature.properties[WEIGHT_PROPERTY], Value::from(3.5));
    }

    #[test]
    fn test_set_geojson_rejects_other_documents() {
        let (mut heat, _memory) = engine();
        let single = r#"{"type": "Feature", "geometry": {"type": "Point", "coordinates": [0.0, 0.0]}, "properties": {}}"#;
        assert!(matches!(heat.set_geojson(single, "w"), Err(OverlayError::NotAFeatureCollection)));
        assert!(matches!(heat.set_geojson("{not json", "w"), Err(OverlayError::GeoJson(_))));
    }

    #[test]
    fn test_appearance_setters_keep_data() {
        let (mut heat, memory) = engine();
        heat.set_data(vec![HeatPoint::new([121.0, 29.0])]);
        let id = heat.layer().unwrap().id;

        heat.set_visible(false);
        heat.set_z_index(7);
        heat.set_radius(12.0);
        assert!(!heat.set_gradient(Vec::new()));
        assert!(heat.set_gradient(vec![Color::BLACK, Color::WHITE]));

        let surface = memory.read().unwrap();
        let info = surface.layer(id).unwrap();
        assert!(!info.visible);
        assert_eq!(info.z_index, 7);
        assert_eq!(heat.len(), 1);
        assert!((heat.options().radius - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_set_map_moves_layer() {
        let (mut heat, old) = engine();
        heat.set_data(vec![HeatPoint::new([121.0, 29.0])]);
        let id = heat.layer().unwrap().id;

        let new = MemorySurface::default().shared();
        heat.set_map(new.clone());
        assert!(!old.read().unwrap().has_layer(id));
        assert!(new.read().unwrap().has_layer(id));
        assert_eq!(heat.len(), 1);
    }

    #[test]
    fn test_gradient_sampling() {
        let stops = HeatmapOptions::default().gradient;
        assert_eq!(sample_gradient(&stops, 0.0), stops[0]);
        assert_eq!(sample_gradient(&stops, 1.0), stops[4]);
        assert_eq!(sample_gradient(&stops, 0.5), stops[2]);
        assert_eq!(sample_gradient(&[], 0.5), Color::TRANSPARENT);
    }

    #[test]
    fn test_rasterize_peaks_at_point() {
        let (mut heat, _memory) = engine();
        heat.set_data(vec![HeatPoint::new([121.0, 29.0])]);
        let grid = heat.rasterize(80, 60).unwrap();

        assert_eq!(grid.peak(), Some((40, 30)));
        assert!((grid.value(40, 30).unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(grid.value(0, 0), Some(0.0));
        assert_eq!(grid.color(0, 0), Some(Color::TRANSPARENT));
        assert_eq!(grid.color(40, 30), Some(Color::rgb(255, 0, 0)));
        assert_eq!(grid.value(80, 0), None);
    }

    #[test]
    fn test_rasterize_weights_dominate() {
        let (mut heat, _memory) = engine();
        heat.set_data(vec![
            HeatPoint::new([120.8, 29.0]).with_weight(1.0),
            HeatPoint::new([121.2, 29.0]).with_weight(5.0),
        ]);
        let grid = heat.rasterize(800, 600).unwrap();
        let (x, _) = grid.peak().unwrap();
        assert!(x > 400);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (mut heat, memory) = engine();
        heat.set_data(vec![HeatPoint::new([121.0, 29.0])]);
        heat.destroy();
        heat.destroy();
        assert!(!heat.is_initialized());
        assert!(heat.is_empty());
        assert_eq!(memory.read().unwrap().layer_count(), 0);
        assert!(heat.rasterize(10, 10).is_none());
        HeatmapEngine::new().destroy();
    }
}
