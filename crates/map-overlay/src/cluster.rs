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

//! Distance-based point clustering per marker type.
//!
//! Each clustered type gets one cluster layer fed from a snapshot of that type's
//! markers. The snapshot is not live: after changing the underlying markers the
//! caller must hand a fresh snapshot to [`ClusterEngine::update_cluster_layer`].
//! [`MarkerEngine`](crate::MarkerEngine) does so on its next frame for every
//! clustered type it touched.
//!
//! Clustering is greedy in input order. For every point not yet claimed, all
//! unclaimed points within `distance` pixels (a square search window) join its
//! cluster. The cluster is drawn between the members' centroid and the seed point,
//! weighted by `min_distance / distance`, which keeps bubbles apart on screen.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::feature::{Feature, Geometry};
use crate::geo::{Extent, Point};
use crate::layer::{LayerKind, VectorLayer};
use crate::style::{Color, Fill, Image, Stroke, Style, Text};
use crate::surface::{write_surface, SharedSurface};

pub const DEFAULT_CLUSTER_DISTANCE: f64 = 40.0;
pub const DEFAULT_CLUSTER_MIN_DISTANCE: f64 = 20.0;

const MIN_BUBBLE_RADIUS: f64 = 15.0;
const MAX_BUBBLE_RADIUS: f64 = 30.0;

/// Per-type clustering parameters, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterOptions {
    pub distance: f64,
    pub min_distance: f64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            distance: DEFAULT_CLUSTER_DISTANCE,
            min_distance: DEFAULT_CLUSTER_MIN_DISTANCE,
        }
    }
}

impl ClusterOptions {
    fn interpolation_ratio(&self) -> f64 {
        if self.min_distance <= 0.0 || self.distance <= 0.0 {
            0.0
        } else {
            self.min_distance.min(self.distance) / self.distance
        }
    }
}

/// One raw point handed to the cluster engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterPoint {
    pub id: String,
    pub position: Point,
    /// Style used when the point ends up alone in its cluster.
    pub style: Option<Arc<Style>>,
}

/// A computed cluster: where it is drawn and which points it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub center: Point,
    /// Indices into the snapshot the cluster was computed from.
    pub members: Vec<usize>,
}

impl Cluster {
    #[must_use]
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// Counts reported by [`ClusterEngine::get_cluster_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Raw points in the cluster source.
    pub total_features: usize,
    /// Clusters holding more than one point.
    pub cluster_count: usize,
}

type CellKey = (i64, i64);

/// Cluster `points` at `resolution` projected units per pixel.
#[must_use]
pub fn cluster_points(points: &[ClusterPoint], options: &ClusterOptions, resolution: f64) -> Vec<Cluster> {
    let map_distance = options.distance * resolution;
    if map_distance.is_nan() || map_distance <= 0.0 {
        return points
            .iter()
            .enumerate()
            .map(|(i, p)| Cluster {
                center: p.position,
                members: vec![i],
            })
            .collect();
    }

    let cell_of = |p: Point| -> CellKey {
        (
            (p.x / map_distance).floor() as i64,
            (p.y / map_distance).floor() as i64,
        )
    };

    let mut grid: HashMap<CellKey, Vec<usize>> = HashMap::new();
    for (i, p) in points.iter().enumerate() {
        grid.entry(cell_of(p.position)).or_default().push(i);
    }

    let ratio = options.interpolation_ratio();
    let mut claimed = vec![false; points.len()];
    let mut clusters = Vec::new();

    for (i, seed) in points.iter().enumerate() {
        if claimed[i] {
            continue;
        }
        let search = Extent::from_point(seed.position).buffer(map_distance);
        let (min_cx, min_cy) = cell_of(Point::new(search.min_x, search.min_y));
        let (max_cx, max_cy) = cell_of(Point::new(search.max_x, search.max_y));

        let mut members = Vec::new();
        for cx in min_cx..=max_cx {
            for cy in min_cy..=max_cy {
                let Some(cell) = grid.get(&(cx, cy)) else {
                    continue;
                };
                for &j in cell {
                    if !claimed[j] && search.contains(points[j].position) {
                        claimed[j] = true;
                        members.push(j);
                    }
                }
            }
        }
        members.sort_unstable();

        let n = members.len() as f64;
        let (sum_x, sum_y) = members.iter().fold((0.0, 0.0), |(x, y), &j| {
            (x + points[j].position.x, y + points[j].position.y)
        });
        let centroid = Point::new(sum_x / n, sum_y / n);
        let anchor = search.center();
        let center = Point::new(
            centroid.x * (1.0 - ratio) + anchor.x * ratio,
            centroid.y * (1.0 - ratio) + anchor.y * ratio,
        );
        clusters.push(Cluster { center, members });
    }

    clusters
}

/// Fill colour tier for a cluster of `count` points.
#[must_use]
pub fn tier_color(count: usize) -> Color {
    match count {
        0..=5 => Color::rgb(76, 175, 80),
        6..=10 => Color::rgb(255, 193, 7),
        11..=20 => Color::rgb(255, 152, 0),
        _ => Color::rgb(244, 67, 54),
    }
}

/// Bubble radius in pixels for a cluster of `count` points.
#[must_use]
pub fn bubble_radius(count: usize) -> f64 {
    (10.0 + 2.0 * (count as f64).sqrt()).clamp(MIN_BUBBLE_RADIUS, MAX_BUBBLE_RADIUS)
}

fn bubble_style(count: usize) -> Style {
    let color = tier_color(count);
    Style {
        image: Some(Image::Circle {
            radius: bubble_radius(count),
            fill: Some(Fill::RadialGradient(vec![
                (0.0, color.with_alpha(230)),
                (1.0, color.with_alpha(70)),
            ])),
            stroke: Some(Stroke::new(Color::WHITE.with_alpha(200), 2.0)),
        }),
        text: Some(Text {
            text: count.to_string(),
            font: "bold 12px sans-serif".to_string(),
            fill: Color::WHITE,
            stroke: Some(Stroke::new(Color::BLACK.with_alpha(160), 2.0)),
            offset: [0.0, 0.0],
            background: None,
        }),
        ..Style::default()
    }
}

#[derive(Debug)]
struct ClusterLayer {
    layer: VectorLayer,
    points: Vec<ClusterPoint>,
    options: ClusterOptions,
    resolution: Option<f64>,
    dirty: bool,
    clusters: Vec<Cluster>,
}

/// Owns one cluster layer per marker type.
#[derive(Debug, Default)]
pub struct ClusterEngine {
    surface: Option<SharedSurface>,
    layers: HashMap<String, ClusterLayer>,
    bubble_styles: HashMap<usize, Arc<Style>>,
}

impl ClusterEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to a surface; existing cluster layers are attached to it.
    pub fn init(&mut self, surface: SharedSurface) {
        for entry in self.layers.values() {
            write_surface(&surface, |s| s.add_layer(&entry.layer.info()));
        }
        self.surface = Some(surface);
    }

    /// Create (or refresh) the cluster layer for `type_name`.
    ///
    /// Re-enabling an already clustered type replaces its snapshot and options
    /// without creating a second layer. Returns `false` when no surface is bound.
    pub fn enable(&mut self, type_name: &str, points: Vec<ClusterPoint>, options: ClusterOptions, z_index: i32) -> bool {
        let Some(surface) = self.surface.clone() else {
            warn!("Cannot enable clustering for '{type_name}': map surface is not initialized");
            return false;
        };

        if let Some(entry) = self.layers.get_mut(type_name) {
            debug!("Clustering already enabled for '{type_name}', refreshing snapshot");
            entry.points = points;
            entry.options = options;
            entry.dirty = true;
            return true;
        }

        let layer = VectorLayer::new(format!("cluster:{type_name}"), LayerKind::Cluster, z_index);
        write_surface(&surface, |s| s.add_layer(&layer.info()));
        info!(
            "Clustering enabled for '{}' ({} points, distance {}px)",
            type_name,
            points.len(),
            options.distance
        );
        self.layers.insert(
            type_name.to_string(),
            ClusterLayer {
                layer,
                points,
                options,
                resolution: None,
                dirty: true,
                clusters: Vec::new(),
            },
        );
        true
    }

    /// Remove the cluster layer for `type_name`. Returns whether one existed.
    pub fn disable(&mut self, type_name: &str) -> bool {
        let Some(entry) = self.layers.remove(type_name) else {
            return false;
        };
        if let Some(surface) = &self.surface {
            write_surface(surface, |s| s.remove_layer(entry.layer.id));
        }
        info!("Clustering disabled for '{type_name}'");
        true
    }

    /// Replace the whole point snapshot for a type (clear, then bulk add).
    pub fn update_cluster_layer(&mut self, type_name: &str, points: Vec<ClusterPoint>) -> bool {
        let Some(entry) = self.layers.get_mut(type_name) else {
            debug!("No cluster layer for '{type_name}', ignoring update");
            return false;
        };
        entry.points.clear();
        entry.points.extend(points);
        entry.dirty = true;
        true
    }

    /// Change distance parameters for an existing cluster layer.
    pub fn set_options(&mut self, type_name: &str, options: ClusterOptions) -> bool {
        let Some(entry) = self.layers.get_mut(type_name) else {
            return false;
        };
        entry.options = options;
        entry.dirty = true;
        true
    }

    /// Recluster layers whose snapshot changed or whose resolution differs.
    pub fn refresh(&mut self, resolution: f64) {
        for (type_name, entry) in &mut self.layers {
            let resolution_changed = entry
                .resolution
                .map_or(true, |r| (r - resolution).abs() > f64::EPSILON * r.abs().max(1.0));
            if !entry.dirty && !resolution_changed {
                continue;
            }

            entry.clusters = cluster_points(&entry.points, &entry.options, resolution);
            entry.resolution = Some(resolution);
            entry.dirty = false;

            let features: Vec<Feature> = entry
                .clusters
                .iter()
                .enumerate()
                .map(|(n, cluster)| {
                    let style = if cluster.size() == 1 {
                        entry.points[cluster.members[0]].style.clone()
                    } else {
                        Some(Arc::clone(
                            self.bubble_styles
                                .entry(cluster.size())
                                .or_insert_with(|| Arc::new(bubble_style(cluster.size()))),
                        ))
                    };
                    let members: Vec<Value> = cluster
                        .members
                        .iter()
                        .map(|&i| Value::String(entry.points[i].id.clone()))
                        .collect();
                    let mut feature = Feature::new(format!("cluster:{type_name}:{n}"), Geometry::Point(cluster.center))
                        .with_property("count", cluster.size())
                        .with_property("features", members);
                    feature.style = style;
                    feature
                })
                .collect();

            entry.layer.source.clear();
            entry.layer.source.add_features(features);
            debug!(
                "Reclustered '{}': {} points into {} clusters",
                type_name,
                entry.points.len(),
                entry.clusters.len()
            );
        }
    }

    #[must_use]
    pub fn get_cluster_info(&self, type_name: &str) -> Option<ClusterInfo> {
        self.layers.get(type_name).map(|entry| ClusterInfo {
            total_features: entry.points.len(),
            cluster_count: entry.clusters.iter().filter(|c| c.size() > 1).count(),
        })
    }

    #[must_use]
    pub fn is_enabled(&self, type_name: &str) -> bool {
        self.layers.contains_key(type_name)
    }

    #[must_use]
    pub fn cluster_options(&self, type_name: &str) -> Option<ClusterOptions> {
        self.layers.get(type_name).map(|e| e.options)
    }

    #[must_use]
    pub fn clusters(&self, type_name: &str) -> &[Cluster] {
        self.layers.get(type_name).map_or(&[], |e| e.clusters.as_slice())
    }

    #[must_use]
    pub fn layer(&self, type_name: &str) -> Option<&VectorLayer> {
        self.layers.get(type_name).map(|e| &e.layer)
    }

    /// Types that currently have clustering enabled.
    pub fn enabled_types(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    /// Detach every cluster layer and forget all state.
    pub fn destroy(&mut self) {
        if let Some(surface) = &self.surface {
            for entry in self.layers.values() {
                write_surface(surface, |s| s.remove_layer(entry.layer.id));
            }
        }
        self.layers.clear();
        self.bubble_styles.clear();
        self.surface = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::MemorySurface;

    fn pt(id: &str, x: f64, y: f64) -> ClusterPoint {
        ClusterPoint {
            id: id.to_string(),
            position: Point::new(x, y),
            style: None,
        }
    }

    #[test]
    fn test_nearby_points_cluster_together() {
        let points = vec![pt("a", 0.0, 0.0), pt("b", 10.0, 10.0), pt("c", 1000.0, 0.0)];
        let clusters = cluster_points(&points, &ClusterOptions::default(), 1.0);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![0, 1]);
        assert_eq!(clusters[1].members, vec![2]);
    }

    #[test]
    fn test_every_point_claimed_once() {
        let points: Vec<_> = (0..500)
            .map(|i| pt(&i.to_string(), f64::from(i % 25) * 13.0, f64::from(i / 25) * 17.0))
            .collect();
        let clusters = cluster_points(&points, &ClusterOptions::default(), 1.0);
        let mut seen: Vec<usize> = clusters.iter().flat_map(|c| c.members.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_min_distance_pulls_toward_seed() {
        let points = vec![pt("a", 0.0, 0.0), pt("b", 20.0, 0.0)];
        let plain = cluster_points(&points, &ClusterOptions { distance: 40.0, min_distance: 0.0 }, 1.0);
        assert!((plain[0].center.x - 10.0).abs() < 1e-9);

        let spaced = cluster_points(&points, &ClusterOptions::default(), 1.0);
        // ratio 0.5 between centroid (10) and seed (0)
        assert!((spaced[0].center.x - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_tiers_and_radius() {
        assert_eq!(tier_color(5), Color::rgb(76, 175, 80));
        assert_eq!(tier_color(6), Color::rgb(255, 193, 7));
        assert_eq!(tier_color(20), Color::rgb(255, 152, 0));
        assert_eq!(tier_color(21), Color::rgb(244, 67, 54));
        assert!((bubble_radius(2) - 15.0).abs() < f64::EPSILON);
        assert!((bubble_radius(10_000) - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_enable_is_idempotent_and_info_counts() {
        let memory = MemorySurface::default().shared();
        let mut engine = ClusterEngine::new();
        engine.init(memory.clone());

        let points = vec![pt("a", 0.0, 0.0), pt("b", 1.0, 1.0), pt("c", 1.0e7, 0.0)];
        assert!(engine.enable("vessel", points.clone(), ClusterOptions::default(), 110));
        assert!(engine.enable("vessel", points, ClusterOptions::default(), 110));
        assert_eq!(memory.read().unwrap().layer_count(), 1);

        engine.refresh(1.0);
        let info = engine.get_cluster_info("vessel").unwrap();
        assert_eq!(info.total_features, 3);
        assert_eq!(info.cluster_count, 1);

        let layer = engine.layer("vessel").unwrap();
        assert_eq!(layer.source.len(), 2);
        let bubble = &layer.source.features()[0];
        assert_eq!(bubble.properties.get("count"), Some(&Value::from(2)));
        assert!(matches!(
            bubble.style.as_deref().and_then(|s| s.image.clone()),
            Some(Image::Circle { fill: Some(Fill::RadialGradient(_)), .. })
        ));
    }

    #[test]
    fn test_update_replaces_snapshot() {
        let memory = MemorySurface::default().shared();
        let mut engine = ClusterEngine::new();
        engine.init(memory);
        engine.enable("risk", vec![pt("a", 0.0, 0.0)], ClusterOptions::default(), 110);
        engine.refresh(1.0);
        assert!(engine.update_cluster_layer("risk", vec![pt("b", 0.0, 0.0), pt("c", 0.0, 1.0)]));
        engine.refresh(1.0);
        assert_eq!(engine.get_cluster_info("risk").unwrap().total_features, 2);
        assert!(!engine.update_cluster_layer("missing", Vec::new()));
    }

    #[test]
    fn test_enable_without_surface_fails() {
        let mut engine = ClusterEngine::new();
        assert!(!engine.enable("vessel", Vec::new(), ClusterOptions::default(), 1));
        assert!(!engine.is_enabled("vessel"));
    }

    #[test]
    fn test_disable_removes_layer() {
        let memory = MemorySurface::default().shared();
        let mut engine = ClusterEngine::new();
        engine.init(memory.clone());
        engine.enable("vessel", Vec::new(), ClusterOptions::default(), 110);
        assert!(engine.disable("vessel"));
        assert!(!engine.disable("vessel"));
        assert_eq!(memory.read().unwrap().layer_count(), 0);
    }
}
