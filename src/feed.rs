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

//! Deterministic mock telemetry.
//!
//! Entities are laid out on a golden-angle spiral around the map centre so any
//! count gives an even, repeatable spread. Every third entity is a vessel, a
//! vehicle or a risk point.

use std::sync::Arc;

use map_overlay::style::ShapeOptions;
use map_overlay::{Color, HeatPoint, LonLat, MarkerInput, MarkerOptions, StyleOptions, Waypoint};

/// π(3 − √5) radians.
pub const GOLDEN_ANGLE: f64 = 2.399_963_229_728_653;

/// Degrees between successive spiral rings.
const SPIRAL_SPACING: f64 = 0.002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Vessel,
    Vehicle,
    Risk,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Vessel, EntityKind::Vehicle, EntityKind::Risk];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Vessel => "vessel",
            EntityKind::Vehicle => "vehicle",
            EntityKind::Risk => "risk",
        }
    }

    fn style(self) -> StyleOptions {
        let (points, fill) = match self {
            EntityKind::Vessel => (Some(3), Color::rgb(24, 144, 255)),
            EntityKind::Vehicle => (Some(4), Color::rgb(82, 196, 26)),
            EntityKind::Risk => (None, Color::rgb(245, 34, 45)),
        };
        StyleOptions {
            shape: Some(ShapeOptions {
                points,
                radius: Some(7.0),
                fill_color: Some(fill),
                ..ShapeOptions::default()
            }),
            ..StyleOptions::default()
        }
    }
}

/// `n` positions on a golden-angle spiral around `center`.
pub fn spiral(center: LonLat, n: usize, spacing: f64) -> Vec<LonLat> {
    (0..n)
        .map(|i| {
            let radius = spacing * (i as f64).sqrt();
            let theta = i as f64 * GOLDEN_ANGLE;
            LonLat::new(center.lon + radius * theta.cos(), center.lat + radius * theta.sin())
        })
        .collect()
}

/// Generates markers, tracks and heat samples around a fixed centre.
#[derive(Debug)]
pub struct MockFeed {
    center: LonLat,
    styles: [Arc<StyleOptions>; 3],
}

impl MockFeed {
    pub fn new(center: LonLat) -> Self {
        Self {
            center,
            styles: EntityKind::ALL.map(|kind| Arc::new(kind.style())),
        }
    }

    fn kind_of(index: usize) -> EntityKind {
        EntityKind::ALL[index % EntityKind::ALL.len()]
    }

    pub fn marker_id(index: usize) -> String {
        format!("{}-{index:05}", Self::kind_of(index).as_str())
    }

    /// `count` typed markers; entities of one kind share one style allocation.
    pub fn markers(&self, count: usize) -> Vec<MarkerInput> {
        spiral(self.center, count, SPIRAL_SPACING)
            .into_iter()
            .enumerate()
            .map(|(i, position)| {
                let kind = Self::kind_of(i);
                let options = MarkerOptions::typed(kind.as_str())
                    .with_id(Self::marker_id(i))
                    .with_style(Arc::clone(&self.styles[i % 3]))
                    .with_data("name", format!("{} {i}", kind.as_str()))
                    .with_data("speed", (i % 30) as f64 * 0.5);
                MarkerInput::new(position, options)
            })
            .collect()
    }

    /// Position of a moving vessel at `frame`; vessels orbit their spiral slot.
    pub fn drift(&self, index: usize, frame: u64) -> LonLat {
        let home = spiral(self.center, index + 1, SPIRAL_SPACING)[index];
        let phase = frame as f64 * 0.01 + index as f64;
        LonLat::new(home.lon + 0.0005 * phase.cos(), home.lat + 0.0005 * phase.sin())
    }

    /// `count` replay tracks radiating from the centre, `waypoints` points each.
    pub fn tracks(&self, count: usize, waypoints: usize) -> Vec<(String, Vec<Waypoint>)> {
        (0..count)
            .map(|t| {
                let heading = t as f64 * GOLDEN_ANGLE;
                let route = (0..waypoints)
                    .map(|j| {
                        let reach = 0.01 * j as f64;
                        let wobble = 0.002 * ((j as f64) * 1.7 + t as f64).sin();
                        let position = LonLat::new(
                            self.center.lon + reach * heading.cos() + wobble,
                            self.center.lat + reach * heading.sin(),
                        );
                        Waypoint::new(position)
                            .with_label(format!("WP{j}"))
                            .with_tip(format!("track {t} waypoint {j}"))
                    })
                    .collect();
                (format!("replay-{t}"), route)
            })
            .collect()
    }

    /// Heat samples weighted 1..=5.
    pub fn heat(&self, count: usize) -> Vec<HeatPoint> {
        spiral(self.center, count, SPIRAL_SPACING * 2.0)
            .into_iter()
            .enumerate()
            .map(|(i, position)| HeatPoint::new(position).with_weight((i % 5 + 1) as f64))
            .collect()
    }
}
