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

//! Map overlay engines for situational-awareness views.
//!
//! This library manages everything drawn on top of a basemap:
//!
//! - **Marker engine**: tens of thousands of point markers in per-type layers,
//!   debounced and frame-chunked insertion, viewport virtualization, polygons and popups
//! - **Track engine**: polyline routes with independently controllable replay animations
//! - **Cluster engine**: per-type distance clustering with count bubbles
//! - **Heatmap engine**: a weighted point layer rendered as a density grid
//!
//! The engines talk to the map through the [`Surface`] trait. [`MemorySurface`]
//! is a complete in-process implementation used by the host binary and the tests.
//!
//! Nothing here spawns threads or timers. The host calls
//! [`MarkerEngine::on_frame`] once per rendered frame, which flushes queued inserts,
//! runs one chunk of every pending bulk job, fires due animation steps and
//! follows viewport changes.
//!
//! # Quick Start
//!
//! ```
//! use map_overlay::{BatchOptions, LonLat, MarkerEngine, MarkerInput, MarkerOptions, MemorySurface};
//!
//! let surface = MemorySurface::new(LonLat::new(121.0, 29.0), 10.0, [800.0, 600.0]).shared();
//! let mut engine = MarkerEngine::default();
//! engine.init(surface);
//!
//! let id = engine.add_marker([121.0, 29.0], MarkerOptions::typed("vessel"), false);
//! assert!(id.is_some());
//!
//! let inputs = (0..5000)
//!     .map(|i| MarkerInput::new([121.0 + f64::from(i) * 1e-4, 29.0], MarkerOptions::typed("vessel")))
//!     .collect();
//! engine.add_markers(inputs, BatchOptions::default());
//! while engine.has_pending_work() {
//!     engine.on_frame();
//! }
//! assert_eq!(engine.markers_by_type("vessel").len(), 5001);
//! ```
//!
//! # Heatmap
//!
//! ```
//! use map_overlay::{HeatPoint, HeatmapEngine, HeatmapOptions, LonLat, MemorySurface};
//!
//! let surface = MemorySurface::new(LonLat::new(0.0, 0.0), 8.0, [256.0, 256.0]).shared();
//! let mut heat = HeatmapEngine::new();
//! heat.init(surface, HeatmapOptions::default());
//! heat.set_data(vec![HeatPoint::new([0.0, 0.0]).with_weight(3.0)]);
//!
//! let grid = heat.rasterize(64, 64).expect("surface is bound");
//! assert!(grid.peak().is_some());
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod feature;
pub mod geo;
pub mod heatmap;
pub mod id;
pub mod layer;
pub mod marker;
pub mod schedule;
pub mod style;
pub mod surface;
pub mod track;

pub use cluster::{Cluster, ClusterEngine, ClusterInfo, ClusterOptions, ClusterPoint};
pub use config::EngineConfig;
pub use error::{OverlayError, Result};
pub use feature::{Feature, FeatureSource, Geometry};
pub use geo::{Extent, LonLat, Point, WebMercator};
pub use heatmap::{DensityGrid, HeatPoint, HeatmapEngine, HeatmapOptions};
pub use id::IdGenerator;
pub use layer::{LayerId, LayerInfo, LayerKind, VectorLayer};
pub use marker::{
    BatchOptions, BatchProgress, Marker, MarkerEngine, MarkerInput, MarkerOptions, MarkerUpdate, OverlayEvent,
    PolygonOptions, PopupOptions, ViewportChange, VirtualizeOptions,
};
pub use schedule::{Clock, ManualClock, SystemClock};
pub use style::{Color, Style, StyleOptions};
pub use surface::{MemorySurface, Overlay, SharedSurface, Surface, ViewState};
pub use track::{AnimationOutcome, GeneratedTrack, TrackEngine, TrackOptions, Waypoint};
