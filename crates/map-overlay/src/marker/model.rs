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

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::geo::LonLat;
use crate::style::{Color, StyleOptions};

/// A point entity owned by the marker engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub id: String,
    /// Source-of-truth coordinate; the rendered geometry is derived from it.
    pub coordinate: LonLat,
    pub style: Option<Arc<StyleOptions>>,
    pub data: Map<String, Value>,
    pub marker_type: Option<String>,
    pub visible: bool,
    /// Type layer holding the marker, `None` for the default layer.
    pub layer: Option<String>,
}

/// Options for a single insertion.
#[derive(Debug, Clone, Default)]
pub struct MarkerOptions {
    /// Explicit ID. Reusing a live ID replaces that marker.
    pub id: Option<String>,
    pub marker_type: Option<String>,
    /// Route to the per-type layer instead of the default layer.
    pub use_type_layer: bool,
    /// Share one `Arc` across markers to share the resolved style.
    pub style: Option<Arc<StyleOptions>>,
    pub data: Map<String, Value>,
}

impl MarkerOptions {
    /// Options routing to the layer of `marker_type`.
    #[must_use]
    pub fn typed(marker_type: impl Into<String>) -> Self {
        Self {
            marker_type: Some(marker_type.into()),
            use_type_layer: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_style(mut self, style: Arc<StyleOptions>) -> Self {
        self.style = Some(style);
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub(crate) fn destination(&self) -> Option<String> {
        if self.use_type_layer {
            self.marker_type.clone()
        } else {
            None
        }
    }
}

/// One entry of a bulk insertion.
#[derive(Debug, Clone)]
pub struct MarkerInput {
    pub coordinate: LonLat,
    pub options: MarkerOptions,
}

impl MarkerInput {
    #[must_use]
    pub fn new(coordinate: impl Into<LonLat>, options: MarkerOptions) -> Self {
        Self {
            coordinate: coordinate.into(),
            options,
        }
    }

    /// Key used for virtualization bookkeeping: the explicit ID, else the coordinate.
    #[must_use]
    pub fn key(&self) -> String {
        self.options.id.clone().unwrap_or_else(|| self.coordinate.key())
    }
}

/// In-place changes for [`super::MarkerEngine::update_marker`].
#[derive(Debug, Clone, Default)]
pub struct MarkerUpdate {
    pub coordinate: Option<LonLat>,
    /// Merged onto the stored style options.
    pub style: Option<StyleOptions>,
    /// Merged into the attribute bag.
    pub data: Option<Map<String, Value>>,
}

/// Appearance of a filled polygon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonOptions {
    pub id: Option<String>,
    pub fill_color: Color,
    pub stroke_color: Color,
    pub stroke_width: f64,
}

impl Default for PolygonOptions {
    fn default() -> Self {
        Self {
            id: None,
            fill_color: Color::rgba(24, 144, 255, 51),
            stroke_color: Color::rgb(24, 144, 255),
            stroke_width: 2.0,
        }
    }
}

/// A popup anchored to a coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopupOptions {
    pub id: Option<String>,
    pub coordinate: LonLat,
    /// Opaque content, rendered by the host.
    pub content: String,
    pub offset: [f64; 2],
    pub auto_pan: bool,
}

impl PopupOptions {
    #[must_use]
    pub fn new(coordinate: LonLat, content: impl Into<String>) -> Self {
        Self {
            id: None,
            coordinate,
            content: content.into(),
            offset: [0.0, -12.0],
            auto_pan: true,
        }
    }
}

/// Events emitted by the marker engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    MarkerAdded(String),
    MarkerRemoved(String),
    /// The batch queue was flushed into the layers.
    BatchFlushed { count: usize },
    /// A chunked bulk insert finished its last chunk.
    BatchCompleted { total: usize },
    TypeLayerCreated(String),
    ClusteringChanged { marker_type: String, enabled: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_key_prefers_id() {
        let with_id = MarkerInput::new([1.0, 2.0], MarkerOptions::default().with_id("m1"));
        let without = MarkerInput::new([1.0, 2.0], MarkerOptions::default());
        assert_eq!(with_id.key(), "m1");
        assert_eq!(without.key(), LonLat::new(1.0, 2.0).key());
    }

    #[test]
    fn test_destination_requires_type_layer_flag() {
        let mut options = MarkerOptions::typed("vessel");
        assert_eq!(options.destination().as_deref(), Some("vessel"));
        options.use_type_layer = false;
        assert_eq!(options.destination(), None);
    }
}
