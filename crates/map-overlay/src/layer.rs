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

//! Vector layers owned by the engines.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::feature::FeatureSource;

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique layer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(u64);

impl LayerId {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer-{}", self.0)
    }
}

/// What a layer holds, so a renderer can pick a drawing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    Markers,
    Polygons,
    TrackBase,
    TrackAnimation,
    Cluster,
    Heatmap,
}

/// Layer description handed to the surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub id: LayerId,
    pub name: String,
    pub kind: LayerKind,
    pub z_index: i32,
    pub visible: bool,
}

/// A named layer with its own feature collection.
#[derive(Debug, Clone)]
pub struct VectorLayer {
    pub id: LayerId,
    pub name: String,
    pub kind: LayerKind,
    pub z_index: i32,
    pub visible: bool,
    pub source: FeatureSource,
}

impl VectorLayer {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: LayerKind, z_index: i32) -> Self {
        Self {
            id: LayerId::next(),
            name: name.into(),
            kind,
            z_index,
            visible: true,
            source: FeatureSource::new(),
        }
    }

    #[must_use]
    pub fn info(&self) -> LayerInfo {
        LayerInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            z_index: self.z_index,
            visible: self.visible,
        }
    }
}
