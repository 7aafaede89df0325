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

//! Render features and the ordered collections that hold them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::geo::{Extent, Point};
use crate::style::Style;

/// Projected geometry of a feature.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Point),
    LineString(Vec<Point>),
    /// Outer ring only; the ring is closed (first == last).
    Polygon(Vec<Point>),
}

impl Geometry {
    #[must_use]
    pub fn extent(&self) -> Extent {
        let mut extent = Extent::empty();
        match self {
            Geometry::Point(p) => extent.extend(*p),
            Geometry::LineString(points) | Geometry::Polygon(points) => {
                for p in points {
                    extent.extend(*p);
                }
            }
        }
        extent
    }

    #[must_use]
    pub fn as_point(&self) -> Option<Point> {
        match self {
            Geometry::Point(p) => Some(*p),
            _ => None,
        }
    }
}

/// A renderable feature: geometry, attribute bag and current style.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: String,
    pub geometry: Geometry,
    pub properties: Map<String, Value>,
    pub style: Option<Arc<Style>>,
}

impl Feature {
    #[must_use]
    pub fn new(id: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            id: id.into(),
            geometry,
            properties: Map::new(),
            style: None,
        }
    }

    #[must_use]
    pub fn with_style(mut self, style: Arc<Style>) -> Self {
        self.style = Some(style);
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

/// Ordered feature collection with an ID index.
///
/// Insertion order is preserved; removal is O(n) because the tail is reindexed.
#[derive(Debug, Clone, Default)]
pub struct FeatureSource {
    features: Vec<Feature>,
    index: HashMap<String, usize>,
}

impl FeatureSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one feature. A feature with an already-present ID replaces the old one.
    pub fn add_feature(&mut self, feature: Feature) {
        if let Some(&i) = self.index.get(&feature.id) {
            self.features[i] = feature;
            return;
        }
        self.index.insert(feature.id.clone(), self.features.len());
        self.features.push(feature);
    }

    /// Bulk insert in one call.
    pub fn add_features(&mut self, features: impl IntoIterator<Item = Feature>) {
        let iter = features.into_iter();
        let (lower, _) = iter.size_hint();
        self.features.reserve(lower);
        self.index.reserve(lower);
        for feature in iter {
            self.add_feature(feature);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Feature> {
        let i = self.index.remove(id)?;
        let removed = self.features.remove(i);
        for (offset, feature) in self.features[i..].iter().enumerate() {
            self.index.insert(feature.id.clone(), i + offset);
        }
        Some(removed)
    }

    /// Remove every feature whose ID is in `ids`; one pass over the collection.
    pub fn remove_many(&mut self, ids: &HashSet<String>) -> usize {
        let before = self.features.len();
        self.features.retain(|f| !ids.contains(&f.id));
        let removed = before - self.features.len();
        if removed > 0 {
            self.reindex();
        }
        removed
    }

    /// Remove features matching a predicate.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&Feature) -> bool,
    {
        let before = self.features.len();
        self.features.retain(|f| !predicate(f));
        let removed = before - self.features.len();
        if removed > 0 {
            self.reindex();
        }
        removed
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, feature) in self.features.iter().enumerate() {
            self.index.insert(feature.id.clone(), i);
        }
    }

    pub fn clear(&mut self) {
        self.features.clear();
        self.index.clear();
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.index.get(id).map(|&i| &self.features[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Feature> {
        self.index.get(id).map(|&i| &mut self.features[i])
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn features_mut(&mut self) -> impl Iterator<Item = &mut Feature> {
        self.features.iter_mut()
    }

    /// Features whose geometry extent intersects `extent`.
    pub fn features_in_extent<'a>(&'a self, extent: &'a Extent) -> impl Iterator<Item = &'a Feature> + 'a {
        self.features.iter().filter(move |f| {
            let e = f.geometry.extent();
            e.min_x <= extent.max_x
                && e.max_x >= extent.min_x
                && e.min_y <= extent.max_y
                && e.max_y >= extent.min_y
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
