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

//! Viewport-driven loading of large marker sets.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::geo::{Extent, Point};
use crate::surface::{Surface, ViewState};

use super::model::MarkerInput;

pub type ViewportCallback = Box<dyn FnMut(&ViewportChange) + Send>;

/// Options for [`super::MarkerEngine::add_markers_virtualized`].
pub struct VirtualizeOptions {
    /// Degrees added around the viewport on every side.
    pub viewport_buffer: f64,
    pub max_visible_markers: usize,
    /// Evict loaded markers that left the buffered viewport.
    pub enable_cleanup: bool,
    pub on_viewport_change: Option<ViewportCallback>,
}

impl Default for VirtualizeOptions {
    fn default() -> Self {
        Self {
            viewport_buffer: 0.1,
            max_visible_markers: 5000,
            enable_cleanup: true,
            on_viewport_change: None,
        }
    }
}

impl fmt::Debug for VirtualizeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualizeOptions")
            .field("viewport_buffer", &self.viewport_buffer)
            .field("max_visible_markers", &self.max_visible_markers)
            .field("enable_cleanup", &self.enable_cleanup)
            .finish_non_exhaustive()
    }
}

/// Outcome of one virtualization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewportChange {
    /// Candidates inside the buffered viewport, after the cap.
    pub visible: usize,
    /// Marker IDs inserted by this pass.
    pub added: Vec<String>,
    /// Marker IDs evicted by this pass.
    pub removed: Vec<String>,
}

/// Candidate list plus the loaded-key bookkeeping.
#[derive(Debug)]
pub(crate) struct VirtualSet {
    pub(crate) items: Vec<MarkerInput>,
    pub(crate) options: VirtualizeOptions,
    /// Loaded key to live marker ID.
    pub(crate) loaded: HashMap<String, String>,
}

impl VirtualSet {
    pub(crate) fn new(items: Vec<MarkerInput>, options: VirtualizeOptions) -> Self {
        Self {
            items,
            options,
            loaded: HashMap::new(),
        }
    }

    /// Indices of candidates inside `bounds` (lon/lat), first `max` in input order.
    pub(crate) fn visible_indices(&self, bounds: &Extent) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| bounds.contains_lon_lat(item.coordinate))
            .map(|(i, _)| i)
            .take(self.options.max_visible_markers)
            .collect()
    }

    /// Loaded keys that are not in `visible`.
    pub(crate) fn stale_keys(&self, visible: &HashSet<String>) -> Vec<String> {
        self.loaded
            .keys()
            .filter(|key| !visible.contains(*key))
            .cloned()
            .collect()
    }
}

/// Geographic bounds of the current view, expanded by `buffer` degrees.
pub(crate) fn buffered_bounds(surface: &dyn Surface, view: &ViewState, buffer: f64) -> Extent {
    let extent = view.extent();
    let south_west = surface.unproject(Point::new(extent.min_x, extent.min_y));
    let north_east = surface.unproject(Point::new(extent.max_x, extent.max_y));
    Extent::new(south_west.lon, south_west.lat, north_east.lon, north_east.lat).buffer(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::LonLat;
    use crate::marker::model::MarkerOptions;
    use crate::surface::MemorySurface;

    fn set(points: &[[f64; 2]], max: usize) -> VirtualSet {
        let items = points
            .iter()
            .map(|p| MarkerInput::new(*p, MarkerOptions::default()))
            .collect();
        VirtualSet::new(
            items,
            VirtualizeOptions {
                max_visible_markers: max,
                ..VirtualizeOptions::default()
            },
        )
    }

    #[test]
    fn test_visible_indices_filter_and_cap() {
        let candidates = set(&[[0.0, 0.0], [50.0, 50.0], [0.5, 0.5], [0.2, 0.1]], 2);
        let bounds = Extent::new(-1.0, -1.0, 1.0, 1.0);
        assert_eq!(candidates.visible_indices(&bounds), vec![0, 2]);
    }

    #[test]
    fn test_stale_keys() {
        let mut candidates = set(&[[0.0, 0.0]], 10);
        candidates.loaded.insert("a".to_string(), "m_a".to_string());
        candidates.loaded.insert("b".to_string(), "m_b".to_string());
        let visible: HashSet<String> = std::iter::once("a".to_string()).collect();
        assert_eq!(candidates.stale_keys(&visible), vec!["b".to_string()]);
    }

    #[test]
    fn test_buffered_bounds_contains_centre() {
        let surface = MemorySurface::new(LonLat::new(121.0, 29.0), 10.0, [800.0, 600.0]);
        let view = surface.view();
        let bounds = buffered_bounds(&surface, &view, 0.1);
        assert!(bounds.contains_lon_lat(LonLat::new(121.0, 29.0)));
        assert!(!bounds.contains_lon_lat(LonLat::new(125.0, 29.0)));
        let unbuffered = buffered_bounds(&surface, &view, 0.0);
        assert!((bounds.width() - unbuffered.width() - 0.2).abs() < 1e-9);
    }
}
