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

//! The map surface the engines draw onto.
//!
//! The engines never talk to a concrete renderer. They bind to a [`SharedSurface`],
//! attach and detach layers and overlays through it, read the current view and use
//! its coordinate transform. [`MemorySurface`] is a complete in-process
//! implementation used by the host binary and the tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::geo::{Extent, LonLat, Point, WebMercator};
use crate::layer::{LayerId, LayerInfo};

/// A positioned DOM-free overlay (popup, tooltip) anchored to a map coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub id: String,
    pub position: Point,
    /// Opaque content handle; templating is the host's concern.
    pub content: String,
    /// Pixel offset from the anchor.
    pub offset: [f64; 2],
    pub auto_pan: bool,
}

/// Snapshot of the current viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    /// View centre in projected coordinates.
    pub center: Point,
    /// Projected units per pixel.
    pub resolution: f64,
    /// Viewport size in pixels, `[width, height]`.
    pub size: [f64; 2],
    /// Incremented on every pan, zoom or resize.
    pub revision: u64,
}

impl ViewState {
    /// Projected extent covered by a viewport of `size` pixels.
    #[must_use]
    pub fn calculate_extent(&self, size: [f64; 2]) -> Extent {
        let half_w = size[0] * self.resolution / 2.0;
        let half_h = size[1] * self.resolution / 2.0;
        Extent::new(
            self.center.x - half_w,
            self.center.y - half_h,
            self.center.x + half_w,
            self.center.y + half_h,
        )
    }

    #[must_use]
    pub fn extent(&self) -> Extent {
        self.calculate_extent(self.size)
    }

    /// Projected point to viewport pixel, origin top-left.
    #[must_use]
    pub fn to_pixel(&self, p: Point) -> [f64; 2] {
        [
            (p.x - self.center.x) / self.resolution + self.size[0] / 2.0,
            (self.center.y - p.y) / self.resolution + self.size[1] / 2.0,
        ]
    }
}

/// Rendering surface collaborator.
pub trait Surface: Send + Sync {
    fn add_layer(&mut self, layer: &LayerInfo);
    fn remove_layer(&mut self, id: LayerId);
    fn set_layer_visible(&mut self, id: LayerId, visible: bool);
    fn set_layer_z_index(&mut self, id: LayerId, z_index: i32);
    fn add_overlay(&mut self, overlay: &Overlay);
    fn remove_overlay(&mut self, id: &str);
    fn view(&self) -> ViewState;

    /// Geographic to surface coordinate.
    fn project(&self, c: LonLat) -> Point {
        WebMercator::project(c)
    }

    /// Surface to geographic coordinate.
    fn unproject(&self, p: Point) -> LonLat {
        WebMercator::unproject(p)
    }
}

impl std::fmt::Debug for dyn Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("view", &self.view())
            .finish_non_exhaustive()
    }
}

/// Handle shared by every engine bound to the same map.
pub type SharedSurface = Arc<RwLock<dyn Surface>>;

/// Run `f` with read access; a poisoned lock is logged and treated as no map.
pub(crate) fn read_surface<R>(surface: &SharedSurface, f: impl FnOnce(&dyn Surface) -> R) -> Option<R> {
    match surface.read() {
        Ok(guard) => Some(f(&*guard)),
        Err(_) => {
            warn!("Map surface lock poisoned, skipping operation");
            None
        }
    }
}

/// Run `f` with write access; a poisoned lock is logged and treated as no map.
pub(crate) fn write_surface<R>(surface: &SharedSurface, f: impl FnOnce(&mut dyn Surface) -> R) -> Option<R> {
    match surface.write() {
        Ok(mut guard) => Some(f(&mut *guard)),
        Err(_) => {
            warn!("Map surface lock poisoned, skipping operation");
            None
        }
    }
}

/// In-memory surface that records attached layers and overlays.
#[derive(Debug, Clone)]
pub struct MemorySurface {
    layers: HashMap<LayerId, LayerInfo>,
    overlays: HashMap<String, Overlay>,
    view: ViewState,
}

impl Default for MemorySurface {
    fn default() -> Self {
        Self::new(LonLat::new(0.0, 0.0), 2.0, [1024.0, 768.0])
    }
}

impl MemorySurface {
    /// Create a surface centred on `center` at `zoom` with a `size` pixel viewport.
    #[must_use]
    pub fn new(center: LonLat, zoom: f64, size: [f64; 2]) -> Self {
        Self {
            layers: HashMap::new(),
            overlays: HashMap::new(),
            view: ViewState {
                center: WebMercator::project(center),
                resolution: WebMercator::resolution_for_zoom(zoom),
                size,
                revision: 0,
            },
        }
    }

    /// Wrap into the shared handle the engines expect.
    #[must_use]
    pub fn shared(self) -> Arc<RwLock<MemorySurface>> {
        Arc::new(RwLock::new(self))
    }

    /// Pan and zoom; bumps the view revision.
    pub fn set_view(&mut self, center: LonLat, zoom: f64) {
        self.view.center = WebMercator::project(center);
        self.view.resolution = WebMercator::resolution_for_zoom(zoom);
        self.view.revision += 1;
    }

    pub fn set_resolution(&mut self, resolution: f64) {
        self.view.resolution = resolution;
        self.view.revision += 1;
    }

    pub fn resize(&mut self, size: [f64; 2]) {
        self.view.size = size;
        self.view.revision += 1;
    }

    #[must_use]
    pub fn layer(&self, id: LayerId) -> Option<&LayerInfo> {
        self.layers.get(&id)
    }

    #[must_use]
    pub fn has_layer(&self, id: LayerId) -> bool {
        self.layers.contains_key(&id)
    }

    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Attached layers sorted by z-index.
    #[must_use]
    pub fn layers(&self) -> Vec<&LayerInfo> {
        let mut layers: Vec<_> = self.layers.values().collect();
        layers.sort_by_key(|l| (l.z_index, l.id));
        layers
    }

    #[must_use]
    pub fn overlay(&self, id: &str) -> Option<&Overlay> {
        self.overlays.get(id)
    }

    #[must_use]
    pub fn overlay_count(&self) -> usize {
        self.overlays.len()
    }
}

impl Surface for MemorySurface {
    fn add_layer(&mut self, layer: &LayerInfo) {
        self.layers.insert(layer.id, layer.clone());
    }

    fn remove_layer(&mut self, id: LayerId) {
        self.layers.remove(&id);
    }

    fn set_layer_visible(&mut self, id: LayerId, visible: bool) {
        if let Some(layer) = self.layers.get_mut(&id) {
            layer.visible = visible;
        }
    }

    fn set_layer_z_index(&mut self, id: LayerId, z_index: i32) {
        if let Some(layer) = self.layers.get_mut(&id) {
            layer.z_index = z_index;
        }
    }

    fn add_overlay(&mut self, overlay: &Overlay) {
        self.overlays.insert(overlay.id.clone(), overlay.clone());
    }

    fn remove_overlay(&mut self, id: &str) {
        self.overlays.remove(id);
    }

    fn view(&self) -> ViewState {
        self.view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{LayerKind, VectorLayer};

    #[test]
    fn test_view_extent_matches_size() {
        let surface = MemorySurface::new(LonLat::new(0.0, 0.0), 0.0, [256.0, 256.0]);
        let extent = surface.view().extent();
        assert!((extent.width() - 2.0 * 20_037_508.342_789).abs() < 1.0);
    }

    #[test]
    fn test_set_view_bumps_revision() {
        let mut surface = MemorySurface::default();
        let before = surface.view().revision;
        surface.set_view(LonLat::new(10.0, 10.0), 5.0);
        assert_eq!(surface.view().revision, before + 1);
    }

    #[test]
    fn test_shared_surface_layer_lifecycle() {
        let memory = MemorySurface::default().shared();
        let shared: SharedSurface = memory.clone();
        let layer = VectorLayer::new("markers", LayerKind::Markers, 101);

        write_surface(&shared, |s| s.add_layer(&layer.info()));
        assert!(memory.read().unwrap().has_layer(layer.id));

        write_surface(&shared, |s| s.set_layer_visible(layer.id, false));
        assert!(!memory.read().unwrap().layer(layer.id).unwrap().visible);

        write_surface(&shared, |s| s.remove_layer(layer.id));
        assert_eq!(memory.read().unwrap().layer_count(), 0);
    }

    #[test]
    fn test_to_pixel_centre() {
        let surface = MemorySurface::new(LonLat::new(0.0, 0.0), 3.0, [800.0, 600.0]);
        let view = surface.view();
        let px = view.to_pixel(view.center);
        assert!((px[0] - 400.0).abs() < 1e-9);
        assert!((px[1] - 300.0).abs() < 1e-9);
    }
}
