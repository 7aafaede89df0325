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

//! The marker engine: registry, per-type layers, batching and virtualization.
//!
//! [`MarkerEngine`] is the single writer of every marker collection. It also owns
//! the [`TrackEngine`] and [`ClusterEngine`] bound to the same surface, and its
//! [`MarkerEngine::on_frame`] pump drives all of them:
//!
//! 1. flush the batch queue if its idle window elapsed,
//! 2. run one chunk of every pending bulk job,
//! 3. fire due track animation steps,
//! 4. refresh virtualization when the view revision changed,
//! 5. re-cluster layers that are dirty or whose resolution changed.

mod batch;
mod model;
mod virtualize;

pub use batch::{BatchOptions, BatchProgress, ProgressCallback};
pub use model::{Marker, MarkerInput, MarkerOptions, MarkerUpdate, OverlayEvent, PolygonOptions, PopupOptions};
pub use virtualize::{ViewportCallback, ViewportChange, VirtualizeOptions};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::cluster::{ClusterEngine, ClusterOptions, ClusterPoint};
use crate::config::EngineConfig;
use crate::error::OverlayError;
use crate::feature::{Feature, Geometry};
use crate::geo::{Extent, LonLat, Point};
use crate::id::IdGenerator;
use crate::layer::{LayerKind, VectorLayer};
use crate::schedule::{Clock, SystemClock};
use crate::style::{Fill, Stroke, Style, StyleCache, StyleOptions};
use crate::surface::{read_surface, write_surface, Overlay, SharedSurface, ViewState};
use crate::track::TrackEngine;
use batch::{BatchQueue, InsertJob, Job, VisibilityJob};
use virtualize::{buffered_bounds, VirtualSet};

const PROP_TYPE: &str = "type";

fn render_feature(marker: &Marker, position: Point, style: Arc<Style>) -> Feature {
    let mut feature = Feature::new(marker.id.clone(), Geometry::Point(position)).with_style(style);
    feature.properties.clone_from(&marker.data);
    if let Some(marker_type) = &marker.marker_type {
        feature
            .properties
            .insert(PROP_TYPE.to_string(), Value::String(marker_type.clone()));
    }
    feature
}

/// Authoritative registry of markers and coordinator of the other engines.
pub struct MarkerEngine {
    config: EngineConfig,
    surface: Option<SharedSurface>,
    clock: Arc<dyn Clock>,

    markers: HashMap<String, Marker>,
    order: Vec<String>,
    by_type: HashMap<String, HashSet<String>>,
    /// IDs handed out but not yet in the registry (queued or in a job).
    reserved: HashSet<String>,

    default_layer: VectorLayer,
    polygon_layer: VectorLayer,
    type_layers: HashMap<String, VectorLayer>,
    type_order: Vec<String>,
    /// Last type-layer offset above the base z-index; never reused until destroy.
    type_z_offset: i32,

    styles: StyleCache,
    default_style: Arc<StyleOptions>,
    invisible: Arc<Style>,

    ids: IdGenerator,
    polygon_ids: IdGenerator,
    popup_ids: IdGenerator,
    popups: Vec<String>,

    queue: BatchQueue,
    jobs: VecDeque<Job>,
    virtualized: Option<VirtualSet>,
    last_revision: Option<u64>,
    /// Clustered types whose markers changed since the last snapshot.
    stale_clusters: HashSet<String>,

    tracks: TrackEngine,
    clusters: ClusterEngine,
    events: broadcast::Sender<OverlayEvent>,
}

impl fmt::Debug for MarkerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkerEngine")
            .field("initialized", &self.surface.is_some())
            .field("markers", &self.markers.len())
            .field("type_layers", &self.type_order)
            .field("pending_batch", &self.queue.len())
            .field("jobs", &self.jobs)
            .field("tracks", &self.tracks.track_ids().len())
            .finish_non_exhaustive()
    }
}

impl Default for MarkerEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl MarkerEngine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an engine driven by `clock`; the owned track engine shares it.
    #[must_use]
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            surface: None,
            markers: HashMap::new(),
            order: Vec::new(),
            by_type: HashMap::new(),
            reserved: HashSet::new(),
            default_layer: VectorLayer::new("markers", LayerKind::Markers, config.base_z_index),
            polygon_layer: VectorLayer::new("polygons", LayerKind::Polygons, config.base_z_index - 1),
            type_layers: HashMap::new(),
            type_order: Vec::new(),
            type_z_offset: 0,
            styles: StyleCache::new(),
            default_style: Arc::new(StyleOptions::default()),
            invisible: Arc::new(Style::invisible()),
            ids: IdGenerator::new("marker", config.id_max_attempts),
            polygon_ids: IdGenerator::new("polygon", config.id_max_attempts),
            popup_ids: IdGenerator::new("popup", config.id_max_attempts),
            popups: Vec::new(),
            queue: BatchQueue::new(config.batch_queue_capacity, config.batch_idle()),
            jobs: VecDeque::new(),
            virtualized: None,
            last_revision: None,
            stale_clusters: HashSet::new(),
            tracks: TrackEngine::with_clock(config.track_z_index, Arc::clone(&clock)),
            clusters: ClusterEngine::new(),
            events,
            clock,
            config,
        }
    }

    /// Replace the marker ID generator.
    pub fn set_id_generator(&mut self, ids: IdGenerator) {
        self.ids = ids;
    }

    /// Bind to a surface. Binding again tears down the previous binding first.
    pub fn init(&mut self, surface: SharedSurface) {
        if self.surface.is_some() {
            debug!("Marker engine already bound, rebinding");
            self.destroy();
        }
        let default = self.default_layer.info();
        let polygons = self.polygon_layer.info();
        self.last_revision = write_surface(&surface, |s| {
            s.add_layer(&default);
            s.add_layer(&polygons);
            s.view().revision
        });
        self.tracks.init(Arc::clone(&surface));
        self.clusters.init(Arc::clone(&surface));
        self.surface = Some(surface);
        info!("Marker engine initialized");
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.surface.is_some()
    }

    /// Receive engine events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: OverlayEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn view(&self) -> Option<ViewState> {
        read_surface(self.surface.as_ref()?, |s| s.view())
    }

    // ----- insertion -------------------------------------------------------

    /// Build a marker record and reserve its ID.
    fn prepare(&mut self, coordinate: LonLat, options: MarkerOptions) -> Marker {
        let layer = options.destination();
        let id = match options.id {
            Some(id) => id,
            None => {
                let (markers, reserved) = (&self.markers, &self.reserved);
                self.ids
                    .generate(|candidate| markers.contains_key(candidate) || reserved.contains(candidate))
            }
        };
        self.reserved.insert(id.clone());
        Marker {
            id,
            coordinate,
            style: options.style,
            data: options.data,
            marker_type: options.marker_type,
            visible: true,
            layer,
        }
    }

    fn ensure_type_layer(&mut self, marker_type: &str) {
        if self.type_layers.contains_key(marker_type) {
            return;
        }
        self.type_z_offset = self.type_z_offset.saturating_add(1);
        let z_index = self.config.base_z_index.saturating_add(self.type_z_offset);
        let layer = VectorLayer::new(format!("markers:{marker_type}"), LayerKind::Markers, z_index);
        if let Some(surface) = &self.surface {
            write_surface(surface, |s| s.add_layer(&layer.info()));
        }
        debug!("Created type layer '{marker_type}' at z {z_index}");
        self.type_layers.insert(marker_type.to_string(), layer);
        self.type_order.push(marker_type.to_string());
        self.emit(OverlayEvent::TypeLayerCreated(marker_type.to_string()));
    }

    fn register(&mut self, marker: Marker) {
        if let Some(marker_type) = &marker.marker_type {
            self.by_type
                .entry(marker_type.clone())
                .or_default()
                .insert(marker.id.clone());
        }
        self.order.push(marker.id.clone());
        self.emit(OverlayEvent::MarkerAdded(marker.id.clone()));
        self.markers.insert(marker.id.clone(), marker);
    }

    /// Insert prepared markers: one bulk add per destination layer, input order kept.
    fn insert_group(&mut self, batch: Vec<Marker>) -> usize {
        let Some(surface) = self.surface.clone() else {
            return 0;
        };
        let Some(positions) = read_surface(&surface, |s| {
            batch.iter().map(|m| s.project(m.coordinate)).collect::<Vec<_>>()
        }) else {
            return 0;
        };

        let count = batch.len();
        let mut grouped: Vec<(Option<String>, Vec<Feature>)> = Vec::new();
        let mut slots: HashMap<Option<String>, usize> = HashMap::new();
        let mut placed: HashMap<String, usize> = HashMap::new();

        for (marker, position) in batch.into_iter().zip(positions) {
            self.reserved.remove(&marker.id);
            // The newest insert of an ID wins over queued, earlier-in-batch and live copies.
            if self.queue.remove(&marker.id) {
                debug!("Dropping queued copy of '{}'", marker.id);
            }
            if let Some(&earlier) = placed.get(&marker.id) {
                grouped[earlier].1.retain(|f| f.id != marker.id);
            }
            self.remove_live(&marker.id);
            if let Some(marker_type) = &marker.layer {
                self.ensure_type_layer(marker_type);
            }
            let style = if marker.visible {
                self.styles
                    .resolve(marker.style.as_ref().unwrap_or(&self.default_style))
            } else {
                Arc::clone(&self.invisible)
            };
            let feature = render_feature(&marker, position, style);
            let destination = marker.layer.clone();
            let slot = *slots.entry(destination.clone()).or_insert_with(|| {
                grouped.push((destination, Vec::new()));
                grouped.len() - 1
            });
            grouped[slot].1.push(feature);
            placed.insert(marker.id.clone(), slot);
            self.register(marker);
        }

        for (destination, features) in grouped {
            if let Some(layer) = self.layer_mut(destination.as_deref()) {
                layer.source.add_features(features);
            }
            self.mark_cluster_stale(destination.as_deref());
        }
        count
    }

    fn mark_cluster_stale(&mut self, destination: Option<&str>) {
        if let Some(marker_type) = destination {
            if self.clusters.is_enabled(marker_type) {
                self.stale_clusters.insert(marker_type.to_string());
            }
        }
    }

    fn layer_mut(&mut self, destination: Option<&str>) -> Option<&mut VectorLayer> {
        match destination {
            Some(marker_type) => self.type_layers.get_mut(marker_type),
            None => Some(&mut self.default_layer),
        }
    }

    /// Add one marker. Returns its ID, or `None` when no surface is bound.
    ///
    /// With `use_batch` the marker is queued and becomes visible at the next flush:
    /// when the queue is full, after the idle window, or on [`Self::flush_batch_queue`].
    pub fn add_marker(&mut self, coordinate: impl Into<LonLat>, options: MarkerOptions, use_batch: bool) -> Option<String> {
        if self.surface.is_none() {
            warn!("Cannot add marker: {}", OverlayError::SurfaceUnavailable);
            return None;
        }
        let marker = self.prepare(coordinate.into(), options);
        let id = marker.id.clone();
        if use_batch {
            let now = self.clock.now();
            if self.queue.push(marker, now) {
                self.flush_batch_queue();
            }
        } else {
            self.insert_group(vec![marker]);
        }
        Some(id)
    }

    /// Insert everything queued by `use_batch` inserts now.
    pub fn flush_batch_queue(&mut self) -> usize {
        let pending = self.queue.drain();
        if pending.is_empty() {
            return 0;
        }
        let count = self.insert_group(pending);
        debug!("Flushed {count} queued markers");
        self.emit(OverlayEvent::BatchFlushed { count });
        count
    }

    /// Add many markers. Returns their IDs in input order.
    ///
    /// Inputs below the sync threshold, or with `use_batch` off, are inserted
    /// before this returns. Larger inputs are inserted one chunk per
    /// [`Self::on_frame`] call, reporting progress after every chunk.
    pub fn add_markers(&mut self, items: Vec<MarkerInput>, mut options: BatchOptions) -> Vec<String> {
        if self.surface.is_none() {
            warn!("Cannot add markers: {}", OverlayError::SurfaceUnavailable);
            return Vec::new();
        }
        let total = items.len();
        let prepared: Vec<Marker> = items
            .into_iter()
            .map(|item| self.prepare(item.coordinate, item.options))
            .collect();
        let ids = prepared.iter().map(|m| m.id.clone()).collect();

        if !options.use_batch || total < self.config.sync_threshold {
            self.insert_group(prepared);
            if let Some(on_complete) = options.on_complete.as_mut() {
                on_complete(BatchProgress::new(total, total));
            }
            if options.enable_cluster {
                self.enable_clustering_all();
            }
            return ids;
        }

        let chunk = options.batch_size.unwrap_or(self.config.chunk_size);
        info!("Scheduling {total} markers in chunks of {chunk}");
        self.jobs.push_back(Job::Insert(InsertJob::new(prepared, chunk, options)));
        ids
    }

    fn finish_insert(&mut self, mut job: InsertJob) {
        if let Some(on_complete) = job.on_complete.as_mut() {
            on_complete(BatchProgress::new(job.total, job.total));
        }
        if job.enable_cluster {
            self.enable_clustering_all();
        }
        info!("Bulk insert of {} markers complete", job.total);
        self.emit(OverlayEvent::BatchCompleted { total: job.total });
    }

    /// Run one chunk of every pending job, in submission order.
    fn run_jobs(&mut self) {
        for _ in 0..self.jobs.len() {
            let Some(job) = self.jobs.pop_front() else {
                break;
            };
            match job {
                Job::Insert(mut job) => {
                    let chunk = job.next_chunk();
                    self.insert_group(chunk);
                    let progress = job.progress();
                    if let Some(on_progress) = job.on_progress.as_mut() {
                        on_progress(progress);
                    }
                    if job.is_done() {
                        self.finish_insert(job);
                    } else {
                        self.jobs.push_back(Job::Insert(job));
                    }
                }
                Job::Visibility(mut job) => {
                    let ids = job.next_chunk();
                    self.apply_visibility(&ids, job.visible, job.delete);
                    if job.ids.is_empty() {
                        debug!("Visibility change for '{}' complete", job.marker_type);
                    } else {
                        self.jobs.push_back(Job::Visibility(job));
                    }
                }
            }
        }
    }

    /// Advance the engine by one frame.
    pub fn on_frame(&mut self) {
        if self.surface.is_none() {
            return;
        }
        if self.queue.is_due(self.clock.now()) {
            self.flush_batch_queue();
        }
        self.run_jobs();
        self.tracks.tick();

        let Some(view) = self.view() else {
            return;
        };
        if self.last_revision != Some(view.revision) {
            self.last_revision = Some(view.revision);
            if self.virtualized.is_some() {
                self.refresh_virtualized();
            }
        }
        for marker_type in std::mem::take(&mut self.stale_clusters) {
            self.update_cluster_layer(&marker_type);
        }
        self.clusters.refresh(view.resolution);
    }

    // ----- removal and update ----------------------------------------------

    /// Remove a marker, including one still waiting in the batch queue.
    pub fn remove_marker(&mut self, id: &str) -> bool {
        let queued = self.queue.remove(id);
        if queued {
            self.reserved.remove(id);
        }
        let live = self.remove_live(id);
        queued || live
    }

    /// Remove a registered marker and its feature; the batch queue is untouched.
    fn remove_live(&mut self, id: &str) -> bool {
        let Some(marker) = self.markers.remove(id) else {
            return false;
        };
        self.order.retain(|m| m != id);
        self.unindex_type(&marker);
        if let Some(layer) = self.layer_mut(marker.layer.as_deref()) {
            layer.source.remove(id);
        }
        self.mark_cluster_stale(marker.layer.as_deref());
        self.emit(OverlayEvent::MarkerRemoved(marker.id));
        true
    }

    fn unindex_type(&mut self, marker: &Marker) {
        if let Some(marker_type) = &marker.marker_type {
            if let Some(ids) = self.by_type.get_mut(marker_type) {
                ids.remove(&marker.id);
                if ids.is_empty() {
                    self.by_type.remove(marker_type);
                }
            }
        }
    }

    /// Remove a set of markers with one pass per layer.
    fn remove_markers(&mut self, ids: &HashSet<String>) -> usize {
        let mut per_layer: HashMap<Option<String>, HashSet<String>> = HashMap::new();
        let mut removed = Vec::new();
        for id in ids {
            if let Some(marker) = self.markers.remove(id) {
                self.unindex_type(&marker);
                per_layer.entry(marker.layer).or_default().insert(marker.id.clone());
                removed.push(marker.id);
            }
        }
        if removed.is_empty() {
            return 0;
        }
        self.order.retain(|id| !ids.contains(id));
        for (destination, layer_ids) in per_layer {
            if let Some(layer) = self.layer_mut(destination.as_deref()) {
                layer.source.remove_many(&layer_ids);
            }
            self.mark_cluster_stale(destination.as_deref());
        }
        self.styles.prune();
        let count = removed.len();
        for id in removed {
            self.emit(OverlayEvent::MarkerRemoved(id));
        }
        count
    }

    /// Change a marker in place. Style patches merge onto the stored options.
    pub fn update_marker(&mut self, id: &str, update: MarkerUpdate) -> bool {
        let position = match (update.coordinate, &self.surface) {
            (Some(coordinate), Some(surface)) => read_surface(surface, |s| s.project(coordinate)),
            _ => None,
        };
        let Some(marker) = self.markers.get_mut(id) else {
            return false;
        };
        let destination = marker.layer.clone();

        if let Some(coordinate) = update.coordinate {
            marker.coordinate = coordinate;
        }
        if let Some(patch) = &update.style {
            let mut merged = marker.style.as_deref().cloned().unwrap_or_default();
            merged.merge(patch);
            marker.style = Some(Arc::new(merged));
        }
        if let Some(data) = &update.data {
            for (key, value) in data {
                marker.data.insert(key.clone(), value.clone());
            }
        }

        let style = (update.style.is_some() && marker.visible)
            .then(|| self.styles.resolve(marker.style.as_ref().unwrap_or(&self.default_style)));
        let layer = match &marker.layer {
            Some(marker_type) => self.type_layers.get_mut(marker_type),
            None => Some(&mut self.default_layer),
        };
        if let Some(feature) = layer.and_then(|l| l.source.get_mut(id)) {
            if let Some(position) = position {
                feature.geometry = Geometry::Point(position);
            }
            if let Some(style) = style {
                feature.style = Some(style);
            }
            if let Some(data) = update.data {
                feature.properties.extend(data);
            }
        }
        if update.style.is_some() {
            self.styles.prune();
        }
        self.mark_cluster_stale(destination.as_deref());
        true
    }

    // ----- visibility -------------------------------------------------------

    /// Show or hide one marker by swapping its style; the feature stays in its layer.
    pub fn toggle_marker_visibility(&mut self, id: &str, visible: bool) -> bool {
        let Some(marker) = self.markers.get_mut(id) else {
            return false;
        };
        marker.visible = visible;
        let destination = marker.layer.clone();
        let style = if visible {
            self.styles
                .resolve(marker.style.as_ref().unwrap_or(&self.default_style))
        } else {
            Arc::clone(&self.invisible)
        };
        let layer = match &marker.layer {
            Some(marker_type) => self.type_layers.get_mut(marker_type),
            None => Some(&mut self.default_layer),
        };
        if let Some(feature) = layer.and_then(|l| l.source.get_mut(id)) {
            feature.style = Some(style);
        }
        self.mark_cluster_stale(destination.as_deref());
        true
    }

    fn apply_visibility(&mut self, ids: &[String], visible: bool, delete: bool) {
        if delete {
            let set: HashSet<String> = ids.iter().cloned().collect();
            self.remove_markers(&set);
        } else {
            for id in ids {
                self.toggle_marker_visibility(id, visible);
            }
        }
    }

    /// Show, hide or delete every marker of a type. Returns how many matched.
    ///
    /// Above the visibility chunk size the work is spread over frames. A new call
    /// for the same type replaces any unfinished one.
    pub fn toggle_marker_visibility_list(&mut self, marker_type: &str, visible: bool, is_delete: bool) -> usize {
        let Some(members) = self.by_type.get(marker_type) else {
            warn!("{}", OverlayError::UnknownType(marker_type.to_string()));
            return 0;
        };
        let ids: Vec<String> = self.order.iter().filter(|id| members.contains(*id)).cloned().collect();
        self.jobs
            .retain(|job| !matches!(job, Job::Visibility(v) if v.marker_type == marker_type));

        let count = ids.len();
        let chunk = self.config.visibility_chunk_size.max(1);
        if count > chunk {
            debug!("Scheduling visibility change for {count} '{marker_type}' markers");
            self.jobs.push_back(Job::Visibility(VisibilityJob {
                marker_type: marker_type.to_string(),
                ids: ids.into(),
                visible,
                delete: is_delete,
                chunk,
            }));
        } else {
            self.apply_visibility(&ids, visible, is_delete);
        }
        count
    }

    /// Toggle a whole type layer with a single surface call.
    pub fn toggle_marker_visibility_by_layer(&mut self, marker_type: &str, visible: bool) -> bool {
        let Some(layer) = self.type_layers.get_mut(marker_type) else {
            warn!("{}", OverlayError::UnknownType(marker_type.to_string()));
            return false;
        };
        layer.visible = visible;
        self.sync_layer_visibility(marker_type);
        true
    }

    /// Push the effective visibility of a type layer to the surface.
    /// A clustered type keeps its raw layer hidden regardless of the requested flag.
    fn sync_layer_visibility(&self, marker_type: &str) {
        let (Some(layer), Some(surface)) = (self.type_layers.get(marker_type), &self.surface) else {
            return;
        };
        let effective = layer.visible && !self.clusters.is_enabled(marker_type);
        write_surface(surface, |s| s.set_layer_visible(layer.id, effective));
    }

    // ----- clustering -------------------------------------------------------

    /// Visible markers of a type layer as a cluster snapshot.
    fn cluster_snapshot(&self, marker_type: &str) -> Vec<ClusterPoint> {
        let Some(layer) = self.type_layers.get(marker_type) else {
            return Vec::new();
        };
        layer
            .source
            .features()
            .iter()
            .filter(|f| !f.style.as_ref().is_some_and(|s| Arc::ptr_eq(s, &self.invisible)))
            .filter_map(|f| {
                Some(ClusterPoint {
                    id: f.id.clone(),
                    position: f.geometry.as_point()?,
                    style: f.style.clone(),
                })
            })
            .collect()
    }

    /// Cluster a type layer and hide its raw markers.
    pub fn enable_clustering(&mut self, marker_type: &str, options: Option<ClusterOptions>) -> bool {
        let Some(layer) = self.type_layers.get(marker_type) else {
            warn!("Cannot cluster: {}", OverlayError::UnknownType(marker_type.to_string()));
            return false;
        };
        let z_index = layer.z_index;
        let points = self.cluster_snapshot(marker_type);
        let options = options.unwrap_or(self.config.cluster);
        let was_enabled = self.clusters.is_enabled(marker_type);

        if !self.clusters.enable(marker_type, points, options, z_index) {
            return false;
        }
        self.sync_layer_visibility(marker_type);
        if let Some(view) = self.view() {
            self.clusters.refresh(view.resolution);
        }
        if !was_enabled {
            self.emit(OverlayEvent::ClusteringChanged {
                marker_type: marker_type.to_string(),
                enabled: true,
            });
        }
        true
    }

    fn enable_clustering_all(&mut self) {
        for marker_type in self.type_order.clone() {
            self.enable_clustering(&marker_type, None);
        }
    }

    /// Drop the cluster layer and show the raw type layer again.
    pub fn disable_clustering(&mut self, marker_type: &str) -> bool {
        if !self.clusters.disable(marker_type) {
            return false;
        }
        self.sync_layer_visibility(marker_type);
        self.emit(OverlayEvent::ClusteringChanged {
            marker_type: marker_type.to_string(),
            enabled: false,
        });
        true
    }

    /// Flip clustering for a type. Returns whether clustering is now on.
    pub fn toggle_clustering(&mut self, marker_type: &str, options: Option<ClusterOptions>) -> bool {
        if self.clusters.is_enabled(marker_type) {
            self.disable_clustering(marker_type);
            false
        } else {
            self.enable_clustering(marker_type, options)
        }
    }

    /// Hand the cluster engine a fresh snapshot of a type's markers.
    pub fn update_cluster_layer(&mut self, marker_type: &str) -> bool {
        let points = self.cluster_snapshot(marker_type);
        self.clusters.update_cluster_layer(marker_type, points)
    }

    // ----- polygons and popups ---------------------------------------------

    /// Draw a filled polygon on the polygon layer. The ring is closed if open.
    pub fn draw_filled_polygon(&mut self, ring: &[LonLat], options: PolygonOptions) -> Option<String> {
        if ring.len() < 3 {
            warn!("{}", OverlayError::InvalidRing(ring.len()));
            return None;
        }
        let Some(surface) = self.surface.clone() else {
            warn!("Cannot draw polygon: {}", OverlayError::SurfaceUnavailable);
            return None;
        };
        let mut points = read_surface(&surface, |s| ring.iter().map(|c| s.project(*c)).collect::<Vec<_>>())?;
        if ring.first() != ring.last() {
            points.push(points[0]);
        }

        let id = match options.id {
            Some(id) => id,
            None => {
                let source = &self.polygon_layer.source;
                self.polygon_ids.generate(|candidate| source.contains(candidate))
            }
        };
        let style = Style {
            fill: Some(Fill::Solid(options.fill_color)),
            stroke: Some(Stroke::new(options.stroke_color, options.stroke_width)),
            ..Style::default()
        };
        self.polygon_layer
            .source
            .add_feature(Feature::new(id.clone(), Geometry::Polygon(points)).with_style(Arc::new(style)));
        debug!("Drew polygon '{id}' with {} vertices", ring.len());
        Some(id)
    }

    pub fn clear_polygons(&mut self) -> usize {
        let count = self.polygon_layer.source.len();
        self.polygon_layer.source.clear();
        count
    }

    /// Open a popup overlay. Reusing an open popup's ID replaces it.
    pub fn open_popup(&mut self, options: PopupOptions) -> Option<String> {
        let Some(surface) = self.surface.clone() else {
            warn!("Cannot open popup: {}", OverlayError::SurfaceUnavailable);
            return None;
        };
        let id = match options.id {
            Some(id) => id,
            None => {
                let popups = &self.popups;
                self.popup_ids.generate(|candidate| popups.iter().any(|p| p == candidate))
            }
        };
        write_surface(&surface, |s| {
            let overlay = Overlay {
                id: id.clone(),
                position: s.project(options.coordinate),
                content: options.content,
                offset: options.offset,
                auto_pan: options.auto_pan,
            };
            s.remove_overlay(&id);
            s.add_overlay(&overlay);
        })?;
        if !self.popups.contains(&id) {
            self.popups.push(id.clone());
        }
        Some(id)
    }

    pub fn close_popup(&mut self, id: &str) -> bool {
        let Some(index) = self.popups.iter().position(|p| p == id) else {
            return false;
        };
        self.popups.remove(index);
        if let Some(surface) = &self.surface {
            write_surface(surface, |s| s.remove_overlay(id));
        }
        true
    }

    pub fn close_all_popups(&mut self) -> usize {
        let popups = std::mem::take(&mut self.popups);
        if let Some(surface) = &self.surface {
            write_surface(surface, |s| {
                for id in &popups {
                    s.remove_overlay(id);
                }
            });
        }
        popups.len()
    }

    // ----- virtualization ---------------------------------------------------

    /// Load only the candidates inside the buffered viewport, then follow the view.
    ///
    /// The loaded-key set survives repeated calls, so a candidate is never
    /// inserted twice while it is tracked. Returns how many markers this pass added.
    pub fn add_markers_virtualized(&mut self, items: Vec<MarkerInput>, options: VirtualizeOptions) -> usize {
        if self.surface.is_none() {
            warn!("Cannot virtualize markers: {}", OverlayError::SurfaceUnavailable);
            return 0;
        }
        let loaded = self.virtualized.take().map(|set| set.loaded).unwrap_or_default();
        let mut set = VirtualSet::new(items, options);
        set.loaded = loaded;
        self.virtualized = Some(set);
        self.refresh_virtualized().map_or(0, |change| change.added.len())
    }

    fn refresh_virtualized(&mut self) -> Option<ViewportChange> {
        let surface = self.surface.clone()?;
        let mut set = self.virtualized.take()?;
        let buffer = set.options.viewport_buffer;
        let Some(bounds) = read_surface(&surface, |s| buffered_bounds(s, &s.view(), buffer)) else {
            self.virtualized = Some(set);
            return None;
        };

        // Markers removed through other paths may be loaded again.
        set.loaded
            .retain(|_, id| self.markers.contains_key(id.as_str()) || self.reserved.contains(id.as_str()));

        let mut visible_keys = HashSet::new();
        let mut fresh = Vec::new();
        for index in set.visible_indices(&bounds) {
            let item = &set.items[index];
            let key = item.key();
            if !visible_keys.insert(key.clone()) || set.loaded.contains_key(&key) {
                continue;
            }
            let marker = self.prepare(item.coordinate, item.options.clone());
            set.loaded.insert(key, marker.id.clone());
            fresh.push(marker);
        }
        let added: Vec<String> = fresh.iter().map(|m| m.id.clone()).collect();
        self.insert_group(fresh);

        let mut removed = Vec::new();
        if set.options.enable_cleanup {
            let evicted: HashSet<String> = set
                .stale_keys(&visible_keys)
                .iter()
                .filter_map(|key| set.loaded.remove(key))
                .collect();
            self.remove_markers(&evicted);
            removed = evicted.into_iter().collect();
            removed.sort();
        }

        let change = ViewportChange {
            visible: visible_keys.len(),
            added,
            removed,
        };
        debug!(
            "Viewport pass: {} visible, {} added, {} evicted",
            change.visible,
            change.added.len(),
            change.removed.len()
        );
        if let Some(callback) = set.options.on_viewport_change.as_mut() {
            callback(&change);
        }
        self.virtualized = Some(set);
        Some(change)
    }

    /// Stop following the viewport and remove every virtualized marker.
    pub fn clear_virtualized(&mut self) -> usize {
        let Some(set) = self.virtualized.take() else {
            return 0;
        };
        let ids: HashSet<String> = set.loaded.into_values().collect();
        self.remove_markers(&ids)
    }

    // ----- bulk clear and teardown -----------------------------------------

    /// Remove every marker of a type together with its layer and cluster layer.
    pub fn clear_markers_by_type(&mut self, marker_type: &str) -> usize {
        let ids = self.by_type.get(marker_type).cloned().unwrap_or_default();
        let removed = self.remove_markers(&ids);
        self.disable_clustering(marker_type);
        if let Some(layer) = self.type_layers.remove(marker_type) {
            if let Some(surface) = &self.surface {
                write_surface(surface, |s| s.remove_layer(layer.id));
            }
            self.type_order.retain(|t| t != marker_type);
        }
        info!("Cleared {removed} '{marker_type}' markers");
        removed
    }

    /// Remove every marker, pending insert and type layer.
    pub fn clear_all_markers(&mut self) {
        self.queue.clear();
        self.jobs.clear();
        self.reserved.clear();
        if let Some(set) = self.virtualized.as_mut() {
            set.loaded.clear();
        }
        for marker_type in std::mem::take(&mut self.type_order) {
            self.clusters.disable(&marker_type);
            if let (Some(layer), Some(surface)) = (self.type_layers.remove(&marker_type), &self.surface) {
                write_surface(surface, |s| s.remove_layer(layer.id));
            }
        }
        self.type_layers.clear();
        self.stale_clusters.clear();
        self.markers.clear();
        self.order.clear();
        self.by_type.clear();
        self.default_layer.source.clear();
        self.styles.prune();
    }

    /// Cancel all pending work, detach every layer and reset to empty.
    ///
    /// Safe on an engine that was never initialized and safe to repeat.
    pub fn destroy(&mut self) {
        // Timers and jobs go first so nothing fires against a torn-down layer.
        self.queue.clear();
        self.jobs.clear();
        self.tracks.destroy();
        self.clusters.destroy();
        self.virtualized = None;
        self.close_all_popups();

        if let Some(surface) = self.surface.take() {
            let mut layer_ids = vec![self.default_layer.id, self.polygon_layer.id];
            layer_ids.extend(self.type_layers.values().map(|l| l.id));
            write_surface(&surface, |s| {
                for id in layer_ids {
                    s.remove_layer(id);
                }
            });
            info!("Marker engine destroyed");
        }

        self.markers.clear();
        self.order.clear();
        self.by_type.clear();
        self.reserved.clear();
        self.type_layers.clear();
        self.type_order.clear();
        self.type_z_offset = 0;
        self.default_layer.source.clear();
        self.polygon_layer.source.clear();
        self.styles.clear();
        self.stale_clusters.clear();
        self.last_revision = None;
    }

    // ----- read-only state --------------------------------------------------

    #[must_use]
    pub fn get_marker(&self, id: &str) -> Option<&Marker> {
        self.markers.get(id)
    }

    /// Live markers in insertion order.
    #[must_use]
    pub fn get_all_markers(&self) -> Vec<&Marker> {
        self.order.iter().filter_map(|id| self.markers.get(id)).collect()
    }

    #[must_use]
    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    #[must_use]
    pub fn markers_by_type(&self, marker_type: &str) -> Vec<&Marker> {
        let Some(members) = self.by_type.get(marker_type) else {
            return Vec::new();
        };
        self.order
            .iter()
            .filter(|id| members.contains(*id))
            .filter_map(|id| self.markers.get(id))
            .collect()
    }

    /// Visible markers within `tolerance_px` pixels of `coordinate`, nearest first.
    #[must_use]
    pub fn markers_near(&self, coordinate: LonLat, tolerance_px: f64) -> Vec<&Marker> {
        let Some(surface) = &self.surface else {
            return Vec::new();
        };
        let Some((center, resolution)) = read_surface(surface, |s| (s.project(coordinate), s.view().resolution)) else {
            return Vec::new();
        };
        let radius = tolerance_px * resolution;
        let search = Extent::from_point(center).buffer(radius);

        let layers = std::iter::once(&self.default_layer).chain(
            self.type_order
                .iter()
                .filter(|t| !self.clusters.is_enabled(t))
                .filter_map(|t| self.type_layers.get(t)),
        );
        let mut hits: Vec<(f64, &Marker)> = Vec::new();
        for layer in layers.filter(|l| l.visible) {
            for feature in layer.source.features_in_extent(&search) {
                let Some(position) = feature.geometry.as_point() else {
                    continue;
                };
                let distance = position.distance(&center);
                if distance > radius {
                    continue;
                }
                if let Some(marker) = self.markers.get(&feature.id).filter(|m| m.visible) {
                    hits.push((distance, marker));
                }
            }
        }
        hits.sort_by(|a, b| a.0.total_cmp(&b.0));
        hits.into_iter().map(|(_, marker)| marker).collect()
    }

    #[must_use]
    pub fn type_layer(&self, marker_type: &str) -> Option<&VectorLayer> {
        self.type_layers.get(marker_type)
    }

    /// Type layers in creation order.
    pub fn type_layers(&self) -> impl Iterator<Item = (&str, &VectorLayer)> {
        self.type_order
            .iter()
            .filter_map(|t| self.type_layers.get(t).map(|l| (t.as_str(), l)))
    }

    #[must_use]
    pub fn default_layer(&self) -> &VectorLayer {
        &self.default_layer
    }

    #[must_use]
    pub fn polygon_layer(&self) -> &VectorLayer {
        &self.polygon_layer
    }

    #[must_use]
    pub fn pending_batch_len(&self) -> usize {
        self.queue.len()
    }

    /// Queued inserts, unfinished chunked jobs or armed track timers.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        !self.queue.is_empty() || !self.jobs.is_empty() || self.tracks.has_pending_timers()
    }

    #[must_use]
    pub fn loaded_virtualized_len(&self) -> usize {
        self.virtualized.as_ref().map_or(0, |set| set.loaded.len())
    }

    #[must_use]
    pub fn popup_ids(&self) -> &[String] {
        &self.popups
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn style_cache(&self) -> &StyleCache {
        &self.styles
    }

    #[must_use]
    pub fn tracks(&self) -> &TrackEngine {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut TrackEngine {
        &mut self.tracks
    }

    #[must_use]
    pub fn clusters(&self) -> &ClusterEngine {
        &self.clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ManualClock;
    use crate::style::ShapeOptions;
    use crate::surface::MemorySurface;
    use crate::track::{TrackOptions, Waypoint};
    use std::sync::{Mutex, RwLock};
    use std::time::Duration;

    struct Fixture {
        engine: MarkerEngine,
        clock: ManualClock,
        memory: Arc<RwLock<MemorySurface>>,
    }

    fn fixture_with(config: EngineConfig) -> Fixture {
        let clock = ManualClock::new();
        let memory = MemorySurface::new(LonLat::new(121.0, 29.0), 10.0, [800.0, 600.0]).shared();
        let mut engine = MarkerEngine::with_clock(config, Arc::new(clock.clone()));
        engine.init(memory.clone());
        Fixture { engine, clock, memory }
    }

    fn fixture() -> Fixture {
        fixture_with(EngineConfig::default())
    }

    fn spread(n: usize, marker_type: &str) -> Vec<MarkerInput> {
        (0..n)
            .map(|i| {
                let offset = i as f64 * 0.0001;
                MarkerInput::new([121.0 + offset, 29.0 + offset], MarkerOptions::typed(marker_type))
            })
            .collect()
    }

    #[test]
    fn test_add_marker_generates_id() {
        let mut fx = fixture();
        let id = fx.engine.add_marker([121.0, 29.0], MarkerOptions::default(), false).unwrap();
        assert!(!id.is_empty());
        let marker = fx.engine.get_marker(&id).unwrap();
        assert_eq!(<[f64; 2]>::from(marker.coordinate), [121.0, 29.0]);
        assert_eq!(fx.engine.default_layer().source.len(), 1);
    }

    #[test]
    fn test_add_marker_without_surface() {
        let mut engine = MarkerEngine::default();
        assert!(engine.add_marker([0.0, 0.0], MarkerOptions::default(), false).is_none());
        assert!(engine.add_markers(spread(3, "x"), BatchOptions::default()).is_empty());
        engine.on_frame();
    }

    #[test]
    fn test_generated_ids_unique_across_paths() {
        let mut fx = fixture();
        let mut seen = HashSet::new();
        for i in 0..100 {
            let id = fx
                .engine
                .add_marker([121.0, 29.0], MarkerOptions::default(), i % 2 == 0)
                .unwrap();
            assert!(seen.insert(id));
        }
        for id in fx.engine.add_markers(spread(50, "v"), BatchOptions::default()) {
            assert!(seen.insert(id));
        }
        fx.engine.flush_batch_queue();
        assert_eq!(fx.engine.marker_count(), 150);
    }

    #[test]
    fn test_type_layers_stack_above_base() {
        let mut fx = fixture();
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("vessel"), false);
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("vehicle"), false);
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("vessel"), false);
        let layers: Vec<_> = fx.engine.type_layers().map(|(t, l)| (t.to_string(), l.z_index)).collect();
        assert_eq!(layers, vec![("vessel".to_string(), 101), ("vehicle".to_string(), 102)]);
        assert_eq!(fx.engine.type_layer("vessel").unwrap().source.len(), 2);
        assert_eq!(fx.memory.read().unwrap().layer_count(), 2 + 2 + 2);
    }

    #[test]
    fn test_batch_queue_flushes_after_idle_window() {
        let mut fx = fixture();
        let id = fx.engine.add_marker([121.0, 29.0], MarkerOptions::default(), true).unwrap();
        assert!(fx.engine.get_marker(&id).is_none());
        assert_eq!(fx.engine.pending_batch_len(), 1);

        fx.clock.advance(Duration::from_millis(10));
        fx.engine.on_frame();
        assert_eq!(fx.engine.pending_batch_len(), 1);

        fx.clock.advance(Duration::from_millis(6));
        fx.engine.on_frame();
        assert!(fx.engine.get_marker(&id).is_some());
        assert!(!fx.engine.has_pending_work());
    }

    #[test]
    fn test_batch_queue_flushes_at_capacity() {
        let mut fx = fixture_with(EngineConfig {
            batch_queue_capacity: 3,
            ..EngineConfig::default()
        });
        let mut rx = fx.engine.subscribe();
        for _ in 0..3 {
            fx.engine.add_marker([121.0, 29.0], MarkerOptions::default(), true);
        }
        assert_eq!(fx.engine.marker_count(), 3);
        assert_eq!(fx.engine.pending_batch_len(), 0);
        let flushed = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|e| e == OverlayEvent::BatchFlushed { count: 3 });
        assert!(flushed);
    }

    #[test]
    fn test_chunked_insert_reports_progress() {
        let mut fx = fixture();
        let progress = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(Mutex::new(None));
        let (p, c) = (Arc::clone(&progress), Arc::clone(&completed));

        let ids = fx.engine.add_markers(
            spread(1500, "vessel"),
            BatchOptions {
                batch_size: Some(1000),
                on_progress: Some(Box::new(move |update: BatchProgress| p.lock().unwrap().push(update))),
                on_complete: Some(Box::new(move |update: BatchProgress| *c.lock().unwrap() = Some(update))),
                ..BatchOptions::default()
            },
        );
        assert_eq!(ids.len(), 1500);
        assert_eq!(fx.engine.marker_count(), 0);

        fx.engine.on_frame();
        assert_eq!(fx.engine.marker_count(), 1000);
        assert!(completed.lock().unwrap().is_none());

        fx.engine.on_frame();
        assert_eq!(fx.engine.get_all_markers().len(), 1500);

        let progress = progress.lock().unwrap();
        assert_eq!(progress.len(), 2);
        assert!((progress[1].percentage - 100.0).abs() < f64::EPSILON);
        let done = completed.lock().unwrap().unwrap();
        assert_eq!(done.processed, 1500);
        // insertion order survives chunking
        assert_eq!(fx.engine.get_all_markers()[1200].id, ids[1200]);
    }

    #[test]
    fn test_batch_and_sync_paths_agree() {
        let mut batched = fixture();
        let mut direct = fixture();
        let mut inputs = spread(50, "vessel");
        inputs.extend(spread(30, "vehicle"));
        inputs.extend((0..10).map(|i| MarkerInput::new([121.0, 29.0 + f64::from(i) * 0.001], MarkerOptions::default())));

        batched.engine.add_markers(inputs.clone(), BatchOptions::default());
        direct.engine.add_markers(
            inputs,
            BatchOptions {
                use_batch: false,
                ..BatchOptions::default()
            },
        );
        for engine in [&batched.engine, &direct.engine] {
            assert_eq!(engine.type_layer("vessel").unwrap().source.len(), 50);
            assert_eq!(engine.type_layer("vehicle").unwrap().source.len(), 30);
            assert_eq!(engine.default_layer().source.len(), 10);
        }
    }

    #[test]
    fn test_chunked_and_sync_paths_agree() {
        let mut chunked = fixture_with(EngineConfig {
            chunk_size: 40,
            ..EngineConfig::default()
        });
        let mut direct = fixture();
        let mut inputs = spread(150, "vessel");
        inputs.extend(spread(70, "vehicle"));

        chunked.engine.add_markers(inputs.clone(), BatchOptions::default());
        while chunked.engine.has_pending_work() {
            chunked.engine.on_frame();
        }
        direct.engine.add_markers(
            inputs,
            BatchOptions {
                use_batch: false,
                ..BatchOptions::default()
            },
        );
        for marker_type in ["vessel", "vehicle"] {
            assert_eq!(
                chunked.engine.type_layer(marker_type).unwrap().source.len(),
                direct.engine.type_layer(marker_type).unwrap().source.len()
            );
        }
        assert_eq!(chunked.engine.marker_count(), 220);
    }

    #[test]
    fn test_visibility_round_trip_restores_style() {
        let mut fx = fixture();
        let style = Arc::new(StyleOptions {
            shape: Some(ShapeOptions {
                points: Some(4),
                ..ShapeOptions::default()
            }),
            ..StyleOptions::default()
        });
        let id = fx
            .engine
            .add_marker([121.0, 29.0], MarkerOptions::default().with_style(style), false)
            .unwrap();
        let before = fx.engine.default_layer().source.get(&id).unwrap().style.clone();

        assert!(fx.engine.toggle_marker_visibility(&id, false));
        let hidden = fx.engine.default_layer().source.get(&id).unwrap().style.clone();
        assert!(hidden.unwrap().is_invisible());
        assert_eq!(fx.engine.default_layer().source.len(), 1);

        assert!(fx.engine.toggle_marker_visibility(&id, true));
        let after = fx.engine.default_layer().source.get(&id).unwrap().style.clone();
        assert!(Arc::ptr_eq(before.as_ref().unwrap(), after.as_ref().unwrap()));
        assert!(!fx.engine.toggle_marker_visibility("missing", true));
    }

    #[test]
    fn test_shared_style_arc_hits_cache() {
        let mut fx = fixture();
        let shared = Arc::new(StyleOptions::default());
        for _ in 0..10 {
            fx.engine.add_marker(
                [121.0, 29.0],
                MarkerOptions::typed("vessel").with_style(Arc::clone(&shared)),
                false,
            );
        }
        assert_eq!(fx.engine.style_cache().stats(), (9, 1));
    }

    #[test]
    fn test_visibility_list_sync_and_chunked() {
        let mut fx = fixture_with(EngineConfig {
            visibility_chunk_size: 10,
            ..EngineConfig::default()
        });
        fx.engine.add_markers(spread(25, "vessel"), BatchOptions { use_batch: false, ..BatchOptions::default() });
        fx.engine.add_markers(spread(5, "vehicle"), BatchOptions::default());

        assert_eq!(fx.engine.toggle_marker_visibility_list("vehicle", false, false), 5);
        assert!(fx.engine.markers_by_type("vehicle").iter().all(|m| !m.visible));

        assert_eq!(fx.engine.toggle_marker_visibility_list("vessel", false, false), 25);
        let hidden = |e: &MarkerEngine| e.markers_by_type("vessel").iter().filter(|m| !m.visible).count();
        assert_eq!(hidden(&fx.engine), 0);
        fx.engine.on_frame();
        assert_eq!(hidden(&fx.engine), 10);
        fx.engine.on_frame();
        fx.engine.on_frame();
        assert_eq!(hidden(&fx.engine), 25);

        assert_eq!(fx.engine.toggle_marker_visibility_list("unknown", true, false), 0);
    }

    #[test]
    fn test_visibility_list_delete_is_chunked() {
        let mut fx = fixture_with(EngineConfig {
            visibility_chunk_size: 10,
            ..EngineConfig::default()
        });
        fx.engine.add_markers(spread(25, "vessel"), BatchOptions::default());
        fx.engine.toggle_marker_visibility_list("vessel", true, true);
        fx.engine.on_frame();
        assert_eq!(fx.engine.marker_count(), 15);
        fx.engine.on_frame();
        fx.engine.on_frame();
        assert_eq!(fx.engine.marker_count(), 0);
        assert!(fx.engine.type_layer("vessel").unwrap().source.is_empty());
    }

    #[test]
    fn test_newer_visibility_request_replaces_pending_one() {
        let mut fx = fixture_with(EngineConfig {
            visibility_chunk_size: 10,
            ..EngineConfig::default()
        });
        fx.engine.add_markers(spread(30, "vessel"), BatchOptions::default());
        fx.engine.toggle_marker_visibility_list("vessel", false, false);
        fx.engine.on_frame();
        fx.engine.toggle_marker_visibility_list("vessel", true, false);
        for _ in 0..5 {
            fx.engine.on_frame();
        }
        assert!(fx.engine.markers_by_type("vessel").iter().all(|m| m.visible));
    }

    #[test]
    fn test_toggle_by_layer_uses_layer_flag() {
        let mut fx = fixture();
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("risk"), false);
        let layer_id = fx.engine.type_layer("risk").unwrap().id;
        assert!(fx.engine.toggle_marker_visibility_by_layer("risk", false));
        assert!(!fx.memory.read().unwrap().layer(layer_id).unwrap().visible);
        assert!(fx.engine.markers_by_type("risk")[0].visible);
        assert!(fx.engine.toggle_marker_visibility_by_layer("risk", true));
        assert!(fx.memory.read().unwrap().layer(layer_id).unwrap().visible);
        assert!(!fx.engine.toggle_marker_visibility_by_layer("nope", true));
    }

    #[test]
    fn test_clustering_hides_raw_layer() {
        let mut fx = fixture();
        let mut rx = fx.engine.subscribe();
        fx.engine.add_markers(spread(5, "vessel"), BatchOptions::default());
        let raw = fx.engine.type_layer("vessel").unwrap().id;

        assert!(fx.engine.enable_clustering("vessel", None));
        assert!(fx.engine.enable_clustering("vessel", None));
        let cluster_layer = fx.engine.clusters().layer("vessel").unwrap().id;
        {
            let surface = fx.memory.read().unwrap();
            assert!(!surface.layer(raw).unwrap().visible);
            assert!(surface.has_layer(cluster_layer));
        }
        let info = fx.engine.clusters().get_cluster_info("vessel").unwrap();
        assert_eq!(info.total_features, 5);
        assert_eq!(info.cluster_count, 1);

        // raw layer stays hidden while clustered even if asked to show
        fx.engine.toggle_marker_visibility_by_layer("vessel", true);
        assert!(!fx.memory.read().unwrap().layer(raw).unwrap().visible);

        assert!(!fx.engine.toggle_clustering("vessel", None));
        {
            let surface = fx.memory.read().unwrap();
            assert!(surface.layer(raw).unwrap().visible);
            assert!(!surface.has_layer(cluster_layer));
        }
        let changes: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, OverlayEvent::ClusteringChanged { .. }))
            .collect();
        assert_eq!(changes.len(), 2);
        assert!(!fx.engine.enable_clustering("unknown", None));
    }

    #[test]
    fn test_cluster_follows_marker_changes() {
        let mut fx = fixture();
        fx.engine.add_markers(spread(3, "vessel"), BatchOptions::default());
        fx.engine.enable_clustering("vessel", None);
        let total = |e: &MarkerEngine| e.clusters().get_cluster_info("vessel").unwrap().total_features;
        assert_eq!(total(&fx.engine), 3);

        let ids = fx.engine.add_markers(spread(2, "vessel"), BatchOptions::default());
        fx.engine.on_frame();
        assert_eq!(total(&fx.engine), 5);

        fx.engine.remove_marker(&ids[0]);
        fx.engine.toggle_marker_visibility(&ids[1], false);
        fx.engine.on_frame();
        assert_eq!(total(&fx.engine), 3);

        // unclustered types are not tracked
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("vehicle"), false);
        assert!(fx.engine.stale_clusters.is_empty());
        assert!(!fx.engine.update_cluster_layer("vehicle"));
    }

    #[test]
    fn test_bulk_insert_can_enable_clustering() {
        let mut fx = fixture();
        fx.engine.add_markers(
            spread(8, "vessel"),
            BatchOptions {
                enable_cluster: true,
                ..BatchOptions::default()
            },
        );
        assert!(fx.engine.clusters().is_enabled("vessel"));
    }

    #[test]
    fn test_update_marker_merges() {
        let mut fx = fixture();
        let id = fx
            .engine
            .add_marker(
                [121.0, 29.0],
                MarkerOptions::typed("vessel").with_data("speed", 10).with_data("name", "A"),
                false,
            )
            .unwrap();
        let mut data = serde_json::Map::new();
        data.insert("speed".to_string(), Value::from(12));
        let updated = fx.engine.update_marker(
            &id,
            MarkerUpdate {
                coordinate: Some(LonLat::new(121.5, 29.5)),
                style: Some(StyleOptions {
                    badge: Some("!".to_string()),
                    ..StyleOptions::default()
                }),
                data: Some(data),
            },
        );
        assert!(updated);

        let marker = fx.engine.get_marker(&id).unwrap();
        assert_eq!(marker.coordinate, LonLat::new(121.5, 29.5));
        assert_eq!(marker.data["speed"], Value::from(12));
        assert_eq!(marker.data["name"], Value::from("A"));

        let feature = fx.engine.type_layer("vessel").unwrap().source.get(&id).unwrap();
        assert_eq!(feature.properties["speed"], Value::from(12));
        assert_eq!(feature.style.as_ref().unwrap().text.as_ref().unwrap().text, "!");
        let expected = crate::geo::WebMercator::project(LonLat::new(121.5, 29.5));
        assert_eq!(feature.geometry.as_point(), Some(expected));
        assert!(!fx.engine.update_marker("missing", MarkerUpdate::default()));
    }

    #[test]
    fn test_remove_marker() {
        let mut fx = fixture();
        let mut rx = fx.engine.subscribe();
        let id = fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("v"), false).unwrap();
        let queued = fx.engine.add_marker([121.0, 29.0], MarkerOptions::default(), true).unwrap();

        assert!(fx.engine.remove_marker(&id));
        assert!(!fx.engine.remove_marker(&id));
        assert!(fx.engine.remove_marker(&queued));
        fx.engine.flush_batch_queue();
        assert_eq!(fx.engine.marker_count(), 0);
        assert!(fx.engine.type_layer("v").unwrap().source.is_empty());
        assert!(fx.engine.markers_by_type("v").is_empty());

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            events,
            vec![
                OverlayEvent::TypeLayerCreated("v".to_string()),
                OverlayEvent::MarkerAdded(id.clone()),
                OverlayEvent::MarkerRemoved(id),
            ]
        );
    }

    #[test]
    fn test_explicit_id_replaces_existing() {
        let mut fx = fixture();
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::default().with_id("m1"), false);
        fx.engine.add_marker([122.0, 29.0], MarkerOptions::default().with_id("m1"), false);
        assert_eq!(fx.engine.marker_count(), 1);
        assert_eq!(fx.engine.get_all_markers().len(), 1);
        assert_eq!(fx.engine.get_marker("m1").unwrap().coordinate.lon, 122.0);
        assert_eq!(fx.engine.default_layer().source.len(), 1);
    }

    #[test]
    fn test_explicit_id_across_queue() {
        let mut fx = fixture();
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::default().with_id("a"), false);
        fx.engine.add_marker([122.0, 29.0], MarkerOptions::default().with_id("a"), true);
        fx.engine.add_marker([123.0, 29.0], MarkerOptions::default().with_id("a"), false);
        assert_eq!(fx.engine.pending_batch_len(), 0);
        assert_eq!(fx.engine.flush_batch_queue(), 0);
        assert_eq!(fx.engine.marker_count(), 1);
        assert_eq!(fx.engine.get_all_markers().len(), 1);
        assert_eq!(fx.engine.get_marker("a").unwrap().coordinate.lon, 123.0);

        // queued copy lands later and replaces the live one
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::default().with_id("b"), false);
        fx.engine.add_marker([124.0, 29.0], MarkerOptions::default().with_id("b"), true);
        assert_eq!(fx.engine.flush_batch_queue(), 1);
        assert_eq!(fx.engine.marker_count(), 2);
        assert_eq!(fx.engine.get_all_markers().len(), 2);
        assert_eq!(fx.engine.get_marker("b").unwrap().coordinate.lon, 124.0);
        assert_eq!(fx.engine.default_layer().source.len(), 2);
    }

    #[test]
    fn test_duplicate_id_within_one_insert() {
        let mut fx = fixture();
        let items = vec![
            MarkerInput::new([121.0, 29.0], MarkerOptions::typed("vessel").with_id("x")),
            MarkerInput::new([121.1, 29.0], MarkerOptions::typed("vehicle").with_id("x")),
        ];
        fx.engine.add_markers(items, BatchOptions::default());
        assert_eq!(fx.engine.marker_count(), 1);
        assert_eq!(fx.engine.get_all_markers().len(), 1);
        assert_eq!(fx.engine.get_marker("x").unwrap().marker_type.as_deref(), Some("vehicle"));
        assert!(fx.engine.type_layer("vessel").unwrap().source.is_empty());
        assert_eq!(fx.engine.type_layer("vehicle").unwrap().source.len(), 1);
        assert!(fx.engine.markers_by_type("vessel").is_empty());

        // same thing through one batch-queue flush
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("vehicle").with_id("y"), true);
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("vessel").with_id("y"), true);
        fx.engine.flush_batch_queue();
        assert_eq!(fx.engine.marker_count(), 2);
        assert_eq!(fx.engine.get_all_markers().len(), 2);
        assert_eq!(fx.engine.type_layer("vehicle").unwrap().source.len(), 1);
        assert_eq!(fx.engine.type_layer("vessel").unwrap().source.len(), 1);
        assert!(fx.engine.type_layer("vessel").unwrap().source.contains("y"));
    }

    #[test]
    fn test_type_layer_z_never_reused() {
        let mut fx = fixture();
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("a"), false);
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("b"), false);
        fx.engine.clear_markers_by_type("a");
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("c"), false);
        assert_eq!(fx.engine.type_layer("b").unwrap().z_index, 102);
        assert_eq!(fx.engine.type_layer("c").unwrap().z_index, 103);

        fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("a"), false);
        assert_eq!(fx.engine.type_layer("a").unwrap().z_index, 104);

        fx.engine.destroy();
        fx.engine.init(fx.memory.clone());
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("d"), false);
        assert_eq!(fx.engine.type_layer("d").unwrap().z_index, 101);
    }

    #[test]
    fn test_clear_by_type_prunes_style_cache() {
        let mut fx = fixture();
        for i in 0..5 {
            let style = Arc::new(StyleOptions {
                z_index: Some(i),
                ..StyleOptions::default()
            });
            fx.engine.add_marker([121.0, 29.0], MarkerOptions::typed("vessel").with_style(style), false);
        }
        assert_eq!(fx.engine.style_cache().len(), 5);
        assert_eq!(fx.engine.clear_markers_by_type("vessel"), 5);
        assert!(fx.engine.style_cache().is_empty());
    }

    #[test]
    fn test_polygon_ring_is_closed() {
        let mut fx = fixture();
        let ring = [LonLat::new(0.0, 0.0), LonLat::new(1.0, 0.0), LonLat::new(1.0, 1.0)];
        let id = fx.engine.draw_filled_polygon(&ring, PolygonOptions::default()).unwrap();
        let feature = fx.engine.polygon_layer().source.get(&id).unwrap();
        match &feature.geometry {
            Geometry::Polygon(points) => {
                assert_eq!(points.len(), 4);
                assert_eq!(points[0], points[3]);
            }
            other => panic!("unexpected geometry {other:?}"),
        }

        let closed = [ring[0], ring[1], ring[2], ring[0]];
        let id = fx.engine.draw_filled_polygon(&closed, PolygonOptions::default()).unwrap();
        assert!(matches!(&fx.engine.polygon_layer().source.get(&id).unwrap().geometry, Geometry::Polygon(p) if p.len() == 4));

        assert!(fx.engine.draw_filled_polygon(&ring[..2], PolygonOptions::default()).is_none());
        assert_eq!(fx.engine.polygon_layer().source.len(), 2);
        assert_eq!(fx.engine.clear_polygons(), 2);
    }

    #[test]
    fn test_virtualized_inserts_are_not_duplicated() {
        let mut fx = fixture();
        let first = vec![
            MarkerInput::new([121.0, 29.0], MarkerOptions::default()),
            MarkerInput::new([121.2, 29.1], MarkerOptions::default().with_id("b")),
            MarkerInput::new([125.0, 29.0], MarkerOptions::default()),
        ];
        assert_eq!(fx.engine.add_markers_virtualized(first.clone(), VirtualizeOptions::default()), 2);

        let mut second = first;
        second.push(MarkerInput::new([121.1, 29.0], MarkerOptions::default()));
        assert_eq!(fx.engine.add_markers_virtualized(second, VirtualizeOptions::default()), 1);
        assert_eq!(fx.engine.marker_count(), 3);
        assert_eq!(fx.engine.loaded_virtualized_len(), 3);

        fx.memory.write().unwrap().set_view(LonLat::new(125.0, 29.0), 10.0);
        fx.engine.on_frame();
        assert_eq!(fx.engine.marker_count(), 1);
        assert_eq!(fx.engine.get_all_markers()[0].coordinate, LonLat::new(125.0, 29.0));

        assert_eq!(fx.engine.clear_virtualized(), 1);
        assert_eq!(fx.engine.marker_count(), 0);
        assert_eq!(fx.engine.loaded_virtualized_len(), 0);
    }

    #[test]
    fn test_virtualized_cap_and_callback() {
        let mut fx = fixture();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let added = fx.engine.add_markers_virtualized(
            spread(20, "vessel"),
            VirtualizeOptions {
                max_visible_markers: 5,
                on_viewport_change: Some(Box::new(move |change: &ViewportChange| sink.lock().unwrap().push(change.clone()))),
                ..VirtualizeOptions::default()
            },
        );
        assert_eq!(added, 5);
        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].visible, 5);
        assert!(changes[0].removed.is_empty());
    }

    #[test]
    fn test_markers_near_nearest_first() {
        let mut fx = fixture();
        let far = fx.engine.add_marker([121.001, 29.0], MarkerOptions::default(), false).unwrap();
        let near = fx.engine.add_marker([121.0001, 29.0], MarkerOptions::typed("v"), false).unwrap();
        fx.engine.add_marker([121.5, 29.0], MarkerOptions::default(), false);

        let hits: Vec<_> = fx
            .engine
            .markers_near(LonLat::new(121.0, 29.0), 5.0)
            .into_iter()
            .map(|m| m.id.clone())
            .collect();
        assert_eq!(hits, vec![near.clone(), far]);

        fx.engine.toggle_marker_visibility(&near, false);
        assert_eq!(fx.engine.markers_near(LonLat::new(121.0, 29.0), 5.0).len(), 1);
    }

    #[test]
    fn test_popups() {
        let mut fx = fixture();
        let id = fx
            .engine
            .open_popup(PopupOptions::new(LonLat::new(121.0, 29.0), "<b>MMSI 1234</b>"))
            .unwrap();
        assert!(fx.memory.read().unwrap().overlay(&id).is_some());

        let mut replacement = PopupOptions::new(LonLat::new(121.0, 29.0), "updated");
        replacement.id = Some(id.clone());
        fx.engine.open_popup(replacement);
        assert_eq!(fx.engine.popup_ids().len(), 1);
        assert_eq!(fx.memory.read().unwrap().overlay(&id).unwrap().content, "updated");

        fx.engine.open_popup(PopupOptions::new(LonLat::new(121.0, 29.0), "second"));
        assert!(fx.engine.close_popup(&id));
        assert!(!fx.engine.close_popup(&id));
        assert_eq!(fx.engine.close_all_popups(), 1);
        assert_eq!(fx.memory.read().unwrap().overlay_count(), 0);
    }

    #[test]
    fn test_clear_markers_by_type() {
        let mut fx = fixture();
        fx.engine.add_markers(spread(10, "vessel"), BatchOptions::default());
        fx.engine.add_markers(spread(4, "vehicle"), BatchOptions::default());
        fx.engine.enable_clustering("vessel", None);

        assert_eq!(fx.engine.clear_markers_by_type("vessel"), 10);
        assert!(fx.engine.type_layer("vessel").is_none());
        assert!(!fx.engine.clusters().is_enabled("vessel"));
        assert_eq!(fx.engine.marker_count(), 4);

        fx.engine.clear_all_markers();
        assert_eq!(fx.engine.marker_count(), 0);
        assert_eq!(fx.engine.type_layers().count(), 0);
        // default + polygon + two track layers
        assert_eq!(fx.memory.read().unwrap().layer_count(), 4);
    }

    #[test]
    fn test_frame_pump_drives_tracks() {
        let mut fx = fixture();
        let waypoints: Vec<Waypoint> = (0..4).map(|i| Waypoint::from([121.0 + f64::from(i) * 0.01, 29.0])).collect();
        fx.engine
            .tracks_mut()
            .generate_track_route(
                waypoints,
                TrackOptions {
                    id: Some("t1".to_string()),
                    animation: true,
                    ..TrackOptions::default()
                },
            )
            .unwrap();
        assert!(fx.engine.has_pending_work());
        fx.clock.advance(Duration::from_millis(1000));
        fx.engine.on_frame();
        assert_eq!(fx.engine.tracks().animation_state("t1").unwrap().current_index(), 2);
    }

    #[test]
    fn test_destroy_cancels_pending_work() {
        let mut fx = fixture();
        fx.engine.add_marker([121.0, 29.0], MarkerOptions::default(), true);
        fx.engine.add_markers(spread(500, "vessel"), BatchOptions::default());
        fx.engine.open_popup(PopupOptions::new(LonLat::new(121.0, 29.0), "x"));

        fx.engine.destroy();
        fx.engine.destroy();
        assert!(!fx.engine.is_initialized());
        assert!(!fx.engine.has_pending_work());

        fx.clock.advance(Duration::from_secs(1));
        fx.engine.on_frame();
        assert_eq!(fx.engine.marker_count(), 0);
        let surface = fx.memory.read().unwrap();
        assert_eq!(surface.layer_count(), 0);
        assert_eq!(surface.overlay_count(), 0);
    }

    #[test]
    fn test_destroy_never_initialized_then_reinit() {
        let mut engine = MarkerEngine::default();
        engine.destroy();
        let memory = MemorySurface::default().shared();
        engine.init(memory.clone());
        assert!(engine.add_marker([0.0, 0.0], MarkerOptions::default(), false).is_some());
        engine.destroy();
        engine.init(memory.clone());
        assert_eq!(engine.marker_count(), 0);
        assert_eq!(memory.read().unwrap().layer_count(), 4);
    }
}
