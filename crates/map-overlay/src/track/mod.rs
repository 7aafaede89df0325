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

//! Track replay: static polylines plus progressive-reveal animation.
//!
//! The engine owns two layers. The base layer holds each track's full static line
//! and its start/end markers; the animation layer sits above it and holds the
//! growing replay line and the per-waypoint markers, so labels stay legible over
//! the static line.
//!
//! Each animated track has one [`AnimationState`] in a registry keyed by track ID
//! and one keyed timer. A step re-arms the timer only after its redraw is applied,
//! so steps of one track never overlap. Starting a new animation for an ID cancels
//! the previous one first.

mod animation;

pub use animation::{AnimationOutcome, AnimationSnapshot, AnimationState};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::OverlayError;
use crate::feature::{Feature, Geometry};
use crate::geo::{LonLat, Point};
use crate::id::{IdGenerator, DEFAULT_MAX_ATTEMPTS};
use crate::layer::{LayerKind, VectorLayer};
use crate::schedule::{Clock, SystemClock, Timers};
use crate::style::{Color, Stroke, Style, StyleCache, StyleOptions, Text};
use crate::surface::{read_surface, write_surface, SharedSurface};
use animation::Step;

/// Default delay between two reveal steps.
pub const DEFAULT_STEP: Duration = Duration::from_millis(1000);
/// Poll interval while an animation is paused.
pub const PAUSE_POLL: Duration = Duration::from_millis(100);

const PROP_TRACK_ID: &str = "track_id";
const PROP_ROLE: &str = "role";

/// One point of a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub coordinate: LonLat,
    /// Text drawn next to the waypoint marker.
    pub label: Option<String>,
    /// Longer annotation carried on the marker for hover/popup display.
    pub tip: Option<String>,
}

impl Waypoint {
    #[must_use]
    pub fn new(coordinate: LonLat) -> Self {
        Self {
            coordinate,
            label: None,
            tip: None,
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_tip(mut self, tip: impl Into<String>) -> Self {
        self.tip = Some(tip.into());
        self
    }
}

impl From<[f64; 2]> for Waypoint {
    fn from(value: [f64; 2]) -> Self {
        Self::new(value.into())
    }
}

/// Line appearance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineStyle {
    pub color: Color,
    pub width: f64,
    pub dash: Option<Vec<f64>>,
}

impl LineStyle {
    fn to_style(&self) -> Style {
        Style {
            stroke: Some(Stroke {
                color: self.color,
                width: self.width,
                dash: self.dash.clone(),
            }),
            ..Style::default()
        }
    }
}

/// Options for [`TrackEngine::generate_track_route`].
#[derive(Debug, Clone)]
pub struct TrackOptions {
    /// Explicit track ID; generated when absent.
    pub id: Option<String>,
    pub line: LineStyle,
    pub animated_line: LineStyle,
    pub show_start: bool,
    pub show_end: bool,
    /// Markers on interior waypoints.
    pub show_midpoints: bool,
    pub start_style: Option<Arc<StyleOptions>>,
    pub end_style: Option<Arc<StyleOptions>>,
    pub point_style: Option<Arc<StyleOptions>>,
    /// Launch a progressive-reveal animation after drawing the static line.
    pub animation: bool,
    pub animation_duration: Duration,
    /// Extra attributes copied onto every feature of the track.
    pub data: Map<String, Value>,
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self {
            id: None,
            line: LineStyle {
                color: Color::rgba(24, 144, 255, 160),
                width: 3.0,
                dash: None,
            },
            animated_line: LineStyle {
                color: Color::rgb(255, 77, 79),
                width: 4.0,
                dash: None,
            },
            show_start: true,
            show_end: true,
            show_midpoints: true,
            start_style: None,
            end_style: None,
            point_style: None,
            animation: false,
            animation_duration: DEFAULT_STEP,
            data: Map::new(),
        }
    }
}

/// What [`TrackEngine::generate_track_route`] hands back.
#[derive(Debug)]
pub struct GeneratedTrack {
    pub id: String,
    /// The static line feature as drawn.
    pub line: Feature,
    /// Resolves when the animation finishes or is cancelled; `None` without animation.
    pub completion: Option<oneshot::Receiver<AnimationOutcome>>,
}

#[derive(Debug)]
struct TrackRecord {
    waypoints: Vec<Waypoint>,
    path: Vec<Point>,
    options: TrackOptions,
    hidden: bool,
}

/// Owns every track, its features and its animation state.
#[derive(Debug)]
pub struct TrackEngine {
    surface: Option<SharedSurface>,
    clock: Arc<dyn Clock>,
    base_layer: VectorLayer,
    animation_layer: VectorLayer,
    attached: bool,
    tracks: HashMap<String, TrackRecord>,
    order: Vec<String>,
    animations: HashMap<String, AnimationState>,
    timers: Timers<String>,
    hidden_styles: HashMap<String, Option<Arc<Style>>>,
    styles: StyleCache,
    ids: IdGenerator,
}

fn feature_key(track_id: &str, role: &str) -> String {
    format!("{track_id}:{role}")
}

impl TrackEngine {
    /// Create an engine whose base layer sits at `z_index` and animation layer above it.
    #[must_use]
    pub fn new(z_index: i32) -> Self {
        Self::with_clock(z_index, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(z_index: i32, clock: Arc<dyn Clock>) -> Self {
        Self {
            surface: None,
            clock,
            base_layer: VectorLayer::new("tracks", LayerKind::TrackBase, z_index),
            animation_layer: VectorLayer::new("track-animation", LayerKind::TrackAnimation, z_index + 1),
            attached: false,
            tracks: HashMap::new(),
            order: Vec::new(),
            animations: HashMap::new(),
            timers: Timers::new(),
            hidden_styles: HashMap::new(),
            styles: StyleCache::new(),
            ids: IdGenerator::new("track", DEFAULT_MAX_ATTEMPTS),
        }
    }

    /// Replace the ID generator (deterministic IDs in replays and tests).
    pub fn set_id_generator(&mut self, ids: IdGenerator) {
        self.ids = ids;
    }

    /// Bind to a surface and attach both track layers.
    pub fn init(&mut self, surface: SharedSurface) {
        if self.attached {
            self.detach_layers();
        }
        let base = self.base_layer.info();
        let anim = self.animation_layer.info();
        write_surface(&surface, |s| {
            s.add_layer(&base);
            s.add_layer(&anim);
        });
        self.surface = Some(surface);
        self.attached = true;
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.surface.is_some()
    }

    fn detach_layers(&mut self) {
        if let Some(surface) = &self.surface {
            let (base, anim) = (self.base_layer.id, self.animation_layer.id);
            write_surface(surface, |s| {
                s.remove_layer(base);
                s.remove_layer(anim);
            });
        }
        self.attached = false;
    }

    fn project_path(&self, waypoints: &[Waypoint]) -> Option<Vec<Point>> {
        let surface = self.surface.as_ref()?;
        read_surface(surface, |s| waypoints.iter().map(|w| s.project(w.coordinate)).collect())
    }

    fn resolve(&mut self, options: Option<&Arc<StyleOptions>>, fallback: impl FnOnce() -> Style) -> Arc<Style> {
        match options {
            Some(opts) => self.styles.resolve(opts),
            None => Arc::new(fallback()),
        }
    }

    fn base_feature(track_id: &str, role: &str, geometry: Geometry, data: &Map<String, Value>) -> Feature {
        let mut feature = Feature::new(feature_key(track_id, role), geometry);
        feature.properties.clone_from(data);
        feature
            .properties
            .insert(PROP_TRACK_ID.to_string(), Value::String(track_id.to_string()));
        feature
            .properties
            .insert(PROP_ROLE.to_string(), Value::String(role.split(':').next().unwrap_or(role).to_string()));
        feature
    }

    /// Store the real style aside and apply the invisible one when the track is hidden.
    fn apply_visibility(&mut self, track_id: &str, mut feature: Feature) -> Feature {
        if self.tracks.get(track_id).is_some_and(|t| t.hidden) {
            self.hidden_styles.insert(feature.id.clone(), feature.style.take());
            feature.style = Some(Arc::new(Style::invisible()));
        }
        feature
    }

    fn waypoint_feature(&mut self, track_id: &str, index: usize) -> Option<Feature> {
        let record = self.tracks.get(track_id)?;
        let waypoint = record.waypoints.get(index)?.clone();
        let position = *record.path.get(index)?;
        let data = record.options.data.clone();
        let point_options = record.options.point_style.clone();

        let mut style = (*self.resolve(point_options.as_ref(), || {
            Style::circle(4.0, Color::rgb(255, 255, 255), Some(Stroke::new(Color::rgb(24, 144, 255), 2.0)))
        }))
        .clone();
        if let Some(label) = &waypoint.label {
            style.text = Some(Text {
                text: label.clone(),
                font: "12px sans-serif".to_string(),
                fill: Color::rgb(51, 51, 51),
                stroke: Some(Stroke::new(Color::WHITE, 3.0)),
                offset: [0.0, -14.0],
                background: None,
            });
        }

        let mut feature = Self::base_feature(track_id, &format!("point:{index}"), Geometry::Point(position), &data)
            .with_style(Arc::new(style))
            .with_property("index", index);
        if let Some(label) = waypoint.label {
            feature.properties.insert("label".to_string(), Value::String(label));
        }
        if let Some(tip) = waypoint.tip {
            feature.properties.insert("tip".to_string(), Value::String(tip));
        }
        Some(self.apply_visibility(track_id, feature))
    }

    /// Draw a track and optionally start replaying it.
    ///
    /// Returns `None` (with a warning) for fewer than 2 waypoints or when no
    /// surface is bound. Reusing an ID replaces that track, cancelling its
    /// running animation first.
    pub fn generate_track_route(&mut self, waypoints: Vec<Waypoint>, mut options: TrackOptions) -> Option<GeneratedTrack> {
        if waypoints.len() < 2 {
            warn!("{}", OverlayError::InsufficientWaypoints(waypoints.len()));
            return None;
        }
        if self.surface.is_none() {
            warn!("Cannot generate track: {}", OverlayError::SurfaceUnavailable);
            return None;
        }

        let id = match options.id.take() {
            Some(id) => id,
            None => {
                let tracks = &self.tracks;
                self.ids.generate(|candidate| tracks.contains_key(candidate))
            }
        };

        if self.tracks.contains_key(&id) || self.animations.contains_key(&id) {
            debug!("Replacing existing track '{id}'");
            self.purge(&id);
        }

        let path = self.project_path(&waypoints)?;
        let animate = options.animation;
        let step = options.animation_duration;

        let line_style = Arc::new(options.line.to_style());
        let line = Self::base_feature(&id, "line", Geometry::LineString(path.clone()), &options.data).with_style(line_style);

        let mut base_features = vec![line.clone()];
        if options.show_start {
            let style = self.resolve(options.start_style.as_ref(), || {
                Style::circle(7.0, Color::rgb(82, 196, 26), Some(Stroke::new(Color::WHITE, 2.0)))
            });
            base_features.push(
                Self::base_feature(&id, "start", Geometry::Point(path[0]), &options.data).with_style(style),
            );
        }
        if options.show_end {
            let style = self.resolve(options.end_style.as_ref(), || {
                Style::circle(7.0, Color::rgb(245, 34, 45), Some(Stroke::new(Color::WHITE, 2.0)))
            });
            base_features.push(
                Self::base_feature(&id, "end", Geometry::Point(path[path.len() - 1]), &options.data).with_style(style),
            );
        }
        self.base_layer.source.add_features(base_features);

        let show_midpoints = options.show_midpoints;
        let total = waypoints.len();
        self.tracks.insert(
            id.clone(),
            TrackRecord {
                waypoints,
                path,
                options,
                hidden: false,
            },
        );
        self.order.push(id.clone());

        if show_midpoints && !animate {
            let points: Vec<Feature> = (1..total - 1).filter_map(|i| self.waypoint_feature(&id, i)).collect();
            self.animation_layer.source.add_features(points);
        }

        info!("Generated track '{id}' with {total} waypoints");

        let completion = if animate {
            self.start_track_route_animation(&id, Some(step))
        } else {
            None
        };

        Some(GeneratedTrack { id, line, completion })
    }

    /// Start (or restart) the progressive reveal of an existing track.
    pub fn start_track_route_animation(
        &mut self,
        track_id: &str,
        step: Option<Duration>,
    ) -> Option<oneshot::Receiver<AnimationOutcome>> {
        if self.surface.is_none() {
            warn!("Cannot animate track: {}", OverlayError::SurfaceUnavailable);
            return None;
        }
        let Some(record) = self.tracks.get(track_id) else {
            warn!("{}", OverlayError::UnknownTrack(track_id.to_string()));
            return None;
        };
        let step = step.unwrap_or(record.options.animation_duration);
        let total = record.path.len();
        let anim_style = Arc::new(record.options.animated_line.to_style());
        let data = record.options.data.clone();

        // Cancel before replace: at most one animation per track.
        self.stop_track_animation_by_id(track_id);
        let prefix = format!("{track_id}:point:");
        self.animation_layer.source.remove_where(|f| f.id.starts_with(&prefix));

        let line = Self::base_feature(track_id, "animation", Geometry::LineString(Vec::new()), &data).with_style(anim_style);
        let line = self.apply_visibility(track_id, line);
        self.animation_layer.source.add_feature(line);

        let (state, rx) = AnimationState::new(track_id.to_string(), total, step);
        self.animations.insert(track_id.to_string(), state);
        debug!("Animation started for '{track_id}' ({total} steps, {}ms each)", step.as_millis());

        let now = self.clock.now();
        self.run_step(track_id, now);
        Some(rx)
    }

    /// Fire every due animation step. Call once per frame.
    pub fn tick(&mut self) {
        if self.timers.is_empty() {
            return;
        }
        let now = self.clock.now();
        for track_id in self.timers.take_due(now) {
            self.run_step(&track_id, now);
        }
    }

    fn run_step(&mut self, track_id: &str, now: std::time::Instant) {
        let Some(state) = self.animations.get_mut(track_id) else {
            return;
        };
        if !state.is_playing() {
            return;
        }
        let step = state.step_duration();

        match state.advance() {
            Step::Held => {
                self.timers.arm(track_id.to_string(), now + PAUSE_POLL);
            }
            Step::Done => {
                info!("Animation finished for '{track_id}'");
                self.end_animation(track_id, AnimationOutcome::Finished);
            }
            Step::Revealed(index) => {
                let prefix: Option<Vec<Point>> = self.tracks.get(track_id).map(|t| t.path[..=index].to_vec());
                if let Some(prefix) = prefix {
                    let key = feature_key(track_id, "animation");
                    if let Some(line) = self.animation_layer.source.get_mut(&key) {
                        line.geometry = Geometry::LineString(prefix);
                    }
                }
                let reveal_point = self.tracks.get(track_id).is_some_and(|t| {
                    t.options.show_midpoints && index > 0 && index + 1 < t.path.len()
                });
                if reveal_point {
                    if let Some(point) = self.waypoint_feature(track_id, index) {
                        self.animation_layer.source.add_feature(point);
                    }
                }
                self.timers.arm(track_id.to_string(), now + step);
            }
        }
    }

    /// Discard an animation, remove its replay line and resolve its handle.
    fn end_animation(&mut self, track_id: &str, outcome: AnimationOutcome) -> bool {
        self.timers.cancel(&track_id.to_string());
        let Some(mut state) = self.animations.remove(track_id) else {
            return false;
        };
        let key = feature_key(track_id, "animation");
        self.animation_layer.source.remove(&key);
        self.hidden_styles.remove(&key);
        state.complete(outcome);
        true
    }

    pub fn pause_track_animation_by_id(&mut self, track_id: &str) -> bool {
        self.animations.get_mut(track_id).is_some_and(AnimationState::pause)
    }

    pub fn resume_track_animation_by_id(&mut self, track_id: &str) -> bool {
        self.animations.get_mut(track_id).is_some_and(AnimationState::resume)
    }

    pub fn toggle_track_animation_by_id(&mut self, track_id: &str) -> bool {
        match self.animations.get_mut(track_id) {
            Some(state) => {
                state.toggle();
                true
            }
            None => false,
        }
    }

    /// Stop and discard the animation for `track_id`; the static line stays.
    pub fn stop_track_animation_by_id(&mut self, track_id: &str) -> bool {
        let stopped = self.end_animation(track_id, AnimationOutcome::Cancelled);
        if stopped {
            debug!("Animation stopped for '{track_id}'");
        }
        stopped
    }

    fn animated_ids(&self) -> Vec<String> {
        self.animations.keys().cloned().collect()
    }

    /// Pause every running animation. Returns how many changed state.
    pub fn pause_all(&mut self) -> usize {
        let mut paused = 0;
        for state in self.animations.values_mut() {
            if state.pause() {
                paused += 1;
            }
        }
        paused
    }

    pub fn resume_all(&mut self) -> usize {
        let mut resumed = 0;
        for state in self.animations.values_mut() {
            if state.resume() {
                resumed += 1;
            }
        }
        resumed
    }

    pub fn toggle_all(&mut self) -> usize {
        for state in self.animations.values_mut() {
            state.toggle();
        }
        self.animations.len()
    }

    pub fn stop_all(&mut self) -> usize {
        self.animated_ids()
            .iter()
            .filter(|id| self.stop_track_animation_by_id(id))
            .count()
    }

    /// Show or hide every feature of a track by swapping styles.
    pub fn show_track_route(&mut self, track_id: &str, visible: bool) -> bool {
        let Some(record) = self.tracks.get_mut(track_id) else {
            return false;
        };
        if record.hidden == !visible {
            return true;
        }
        record.hidden = !visible;

        let hidden_styles = &mut self.hidden_styles;
        for layer in [&mut self.base_layer, &mut self.animation_layer] {
            for feature in layer.source.features_mut() {
                if feature.property_str(PROP_TRACK_ID) != Some(track_id) {
                    continue;
                }
                if visible {
                    if let Some(original) = hidden_styles.remove(&feature.id) {
                        feature.style = original;
                    }
                } else {
                    hidden_styles.insert(feature.id.clone(), feature.style.take());
                    feature.style = Some(Arc::new(Style::invisible()));
                }
            }
        }
        true
    }

    /// Remove all traces of a track from the engine.
    fn purge(&mut self, track_id: &str) -> bool {
        let had_animation = self.end_animation(track_id, AnimationOutcome::Cancelled);
        let removed_record = self.tracks.remove(track_id).is_some();
        self.order.retain(|id| id != track_id);

        let owned = |f: &Feature| f.property_str(PROP_TRACK_ID) == Some(track_id);
        let mut removed_ids: HashSet<String> = HashSet::new();
        for layer in [&mut self.base_layer, &mut self.animation_layer] {
            for f in layer.source.features() {
                if owned(f) {
                    removed_ids.insert(f.id.clone());
                }
            }
            layer.source.remove_where(owned);
        }
        self.hidden_styles.retain(|k, _| !removed_ids.contains(k));
        had_animation || removed_record
    }

    /// Remove a track, cancelling its animation. Returns the removed ID.
    pub fn remove_track_route(&mut self, track_id: &str) -> Option<String> {
        if self.purge(track_id) {
            info!("Removed track '{track_id}'");
            Some(track_id.to_string())
        } else {
            None
        }
    }

    /// Remove every track.
    pub fn clear_tracks(&mut self) {
        self.timers.clear();
        for id in self.animated_ids() {
            self.end_animation(&id, AnimationOutcome::Cancelled);
        }
        self.base_layer.source.clear();
        self.animation_layer.source.clear();
        self.tracks.clear();
        self.order.clear();
        self.hidden_styles.clear();
    }

    /// Cancel all timers, resolve all handles, detach layers and reset.
    pub fn destroy(&mut self) {
        self.clear_tracks();
        self.detach_layers();
        self.styles.clear();
        self.surface = None;
    }

    #[must_use]
    pub fn track_ids(&self) -> &[String] {
        &self.order
    }

    #[must_use]
    pub fn has_track(&self, track_id: &str) -> bool {
        self.tracks.contains_key(track_id)
    }

    #[must_use]
    pub fn waypoints(&self, track_id: &str) -> Option<&[Waypoint]> {
        self.tracks.get(track_id).map(|t| t.waypoints.as_slice())
    }

    #[must_use]
    pub fn animation_state(&self, track_id: &str) -> Option<&AnimationState> {
        self.animations.get(track_id)
    }

    /// Snapshot of every live animation.
    #[must_use]
    pub fn animation_states(&self) -> Vec<AnimationSnapshot> {
        let mut states: Vec<_> = self.animations.values().map(AnimationState::snapshot).collect();
        states.sort_by(|a, b| a.track_id.cmp(&b.track_id));
        states
    }

    #[must_use]
    pub fn base_layer(&self) -> &VectorLayer {
        &self.base_layer
    }

    #[must_use]
    pub fn animation_layer(&self) -> &VectorLayer {
        &self.animation_layer
    }

    #[must_use]
    pub fn has_pending_timers(&self) -> bool {
        !self.timers.is_empty()
    }
}
