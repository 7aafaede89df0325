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

use std::collections::VecDeque;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use map_overlay::{AnimationOutcome, OverlayEvent};

const MAX_DIAGNOSTICS: usize = 50;

/// Diagnostic message with timestamp
#[derive(Debug, Clone)]
pub struct DiagnosticMessage {
    pub timestamp: DateTime<Utc>,
    pub level: DiagnosticLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiagnosticLevel {
    Info,
    Warning,
}

/// Counters and timings for one map session
#[derive(Debug)]
pub struct SessionStatus {
    pub started_at: DateTime<Utc>,

    // Frame pump
    pub frames: u64,
    pub last_frame_ms: f64,
    pub average_frame_ms: f64,

    // Engine events
    pub markers_added: u64,
    pub markers_removed: u64,
    pub batch_flushes: u64,
    pub batches_completed: u64,
    pub type_layers: Vec<String>,

    // Track replays
    pub tracks_finished: usize,
    pub tracks_cancelled: usize,

    // Diagnostic messages (keep last 50)
    pub diagnostics: VecDeque<DiagnosticMessage>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStatus {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            frames: 0,
            last_frame_ms: 0.0,
            average_frame_ms: 0.0,
            markers_added: 0,
            markers_removed: 0,
            batch_flushes: 0,
            batches_completed: 0,
            type_layers: Vec::new(),
            tracks_finished: 0,
            tracks_cancelled: 0,
            diagnostics: VecDeque::with_capacity(MAX_DIAGNOSTICS),
        }
    }

    /// Add a diagnostic message
    pub fn add_diagnostic(&mut self, level: DiagnosticLevel, message: String) {
        self.diagnostics.push_back(DiagnosticMessage {
            timestamp: Utc::now(),
            level,
            message,
        });

        while self.diagnostics.len() > MAX_DIAGNOSTICS {
            self.diagnostics.pop_front();
        }
    }

    /// Record one pumped frame
    pub fn record_frame(&mut self, duration_ms: f64) {
        self.frames += 1;
        self.last_frame_ms = duration_ms;

        const ALPHA: f64 = 0.1;
        if self.average_frame_ms == 0.0 {
            self.average_frame_ms = duration_ms;
        } else {
            self.average_frame_ms = ALPHA * duration_ms + (1.0 - ALPHA) * self.average_frame_ms;
        }
    }

    pub fn record_event(&mut self, event: &OverlayEvent) {
        match event {
            OverlayEvent::MarkerAdded(_) => self.markers_added += 1,
            OverlayEvent::MarkerRemoved(_) => self.markers_removed += 1,
            OverlayEvent::BatchFlushed { count } => {
                self.batch_flushes += 1;
                self.add_diagnostic(DiagnosticLevel::Info, format!("Flushed {count} queued markers"));
            }
            OverlayEvent::BatchCompleted { total } => {
                self.batches_completed += 1;
                self.add_diagnostic(DiagnosticLevel::Info, format!("Bulk insert of {total} markers complete"));
            }
            OverlayEvent::TypeLayerCreated(marker_type) => {
                self.type_layers.push(marker_type.clone());
                self.add_diagnostic(DiagnosticLevel::Info, format!("Created layer for '{marker_type}'"));
            }
            OverlayEvent::ClusteringChanged { marker_type, enabled } => {
                let state = if *enabled { "enabled" } else { "disabled" };
                self.add_diagnostic(DiagnosticLevel::Info, format!("Clustering {state} for '{marker_type}'"));
            }
        }
    }

    /// Events dropped because the receiver fell behind
    pub fn record_lag(&mut self, skipped: u64) {
        self.add_diagnostic(DiagnosticLevel::Warning, format!("Event receiver lagged, {skipped} events skipped"));
    }

    pub fn record_track_outcome(&mut self, track_id: &str, outcome: AnimationOutcome) {
        match outcome {
            AnimationOutcome::Finished => self.tracks_finished += 1,
            AnimationOutcome::Cancelled => {
                self.tracks_cancelled += 1;
                self.add_diagnostic(DiagnosticLevel::Warning, format!("Replay of {track_id} cancelled"));
            }
        }
    }

    /// Multi-line report printed at shutdown
    pub fn summary(&self) -> String {
        let elapsed = (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0;
        let mut out = String::new();
        let _ = writeln!(out, "Session started {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(
            out,
            "Frames: {} in {elapsed:.1}s (last {:.2} ms, avg {:.2} ms)",
            self.frames, self.last_frame_ms, self.average_frame_ms
        );
        let _ = writeln!(
            out,
            "Markers: {} added, {} removed, {} flushes, {} bulk inserts",
            self.markers_added, self.markers_removed, self.batch_flushes, self.batches_completed
        );
        let _ = writeln!(out, "Type layers: {}", self.type_layers.join(", "));
        let _ = writeln!(
            out,
            "Tracks: {} finished, {} cancelled",
            self.tracks_finished, self.tracks_cancelled
        );
        let warnings = self
            .diagnostics
            .iter()
            .filter(|d| d.level == DiagnosticLevel::Warning)
            .count();
        let _ = write!(out, "Diagnostics: {} ({warnings} warnings)", self.diagnostics.len());
        for diagnostic in self.diagnostics.iter().skip(self.diagnostics.len().saturating_sub(5)) {
            let _ = write!(
                out,
                "\n  [{}] {:?}: {}",
                diagnostic.timestamp.format("%H:%M:%S"),
                diagnostic.level,
                diagnostic.message
            );
        }
        out
    }
}
