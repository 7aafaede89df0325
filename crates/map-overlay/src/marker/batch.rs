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

//! Deferred insertion: the debounced batch queue and frame-paced chunked jobs.
//!
//! The queue collects single `use_batch` inserts and flushes when it is full or
//! after an idle window. Jobs carry the remainder of a large bulk operation; the
//! engine runs one chunk of each job per frame, in submission order.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::model::Marker;

/// Progress of a bulk insert.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub processed: usize,
    pub total: usize,
    pub percentage: f64,
}

impl BatchProgress {
    #[must_use]
    pub fn new(processed: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            processed as f64 / total as f64 * 100.0
        };
        Self {
            processed,
            total,
            percentage,
        }
    }
}

pub type ProgressCallback = Box<dyn FnMut(BatchProgress) + Send>;

/// Options for [`super::MarkerEngine::add_markers`].
pub struct BatchOptions {
    /// Chunk large inputs across frames. `false` always inserts synchronously.
    pub use_batch: bool,
    /// Markers per chunk; the engine default when `None`.
    pub batch_size: Option<usize>,
    pub on_progress: Option<ProgressCallback>,
    pub on_complete: Option<ProgressCallback>,
    /// Enable clustering on every type layer once the insert completes.
    pub enable_cluster: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            use_batch: true,
            batch_size: None,
            on_progress: None,
            on_complete: None,
            enable_cluster: false,
        }
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("use_batch", &self.use_batch)
            .field("batch_size", &self.batch_size)
            .field("enable_cluster", &self.enable_cluster)
            .finish_non_exhaustive()
    }
}

/// Debounced queue for single deferred inserts.
#[derive(Debug)]
pub(crate) struct BatchQueue {
    pending: Vec<Marker>,
    ids: HashSet<String>,
    capacity: usize,
    idle: Duration,
    deadline: Option<Instant>,
}

impl BatchQueue {
    pub(crate) fn new(capacity: usize, idle: Duration) -> Self {
        Self {
            pending: Vec::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
            idle,
            deadline: None,
        }
    }

    /// Queue a marker. Returns `true` when the queue is full and must flush now.
    pub(crate) fn push(&mut self, marker: Marker, now: Instant) -> bool {
        self.ids.insert(marker.id.clone());
        self.pending.push(marker);
        // Every enqueue pushes the idle deadline back.
        self.deadline = Some(now + self.idle);
        self.pending.len() >= self.capacity
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|at| at <= now)
    }

    pub(crate) fn remove(&mut self, id: &str) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.pending.retain(|m| m.id != id);
        if self.pending.is_empty() {
            self.deadline = None;
        }
        true
    }

    /// Take everything queued and disarm the idle timer.
    pub(crate) fn drain(&mut self) -> Vec<Marker> {
        self.deadline = None;
        self.ids.clear();
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn clear(&mut self) {
        self.drain();
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Remainder of a chunked bulk insert.
pub(crate) struct InsertJob {
    pub(crate) items: VecDeque<Marker>,
    pub(crate) total: usize,
    pub(crate) processed: usize,
    pub(crate) chunk: usize,
    pub(crate) on_progress: Option<ProgressCallback>,
    pub(crate) on_complete: Option<ProgressCallback>,
    pub(crate) enable_cluster: bool,
}

impl InsertJob {
    pub(crate) fn new(items: Vec<Marker>, chunk: usize, options: BatchOptions) -> Self {
        Self {
            total: items.len(),
            items: items.into(),
            processed: 0,
            chunk: chunk.max(1),
            on_progress: options.on_progress,
            on_complete: options.on_complete,
            enable_cluster: options.enable_cluster,
        }
    }

    pub(crate) fn next_chunk(&mut self) -> Vec<Marker> {
        let n = self.chunk.min(self.items.len());
        self.processed += n;
        self.items.drain(..n).collect()
    }

    pub(crate) fn progress(&self) -> BatchProgress {
        BatchProgress::new(self.processed, self.total)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.items.is_empty()
    }
}

/// Remainder of a chunked show/hide/delete over one type.
#[derive(Debug)]
pub(crate) struct VisibilityJob {
    pub(crate) marker_type: String,
    pub(crate) ids: VecDeque<String>,
    pub(crate) visible: bool,
    pub(crate) delete: bool,
    pub(crate) chunk: usize,
}

impl VisibilityJob {
    pub(crate) fn next_chunk(&mut self) -> Vec<String> {
        let n = self.chunk.min(self.ids.len());
        self.ids.drain(..n).collect()
    }
}

pub(crate) enum Job {
    Insert(InsertJob),
    Visibility(VisibilityJob),
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Insert(job) => f
                .debug_struct("InsertJob")
                .field("processed", &job.processed)
                .field("total", &job.total)
                .finish_non_exhaustive(),
            Job::Visibility(job) => f
                .debug_struct("VisibilityJob")
                .field("marker_type", &job.marker_type)
                .field("remaining", &job.ids.len())
                .finish_non_exhaustive(),
        }
    }
}
