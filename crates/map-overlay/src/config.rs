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

//! Engine tunables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterOptions;
use crate::id::DEFAULT_MAX_ATTEMPTS;

/// Configuration for the marker engine and the engines it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Batch queue size that forces an immediate flush.
    pub batch_queue_capacity: usize,
    /// Idle window after the last enqueue before the batch queue flushes.
    pub batch_idle_ms: u64,
    /// Markers inserted per frame by chunked bulk inserts.
    pub chunk_size: usize,
    /// Bulk inserts smaller than this run synchronously.
    pub sync_threshold: usize,
    /// Markers touched per frame by chunked visibility changes.
    pub visibility_chunk_size: usize,
    /// ID generation attempts before the timestamp fallback.
    pub id_max_attempts: u32,
    /// Clustering parameters used when none are given.
    pub cluster: ClusterOptions,
    /// Z-index of the default marker layer; type layers stack above it.
    pub base_z_index: i32,
    /// Z-index of the track base layer; the animation layer sits one above.
    pub track_z_index: i32,
    /// Broadcast channel capacity for engine events.
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_queue_capacity: 1000,
            batch_idle_ms: 16,
            chunk_size: 1000,
            sync_threshold: 100,
            visibility_chunk_size: 1000,
            id_max_attempts: DEFAULT_MAX_ATTEMPTS,
            cluster: ClusterOptions::default(),
            base_z_index: 100,
            track_z_index: 900,
            event_channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn batch_idle(&self) -> Duration {
        Duration::from_millis(self.batch_idle_ms)
    }
}
