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

//! Collision-checked ID generation for markers and tracks.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use log::warn;
use uuid::Uuid;

/// Default number of attempts before falling back to a timestamp-suffixed ID.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

static FALLBACK_SEQ: AtomicU64 = AtomicU64::new(0);

type IdSource = Box<dyn FnMut() -> String + Send>;

/// Generates short random IDs with a fixed prefix, retrying on collision.
pub struct IdGenerator {
    prefix: String,
    max_attempts: u32,
    source: IdSource,
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator")
            .field("prefix", &self.prefix)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl IdGenerator {
    #[must_use]
    pub fn new(prefix: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            prefix: prefix.into(),
            max_attempts,
            source: Box::new(|| {
                let mut buf = Uuid::encode_buffer();
                let simple = Uuid::new_v4().simple().encode_lower(&mut buf);
                simple[..12].to_string()
            }),
        }
    }

    /// Replace the random part with a custom source (deterministic replays, tests).
    #[must_use]
    pub fn with_source<F>(mut self, source: F) -> Self
    where
        F: FnMut() -> String + Send + 'static,
    {
        self.source = Box::new(source);
        self
    }

    /// Produce an ID for which `taken` returns false.
    ///
    /// After `max_attempts` collisions the ID gets a millisecond timestamp and a
    /// process-wide sequence suffix, which is logged.
    pub fn generate<F>(&mut self, mut taken: F) -> String
    where
        F: FnMut(&str) -> bool,
    {
        let mut last = String::new();
        for _ in 0..self.max_attempts {
            let candidate = format!("{}_{}", self.prefix, (self.source)());
            if !taken(&candidate) {
                return candidate;
            }
            last = candidate;
        }

        let mut fallback;
        loop {
            let seq = FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed);
            fallback = format!("{}_{}_{}", last, Utc::now().timestamp_millis(), seq);
            if !taken(&fallback) {
                break;
            }
        }
        warn!(
            "Could not generate a unique {} ID after {} attempts, using {}",
            self.prefix, self.max_attempts, fallback
        );
        fallback
    }
}
