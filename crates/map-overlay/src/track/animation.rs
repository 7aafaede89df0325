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

//! Per-track playback state machine.
//!
//! One [`AnimationState`] exists per animated track. It only knows its index and
//! flags; the engine owns the timer that drives it and applies each reveal to the
//! animation layer. Completion is always explicit through [`AnimationState::complete`],
//! so the caller's completion receiver resolves on every path (finish, stop,
//! replacement, removal, destroy).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// How an animation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnimationOutcome {
    /// Playback reached the last waypoint.
    Finished,
    /// Stopped, replaced, removed or torn down before the end.
    Cancelled,
}

/// Result of advancing the state by one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Waypoint at this index is now revealed.
    Revealed(usize),
    /// Every waypoint has been revealed.
    Done,
    /// Paused; poll again later.
    Held,
}

/// Read-only view of a running animation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimationSnapshot {
    pub track_id: String,
    pub current_index: usize,
    pub total: usize,
    pub playing: bool,
    pub paused: bool,
}

#[derive(Debug)]
pub struct AnimationState {
    track_id: String,
    total: usize,
    current_index: usize,
    playing: bool,
    paused: bool,
    step: Duration,
    completion: Option<oneshot::Sender<AnimationOutcome>>,
}

impl AnimationState {
    pub(crate) fn new(track_id: String, total: usize, step: Duration) -> (Self, oneshot::Receiver<AnimationOutcome>) {
        let (tx, rx) = oneshot::channel();
        let state = Self {
            track_id,
            total,
            current_index: 0,
            playing: true,
            paused: false,
            step,
            completion: Some(tx),
        };
        (state, rx)
    }

    #[must_use]
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[must_use]
    pub fn step_duration(&self) -> Duration {
        self.step
    }

    /// Returns `false` if already paused.
    pub fn pause(&mut self) -> bool {
        if self.paused {
            return false;
        }
        self.paused = true;
        true
    }

    /// Returns `false` if not paused.
    pub fn resume(&mut self) -> bool {
        if !self.paused {
            return false;
        }
        self.paused = false;
        true
    }

    pub fn toggle(&mut self) {
        self.paused = !self.paused;
    }

    pub(crate) fn advance(&mut self) -> Step {
        if self.paused {
            return Step::Held;
        }
        if self.current_index >= self.total {
            return Step::Done;
        }
        let revealed = self.current_index;
        self.current_index += 1;
        Step::Revealed(revealed)
    }

    /// Resolve the completion handle and mark the state stopped.
    pub(crate) fn complete(&mut self, outcome: AnimationOutcome) {
        self.playing = false;
        if let Some(tx) = self.completion.take() {
            // Receiver may have been dropped by a caller that does not care.
            let _ = tx.send(outcome);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> AnimationSnapshot {
        AnimationSnapshot {
            track_id: self.track_id.clone(),
            current_index: self.current_index,
            total: self.total,
            playing: self.playing,
            paused: self.paused,
        }
    }
}
