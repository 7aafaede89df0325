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

//! Error type shared by the engines.
//!
//! Engine operations never return these to the caller: a precondition failure is
//! logged as a warning and the operation becomes a no-op. The type exists so the
//! log lines are uniform and so the fallible parsers have something to return.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("map surface is not initialized")]
    SurfaceUnavailable,

    #[error("track needs at least 2 waypoints, got {0}")]
    InsufficientWaypoints(usize),

    #[error("polygon needs at least 3 points, got {0}")]
    InvalidRing(usize),

    #[error("no layer for type '{0}'")]
    UnknownType(String),

    #[error("no track with id '{0}'")]
    UnknownTrack(String),

    #[error("invalid GeoJSON: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("GeoJSON input is not a FeatureCollection")]
    NotAFeatureCollection,
}

/// Convenience alias for fallible helpers.
pub type Result<T> = std::result::Result<T, OverlayError>;
