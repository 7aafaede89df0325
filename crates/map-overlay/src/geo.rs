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

//! Geographic and projected coordinate primitives.
//!
//! Markers are always addressed in geographic `[lon, lat]` order. The rendering
//! surface works in projected Web Mercator metres, so conversion happens when a
//! feature is written and the geographic value stays the source of truth.

use serde::{Deserialize, Serialize};

/// Web Mercator sphere radius in metres (EPSG:3857).
const EARTH_RADIUS_M: f64 = 6_378_137.0;
/// Latitude limit of the Web Mercator square.
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;
/// Tile edge in pixels, used for the zoom to resolution mapping.
const TILE_SIZE_PX: f64 = 256.0;

/// Geographic coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LonLat {
    pub lon: f64,
    pub lat: f64,
}

impl LonLat {
    #[must_use]
    pub const fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Stable text key for a coordinate, used when a marker has no explicit ID.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{:.6},{:.6}", self.lon, self.lat)
    }
}

impl From<[f64; 2]> for LonLat {
    fn from(value: [f64; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl From<LonLat> for [f64; 2] {
    fn from(value: LonLat) -> Self {
        [value.lon, value.lat]
    }
}

/// Projected surface coordinate (metres for Web Mercator).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned bounding box in any planar coordinate system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    #[must_use]
    pub const fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Degenerate extent covering a single point.
    #[must_use]
    pub const fn from_point(p: Point) -> Self {
        Self::new(p.x, p.y, p.x, p.y)
    }

    /// An extent that contains nothing and grows with [`Extent::extend`].
    #[must_use]
    pub const fn empty() -> Self {
        Self::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    #[must_use]
    pub fn buffer(&self, amount: f64) -> Self {
        Self::new(
            self.min_x - amount,
            self.min_y - amount,
            self.max_x + amount,
            self.max_y + amount,
        )
    }

    pub fn extend(&mut self, p: Point) {
        self.min_x = self.min_x.min(p.x);
        self.min_y = self.min_y.min(p.y);
        self.max_x = self.max_x.max(p.x);
        self.max_y = self.max_y.max(p.y);
    }

    #[must_use]
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    #[must_use]
    pub fn contains_lon_lat(&self, c: LonLat) -> bool {
        self.contains(Point::new(c.lon, c.lat))
    }

    #[must_use]
    pub fn center(&self) -> Point {
        Point::new(
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Spherical Web Mercator (EPSG:3857) projection.
#[derive(Debug, Clone, Copy)]
pub struct WebMercator;

impl WebMercator {
    /// Project a geographic coordinate into metres.
    #[must_use]
    pub fn project(c: LonLat) -> Point {
        let lat = c.lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
        let x = EARTH_RADIUS_M * c.lon.to_radians();
        let y = EARTH_RADIUS_M * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
        Point::new(x, y)
    }

    /// Convert projected metres back to degrees.
    #[must_use]
    pub fn unproject(p: Point) -> LonLat {
        let lon = (p.x / EARTH_RADIUS_M).to_degrees();
        let lat = (2.0 * (p.y / EARTH_RADIUS_M).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
        LonLat::new(lon, lat)
    }

    /// Metres per pixel at the equator for a (possibly fractional) zoom level.
    #[must_use]
    pub fn resolution_for_zoom(zoom: f64) -> f64 {
        let world = 2.0 * std::f64::consts::PI * EARTH_RADIUS_M;
        world / (TILE_SIZE_PX * 2_f64.powf(zoom))
    }
}
