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

//! CSV marker import.
//!
//! Expected header: `id,type,lon,lat,label`. The `id` and `label` columns may
//! be empty. Rows with coordinates outside the valid range are skipped.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::{info, warn};
use map_overlay::{LonLat, MarkerInput, MarkerOptions};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to open marker file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed marker row: {0}")]
    Csv(#[from] csv::Error),
}

/// One row of a marker CSV file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarkerRecord {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub marker_type: String,

    pub lon: f64,

    pub lat: f64,

    #[serde(default)]
    pub label: Option<String>,
}

impl MarkerRecord {
    fn has_valid_coordinate(&self) -> bool {
        self.lon.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lon)
            && (-90.0..=90.0).contains(&self.lat)
    }

    pub fn into_input(self) -> MarkerInput {
        let mut options = MarkerOptions::typed(self.marker_type);
        if let Some(id) = self.id.filter(|id| !id.is_empty()) {
            options = options.with_id(id);
        }
        if let Some(label) = self.label.filter(|label| !label.is_empty()) {
            options = options.with_data("label", label);
        }
        MarkerInput::new(LonLat::new(self.lon, self.lat), options)
    }
}

/// Parse marker rows from any reader.
pub fn read_markers<R: Read>(reader: R) -> Result<Vec<MarkerInput>, LoadError> {
    let mut csv_reader = csv::Reader::from_reader(reader);

    let mut markers = Vec::new();
    for (row, result) in csv_reader.deserialize().enumerate() {
        let record: MarkerRecord = result?;
        if !record.has_valid_coordinate() {
            warn!("Skipping marker row {}: invalid coordinate ({}, {})", row + 1, record.lon, record.lat);
            continue;
        }
        markers.push(record.into_input());
    }
    Ok(markers)
}

/// Load markers from a CSV file.
pub fn load_markers<P: AsRef<Path>>(path: P) -> Result<Vec<MarkerInput>, LoadError> {
    let file = File::open(path)?;
    let markers = read_markers(BufReader::new(file))?;
    info!("Loaded {} markers", markers.len());
    Ok(markers)
}
