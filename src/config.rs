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

//! Application configuration management.
//!
//! Settings persist as TOML through `confy`, either in the platform config
//! directory or at an explicit `--config` path. Engine tunables are embedded
//! as nested tables so a single file configures the whole session.

use std::path::Path;
use std::time::Duration;

use map_overlay::{EngineConfig, HeatmapOptions, LonLat};
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "situmap";
const CONFIG_NAME: &str = "config";

/// Application configuration stored in TOML format
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Configuration schema version
    #[serde(default = "default_config_version")]
    pub config_version: u32,

    /// Initial map centre longitude
    #[serde(default = "default_center_lon")]
    pub center_lon: f64,

    /// Initial map centre latitude
    #[serde(default = "default_center_lat")]
    pub center_lat: f64,

    /// Initial zoom level
    #[serde(default = "default_zoom")]
    pub zoom: f64,

    /// Viewport width in pixels
    #[serde(default = "default_viewport_width")]
    pub viewport_width: f64,

    /// Viewport height in pixels
    #[serde(default = "default_viewport_height")]
    pub viewport_height: f64,

    /// Frame pump period in milliseconds
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,

    /// Delay between track replay steps in milliseconds
    #[serde(default = "default_track_step_ms")]
    pub track_step_ms: u64,

    /// GeoJSON property holding heat weights
    #[serde(default = "default_heat_weight_property")]
    pub heat_weight_property: String,

    /// Marker, track and cluster engine tunables
    #[serde(default)]
    pub engine: EngineConfig,

    /// Heat layer appearance
    #[serde(default)]
    pub heatmap: HeatmapOptions,
}

// Default value functions for serde
fn default_config_version() -> u32 {
    1
}

fn default_center_lon() -> f64 {
    121.55
}

fn default_center_lat() -> f64 {
    29.87
}

fn default_zoom() -> f64 {
    10.0
}

fn default_viewport_width() -> f64 {
    1280.0
}

fn default_viewport_height() -> f64 {
    800.0
}

fn default_frame_interval_ms() -> u64 {
    16
}

fn default_track_step_ms() -> u64 {
    250
}

fn default_heat_weight_property() -> String {
    "weight".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            center_lon: default_center_lon(),
            center_lat: default_center_lat(),
            zoom: default_zoom(),
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            frame_interval_ms: default_frame_interval_ms(),
            track_step_ms: default_track_step_ms(),
            heat_weight_property: default_heat_weight_property(),
            engine: EngineConfig::default(),
            heatmap: HeatmapOptions::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, or from the platform config directory.
    ///
    /// A missing file is created with defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, confy::ConfyError> {
        match path {
            Some(path) => confy::load_path(path),
            None => confy::load(APP_NAME, CONFIG_NAME),
        }
    }

    /// Save configuration to `path`, or to the platform config directory.
    #[allow(dead_code, reason = "kept for hosts that edit settings at runtime")]
    pub fn save(&self, path: Option<&Path>) -> Result<(), confy::ConfyError> {
        match path {
            Some(path) => confy::store_path(path, self),
            None => confy::store(APP_NAME, CONFIG_NAME, self),
        }
    }

    /// Get the config file path for display to user
    pub fn get_config_path() -> Result<std::path::PathBuf, confy::ConfyError> {
        confy::get_configuration_file_path(APP_NAME, CONFIG_NAME)
    }

    pub fn center(&self) -> LonLat {
        LonLat::new(self.center_lon, self.center_lat)
    }

    pub fn viewport(&self) -> [f64; 2] {
        [self.viewport_width, self.viewport_height]
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }

    pub fn track_step(&self) -> Duration {
        Duration::from_millis(self.track_step_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("situmap-{}.toml", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.frame_interval(), Duration::from_millis(16));
        assert_eq!(config.viewport(), [1280.0, 800.0]);
        assert_eq!(config.engine.chunk_size, 1000);
        assert_eq!(config.heat_weight_property, "weight");
    }

    #[test]
    fn test_store_and_load_path() {
        let path = scratch_path();
        let mut config = AppConfig::default();
        config.zoom = 12.0;
        config.engine.sync_threshold = 50;
        config.save(Some(&path)).unwrap();

        let loaded = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_file_gets_defaults() {
        let path = scratch_path();
        let loaded = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, AppConfig::default());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_frame_interval_never_zero() {
        let config = AppConfig {
            frame_interval_ms: 0,
            ..AppConfig::default()
        };
        assert_eq!(config.frame_interval(), Duration::from_millis(1));
    }
}
