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

mod config;
mod feed;
mod loader;
mod status;

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use log::{debug, info, warn};
use map_overlay::{
    AnimationOutcome, BatchOptions, BatchProgress, LonLat, MarkerEngine, MarkerUpdate, MemorySurface, PolygonOptions,
    PopupOptions, SharedSurface, Surface, TrackOptions, VirtualizeOptions, WebMercator,
};
use tokio::sync::{broadcast, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::feed::MockFeed;
use crate::status::SessionStatus;

/// Vessels whose positions are refreshed every frame.
const DRIFTING_VESSELS: usize = 60;

/// Heat samples generated when no GeoJSON file is given.
const MOCK_HEAT_POINTS: usize = 400;

/// Headless situational-awareness map session
#[derive(Parser, Debug)]
#[command(
    name = "situmap",
    author,
    version,
    about = "Drive the map overlay engines headlessly against a mock or CSV feed",
    long_about = None
)]
struct Cli {
    /// CSV file of markers (id,type,lon,lat,label)
    #[arg(short, long)]
    markers: Option<PathBuf>,

    /// GeoJSON FeatureCollection of heat points
    #[arg(long)]
    heat: Option<PathBuf>,

    /// Number of mock markers to generate
    #[arg(long, default_value_t = 0)]
    mock: usize,

    /// Stop after this many frames (runs until Ctrl-C otherwise)
    #[arg(short, long)]
    frames: Option<u64>,

    /// Replay mock tracks
    #[arg(long)]
    tracks: bool,

    /// Load mock markers through viewport virtualization and pan the map
    #[arg(long)]
    virtualized: bool,

    /// Cluster every type layer once markers are in
    #[arg(long)]
    cluster: bool,

    /// Configuration file (platform config directory when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    match &cli.config {
        Some(path) => info!("Using configuration {}", path.display()),
        None => {
            if let Ok(path) = AppConfig::get_config_path() {
                info!("Using configuration {}", path.display());
            }
        }
    }

    let surface = MemorySurface::new(config.center(), config.zoom, config.viewport()).shared();
    let shared: SharedSurface = surface.clone();

    let mut engine = MarkerEngine::new(config.engine.clone());
    engine.init(shared.clone());
    let mut events = engine.subscribe();

    let mut heat = map_overlay::HeatmapEngine::new();
    heat.init(shared, config.heatmap.clone());

    let feed = MockFeed::new(config.center());

    if let Some(path) = &cli.markers {
        let inputs = loader::load_markers(path)?;
        let ids = engine.add_markers(
            inputs,
            BatchOptions {
                enable_cluster: cli.cluster,
                on_complete: Some(Box::new(|done: BatchProgress| {
                    info!("CSV markers loaded: {}/{}", done.processed, done.total);
                })),
                ..BatchOptions::default()
            },
        );
        info!("Queued {} CSV markers", ids.len());
    }

    if cli.mock > 0 {
        let inputs = feed.markers(cli.mock);
        if cli.virtualized {
            let loaded = engine.add_markers_virtualized(inputs, VirtualizeOptions::default());
            info!("Virtualized {} mock markers, {} in view", cli.mock, loaded);
        } else {
            engine.add_markers(
                inputs,
                BatchOptions {
                    enable_cluster: cli.cluster,
                    on_progress: Some(Box::new(|update: BatchProgress| {
                        debug!("Mock insert {:.0}%", update.percentage);
                    })),
                    ..BatchOptions::default()
                },
            );
        }
    }

    match &cli.heat {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            let count = heat.set_geojson(&text, &config.heat_weight_property)?;
            info!("Loaded {count} heat points from {}", path.display());
        }
        None => heat.set_data(feed.heat(MOCK_HEAT_POINTS)),
    }

    let mut replays: Vec<(String, oneshot::Receiver<AnimationOutcome>)> = Vec::new();
    if cli.tracks {
        for (id, waypoints) in feed.tracks(3, 12) {
            let options = TrackOptions {
                id: Some(id),
                animation: true,
                animation_duration: config.track_step(),
                ..TrackOptions::default()
            };
            if let Some(track) = engine.tracks_mut().generate_track_route(waypoints, options) {
                if let Some(completion) = track.completion {
                    replays.push((track.id, completion));
                }
            }
        }
        info!("Replaying {} tracks", replays.len());
    }

    let center = config.center();
    let aoi = [
        LonLat::new(center.lon - 0.05, center.lat - 0.03),
        LonLat::new(center.lon + 0.05, center.lat - 0.03),
        LonLat::new(center.lon + 0.05, center.lat + 0.03),
        LonLat::new(center.lon - 0.05, center.lat + 0.03),
    ];
    engine.draw_filled_polygon(&aoi, PolygonOptions::default());

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {e}"),
        }
        shutdown.cancel();
    });

    let mut status = SessionStatus::new();
    let mut ticker = tokio::time::interval(config.frame_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut popup_open = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let frame = status.frames;

        if cli.mock > 0 && !cli.virtualized {
            for index in (0..cli.mock.min(DRIFTING_VESSELS * 3)).step_by(3) {
                let update = MarkerUpdate {
                    coordinate: Some(feed.drift(index, frame)),
                    ..MarkerUpdate::default()
                };
                engine.update_marker(&MockFeed::marker_id(index), update);
            }
        }

        if cli.virtualized && frame > 0 && frame % 120 == 0 {
            if let Ok(mut map) = surface.write() {
                let view = map.view();
                let here = WebMercator::unproject(view.center);
                map.set_view(LonLat::new(here.lon + 0.01, here.lat), config.zoom);
            }
        }

        engine.on_frame();

        if !popup_open && !engine.has_pending_work() {
            let nearest = engine
                .markers_near(center, 40.0)
                .first()
                .map(|m| (m.id.clone(), m.coordinate, m.data.clone()));
            if let Some((id, coordinate, data)) = nearest {
                let content = serde_json::json!({ "id": id, "data": data }).to_string();
                engine.open_popup(PopupOptions::new(coordinate, content));
                popup_open = true;
            }
        }

        loop {
            match events.try_recv() {
                Ok(event) => status.record_event(&event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => status.record_lag(skipped),
                Err(_) => break,
            }
        }

        status.record_frame(started.elapsed().as_secs_f64() * 1000.0);

        if cli.frames.is_some_and(|limit| status.frames >= limit) {
            info!("Frame limit reached");
            break;
        }
    }

    // Destroy resolves every replay still running as cancelled.
    engine.destroy();
    for (id, mut completion) in replays {
        match completion.try_recv() {
            Ok(outcome) => status.record_track_outcome(&id, outcome),
            Err(_) => warn!("No outcome for replay {id}"),
        }
    }

    if let Some(grid) = heat.rasterize(128, 80) {
        if let Some((x, y)) = grid.peak() {
            info!("Heat peak at cell ({x}, {y}) of {} points", heat.len());
        }
    }
    heat.destroy();

    println!("{}", status.summary());
    Ok(())
}
