//! Per-network configuration, loaded from `railNetworks/<ID>/config.json`.
//!
//! Every tunable has a default so a minimal config only needs the feed
//! URLs. Key names follow the deployed config files verbatim, hence the
//! mixed casing in the rename attributes.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::entities::TrainFilterConfig;
use crate::feed::{FeedFormat, FeedProtocol};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "GTFSRealtimeAPI")]
    pub gtfs_realtime_api: GtfsRealtimeApi,
    #[serde(rename = "trainFilter", default)]
    pub train_filter: TrainFilterConfig,
    #[serde(rename = "processingOptions", default)]
    pub processing_options: ProcessingOptions,
    #[serde(rename = "pairDetection", default)]
    pub pair_detection: PairDetectionConfig,
    #[serde(default)]
    pub stops: Option<FileRef>,
    #[serde(rename = "trackBlocks", default)]
    pub track_blocks: Option<FileRef>,
    #[serde(rename = "LEDRailsAPI", default)]
    pub led_rails_api: Option<LedRailsApiConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GtfsRealtimeApi {
    pub url: Vec<String>,
    #[serde(rename = "tripsUrl", default)]
    pub trips_url: Vec<String>,
    #[serde(rename = "keyHeader", default)]
    pub key_header: Option<String>,
    #[serde(rename = "fetchIntervalSeconds", default = "default_fetch_interval")]
    pub fetch_interval_seconds: u64,
    #[serde(default)]
    pub format: FeedFormat,
    #[serde(default)]
    pub protocol: FeedProtocol,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingOptions {
    #[serde(rename = "pairTrains", default)]
    pub pair_trains: bool,
    #[serde(rename = "cacheGTFS", default)]
    pub cache_gtfs: bool,
    #[serde(rename = "cacheIntervalSeconds", default = "default_cache_interval")]
    pub cache_interval_seconds: u64,
    /// Maximum vehicle timestamp age, in seconds, for a train to render.
    #[serde(rename = "displayThreshold", default = "default_display_threshold")]
    pub display_threshold: u64,
    #[serde(rename = "removeStaleVehiclesHours", default)]
    pub remove_stale_vehicles_hours: Option<u64>,
    /// Weight of the stored position when smoothing a stationary train.
    #[serde(rename = "smoothingFactor", default = "default_smoothing_factor")]
    pub smoothing_factor: f64,
    /// How far in the past a stop departure may lie before it is pruned.
    #[serde(
        rename = "stopDepartureWindowSeconds",
        default = "default_stop_departure_window"
    )]
    pub stop_departure_window_seconds: u64,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            pair_trains: false,
            cache_gtfs: false,
            cache_interval_seconds: default_cache_interval(),
            display_threshold: default_display_threshold(),
            remove_stale_vehicles_hours: None,
            smoothing_factor: default_smoothing_factor(),
            stop_departure_window_seconds: default_stop_departure_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairDetectionConfig {
    #[serde(rename = "trainLengthMeters", default = "default_train_length")]
    pub train_length_meters: f64,
    #[serde(rename = "breakDistanceMeters", default = "default_break_distance")]
    pub break_distance_meters: f64,
    /// Minimum speed (m/s) for a unit to enter pair detection.
    #[serde(rename = "minSpeed", default = "default_min_speed")]
    pub min_speed: f64,
    /// Maximum plausible implied inter-position speed (m/s).
    #[serde(rename = "maxSpeed", default = "default_max_speed")]
    pub max_speed: f64,
    #[serde(rename = "maxSpeedDiff", default = "default_max_speed_diff")]
    pub max_speed_diff: f64,
    #[serde(rename = "maxBearingDiff", default = "default_max_bearing_diff")]
    pub max_bearing_diff: f64,
    #[serde(rename = "maxPositionAgeSeconds", default = "default_max_position_age")]
    pub max_position_age_seconds: u64,
}

impl Default for PairDetectionConfig {
    fn default() -> Self {
        Self {
            train_length_meters: default_train_length(),
            break_distance_meters: default_break_distance(),
            min_speed: default_min_speed(),
            max_speed: default_max_speed(),
            max_speed_diff: default_max_speed_diff(),
            max_bearing_diff: default_max_bearing_diff(),
            max_position_age_seconds: default_max_position_age(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileRef {
    #[serde(rename = "fileName")]
    pub file_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedRailsApiConfig {
    #[serde(rename = "APIVersions")]
    pub api_versions: Vec<ApiVersionConfig>,
    #[serde(rename = "randomizeTimeOffset", default)]
    pub randomize_time_offset: bool,
    /// Route to `[R, G, B]` color map. Declaration order assigns the dense
    /// color ids, so this relies on serde_json's order-preserving map.
    #[serde(default)]
    pub colors: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiVersionConfig {
    pub version: String,
    #[serde(rename = "blockRemap", default)]
    pub block_remap: Vec<BlockRemapRule>,
}

/// Rewrites block numbers in `start..=end` by `offset` for one board
/// revision whose LED indices differ from the logical block numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BlockRemapRule {
    pub start: i32,
    pub end: i32,
    pub offset: i32,
}

impl LedRailsApiConfig {
    /// Colors in declaration order, invalid entries skipped with a warning.
    pub fn color_entries(&self) -> Vec<(String, [u8; 3])> {
        let mut entries = Vec::new();
        for (route, value) in &self.colors {
            let rgb = value.as_array().and_then(|a| {
                if a.len() == 3 {
                    let mut rgb = [0u8; 3];
                    for (slot, v) in rgb.iter_mut().zip(a) {
                        *slot = u8::try_from(v.as_u64()?).ok()?;
                    }
                    Some(rgb)
                } else {
                    None
                }
            });
            match rgb {
                Some(rgb) => entries.push((route.clone(), rgb)),
                None => warn!(route = %route, "color is not an [R,G,B] triple, skipping"),
            }
        }
        entries
    }
}

impl NetworkConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Logs warnings for configurations that will run but look wrong.
    pub fn validate(&self, network_id: &str) {
        if self.gtfs_realtime_api.url.is_empty() {
            warn!(network = network_id, "no position feed URLs configured");
        }
        if self.gtfs_realtime_api.fetch_interval_seconds == 0 {
            warn!(network = network_id, "fetchIntervalSeconds is 0");
        }
        for url in self
            .gtfs_realtime_api
            .url
            .iter()
            .chain(&self.gtfs_realtime_api.trips_url)
        {
            if !url.starts_with("https://") {
                warn!(network = network_id, url = %url, "feed URL does not use HTTPS");
            }
        }
        if let Some(led) = &self.led_rails_api {
            if led.colors.is_empty() {
                warn!(
                    network = network_id,
                    "LEDRailsAPI has no colors; every update will be dropped"
                );
            }
            if led.api_versions.is_empty() {
                warn!(network = network_id, "LEDRailsAPI has no APIVersions");
            }
        }
        if self.train_filter.entity_id.is_some() && self.train_filter.trip_id.is_some() {
            warn!(
                network = network_id,
                "both entityID and trip_ID filters set; entityID wins"
            );
        }
    }
}

fn default_fetch_interval() -> u64 {
    20
}
fn default_cache_interval() -> u64 {
    30
}
fn default_display_threshold() -> u64 {
    300
}
fn default_smoothing_factor() -> f64 {
    0.95
}
fn default_stop_departure_window() -> u64 {
    600
}
fn default_train_length() -> f64 {
    150.0
}
fn default_break_distance() -> f64 {
    2_000.0
}
fn default_min_speed() -> f64 {
    3.0
}
fn default_max_speed() -> f64 {
    35.0
}
fn default_max_speed_diff() -> f64 {
    3.0
}
fn default_max_bearing_diff() -> f64 {
    5.0
}
fn default_max_position_age() -> u64 {
    30
}
