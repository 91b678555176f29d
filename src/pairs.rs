//! Coupled-train pair detection.
//!
//! Two physical units running as one train report two feed entities a few
//! meters apart with near-identical kinematics. The detector keeps a
//! persistent pair set: pairs break when the units separate, new pairs form
//! when the proximity criteria hold, and one unit of every pair is marked
//! invisible so the board lights a single LED.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::PairDetectionConfig;
use crate::feed::FeedEntity;
use crate::geometry::{bearing_difference, haversine_distance};

/// A detected coupled pair, persisted across restarts via the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainPair {
    /// Sorted join of the two vehicle ids.
    pub pair_key: String,
    /// The two vehicle ids, sorted.
    pub vehicle_ids: [String; 2],
    /// Epoch seconds at detection.
    pub detected_at: u64,
    /// Separation observed at detection, after subtracting train lengths.
    pub distance_m: f64,
    pub speed_diff: f64,
    pub bearing_diff: f64,
}

/// Kinematic snapshot of one train, extracted from its feed entity.
#[derive(Debug, Clone)]
pub struct PairCandidate {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
    pub timestamp: u64,
    pub route: Option<String>,
}

impl PairCandidate {
    pub fn from_entity(entity: &FeedEntity) -> Option<Self> {
        let id = entity.vehicle_id()?.to_string();
        let position = entity.position()?;
        Some(Self {
            id,
            lat: position.latitude,
            lon: position.longitude,
            speed: position.speed,
            bearing: position.bearing,
            timestamp: entity.timestamp().unwrap_or(0),
            route: entity.route_id().map(str::to_string),
        })
    }

    fn has_valid_position(&self) -> bool {
        self.lat != 0.0 || self.lon != 0.0
    }
}

#[derive(Debug, Default)]
pub struct PairDetector {
    pairs: Vec<TrainPair>,
}

impl PairDetector {
    pub fn new(pairs: Vec<TrainPair>) -> Self {
        Self { pairs }
    }

    pub fn pairs(&self) -> &[TrainPair] {
        &self.pairs
    }

    /// Runs the break and detect phases over the current train set.
    pub fn update(
        &mut self,
        trains: &HashMap<String, PairCandidate>,
        now: u64,
        cfg: &PairDetectionConfig,
    ) {
        // Every vehicle already in a pair sits out new-pair detection this
        // cycle, whether or not its pair survives the break phase.
        let mut paired: HashSet<String> = self
            .pairs
            .iter()
            .flat_map(|p| p.vehicle_ids.iter().cloned())
            .collect();

        self.pairs.retain(|pair| {
            let a = trains.get(&pair.vehicle_ids[0]);
            let b = trains.get(&pair.vehicle_ids[1]);
            if let (Some(a), Some(b)) = (a, b) {
                if a.has_valid_position() && b.has_valid_position() {
                    let distance = haversine_distance(a.lat, a.lon, b.lat, b.lon);
                    if distance > cfg.break_distance_meters {
                        info!(pair = %pair.pair_key, distance, "pair separated, breaking");
                        return false;
                    }
                }
            }
            true
        });

        // Detect phase: recent, moving, located candidates only.
        let mut candidates: Vec<&PairCandidate> = trains
            .values()
            .filter(|c| !paired.contains(&c.id))
            .filter(|c| c.has_valid_position())
            .filter(|c| c.speed.is_some_and(|s| s >= cfg.min_speed))
            .filter(|c| now.saturating_sub(c.timestamp) <= cfg.max_position_age_seconds)
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        for i in 0..candidates.len() {
            if paired.contains(&candidates[i].id) {
                continue;
            }
            for j in (i + 1)..candidates.len() {
                if paired.contains(&candidates[j].id) {
                    continue;
                }
                if let Some(pair) = check_pair(candidates[i], candidates[j], now, cfg) {
                    debug!(pair = %pair.pair_key, distance = pair.distance_m, "detected coupled pair");
                    paired.insert(pair.vehicle_ids[0].clone());
                    paired.insert(pair.vehicle_ids[1].clone());
                    self.pairs.push(pair);
                    break;
                }
            }
        }
    }

    /// Picks one vehicle per pair to hide this cycle. The unit without a
    /// route id is hidden when exactly one qualifies; otherwise the second
    /// id of the sorted pair is hidden.
    pub fn invisible_ids(&self, trains: &HashMap<String, PairCandidate>) -> HashSet<String> {
        let mut invisible = HashSet::new();
        for pair in &self.pairs {
            let route_missing = |id: &String| {
                trains
                    .get(id)
                    .and_then(|c| c.route.as_deref())
                    .map_or(true, str::is_empty)
            };
            let a_missing = route_missing(&pair.vehicle_ids[0]);
            let b_missing = route_missing(&pair.vehicle_ids[1]);
            let hidden = match (a_missing, b_missing) {
                (true, false) => &pair.vehicle_ids[0],
                (false, true) => &pair.vehicle_ids[1],
                _ => &pair.vehicle_ids[1],
            };
            invisible.insert(hidden.clone());
        }
        invisible
    }
}

fn check_pair(
    a: &PairCandidate,
    b: &PairCandidate,
    now: u64,
    cfg: &PairDetectionConfig,
) -> Option<TrainPair> {
    // Separation between the unit noses, not the GPS antennas.
    let raw = haversine_distance(a.lat, a.lon, b.lat, b.lon);
    let distance = (raw - 2.0 * cfg.train_length_meters).max(0.0);
    if distance > 2.0 * cfg.train_length_meters {
        return None;
    }

    // The two reports are from slightly different moments; reject when the
    // positions imply an impossible closing speed.
    let dt = a.timestamp.abs_diff(b.timestamp);
    let implied_speed = if dt > 0 {
        distance / dt as f64
    } else if distance > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    if implied_speed > cfg.max_speed {
        return None;
    }

    let (speed_a, speed_b) = (a.speed?, b.speed?);
    let speed_diff = (speed_a - speed_b).abs();
    if speed_diff > cfg.max_speed_diff {
        return None;
    }

    let (bearing_a, bearing_b) = (a.bearing?, b.bearing?);
    let bearing_diff = bearing_difference(bearing_a, bearing_b);
    if bearing_diff > cfg.max_bearing_diff {
        return None;
    }

    if let (Some(ra), Some(rb)) = (a.route.as_deref(), b.route.as_deref()) {
        if ra != rb {
            return None;
        }
    }

    let mut ids = [a.id.clone(), b.id.clone()];
    ids.sort();
    Some(TrainPair {
        pair_key: format!("{}-{}", ids[0], ids[1]),
        vehicle_ids: ids,
        detected_at: now,
        distance_m: distance,
        speed_diff,
        bearing_diff,
    })
}
