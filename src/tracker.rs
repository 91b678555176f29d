//! Long-lived train roster: position smoothing, stop merging and the
//! block-assignment algorithm.
//!
//! Assignment runs four passes per cycle: stale trains are cleared, trains
//! still inside their current block stick to it, the remainder search the
//! block map in canonical order, and multi-occupancy is resolved through
//! alt blocks and the invisibility set.

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;
use utoipa::ToSchema;

use crate::blocks::{Platform, TrackBlock, TrackBlockMap};
use crate::config::ProcessingOptions;
use crate::feed::{FeedEntity, StopTimeUpdate};
use crate::geometry::{bearing_difference, haversine_distance};

/// Route sentinel for vehicles reporting no route id. Sorts after real
/// routes when competing for a block.
pub const OUT_OF_SERVICE: &str = "OUT-OF-SERVICE";

/// Bearing updates are suppressed outside this speed band: GPS bearings
/// jitter at a standstill and implausible speeds mean bad fixes.
const BEARING_MIN_SPEED: f64 = 4.0;
const BEARING_MAX_SPEED: f64 = 55.0;

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TrainStop {
    #[serde(rename = "stopId")]
    pub stop_id: String,
    #[serde(rename = "departureTime")]
    pub departure_time: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TrainInfo {
    #[serde(rename = "trainId")]
    pub train_id: String,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
    #[serde(rename = "currentBlock", skip_serializing_if = "Option::is_none")]
    pub current_block: Option<i32>,
    /// Predecessor block; `None` encodes the initial "unknown" state that
    /// goes on the wire as block 0.
    #[serde(rename = "previousBlock", skip_serializing_if = "Option::is_none")]
    pub previous_block: Option<i32>,
    pub route: String,
    #[serde(rename = "tripId", skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    pub stops: Vec<TrainStop>,
}

/// Brings the roster in line with this cycle's filtered train entities.
/// Trains whose entity was evicted from the store are dropped.
pub fn sync_roster(
    roster: &mut Vec<TrainInfo>,
    trains: &[&FeedEntity],
    now: u64,
    opts: &ProcessingOptions,
) {
    let mut seen: HashSet<String> = HashSet::with_capacity(trains.len());

    for entity in trains {
        let Some(train_id) = entity.vehicle_id() else {
            continue;
        };
        seen.insert(train_id.to_string());

        let Some(position) = entity.position() else {
            continue;
        };
        let timestamp = entity.timestamp().unwrap_or(0);
        let route = entity.route_id().unwrap_or(OUT_OF_SERVICE).to_string();
        let trip_id = entity.trip_id().map(str::to_string);
        let stop_updates = entity
            .trip_update
            .as_ref()
            .map(|tu| tu.stop_time_update.as_slice())
            .unwrap_or(&[]);

        if let Some(train) = roster.iter_mut().find(|t| t.train_id == train_id) {
            if train.lat == position.latitude && train.lon == position.longitude {
                continue;
            }

            let effective_speed = match position.speed {
                Some(reported) => {
                    if train.speed == Some(0.0) && reported == 0.0 {
                        // Both reports stationary: the movement is GPS
                        // noise, fold it in slowly instead of jumping.
                        let f = opts.smoothing_factor;
                        train.lat = f * train.lat + (1.0 - f) * position.latitude;
                        train.lon = f * train.lon + (1.0 - f) * position.longitude;
                    } else {
                        train.lat = position.latitude;
                        train.lon = position.longitude;
                    }
                    train.speed = Some(reported);
                    reported
                }
                None => {
                    let dt = timestamp.saturating_sub(train.timestamp);
                    let computed = if dt > 0 {
                        haversine_distance(train.lat, train.lon, position.latitude, position.longitude)
                            / dt as f64
                    } else {
                        0.0
                    };
                    train.lat = position.latitude;
                    train.lon = position.longitude;
                    train.speed = Some(computed);
                    computed
                }
            };

            if effective_speed > BEARING_MIN_SPEED && effective_speed < BEARING_MAX_SPEED {
                if let Some(bearing) = position.bearing {
                    train.bearing = Some(bearing);
                }
            }

            train.timestamp = timestamp;
            train.route = route;
            train.trip_id = trip_id;
            merge_stops(&mut train.stops, stop_updates, now, opts.stop_departure_window_seconds);
        } else {
            let mut stops = Vec::new();
            merge_stops(&mut stops, stop_updates, now, opts.stop_departure_window_seconds);
            roster.push(TrainInfo {
                train_id: train_id.to_string(),
                lat: position.latitude,
                lon: position.longitude,
                timestamp,
                speed: position.speed,
                bearing: position.bearing,
                current_block: None,
                previous_block: None,
                route,
                trip_id,
                stops,
            });
        }
    }

    roster.retain(|t| seen.contains(&t.train_id));
}

/// Upserts stop time updates by stop id, keeping the latest departure, and
/// prunes departures older than the window. Zero departure times are kept:
/// they mark stops the feed knows about but has not timed yet.
fn merge_stops(stops: &mut Vec<TrainStop>, updates: &[StopTimeUpdate], now: u64, window: u64) {
    for update in updates {
        let Some(stop_id) = update.stop_id.as_deref() else {
            continue;
        };
        let departure_time = update
            .departure
            .as_ref()
            .and_then(|d| d.time)
            .unwrap_or(0)
            .max(0) as u64;
        match stops.iter_mut().find(|s| s.stop_id == stop_id) {
            Some(existing) => {
                if departure_time > existing.departure_time {
                    existing.departure_time = departure_time;
                }
            }
            None => stops.push(TrainStop {
                stop_id: stop_id.to_string(),
                departure_time,
            }),
        }
    }

    let cutoff = now.saturating_sub(window);
    stops.retain(|s| s.departure_time == 0 || s.departure_time >= cutoff);
}

/// Assigns every roster train to at most one block and resolves conflicts.
/// `invisible` arrives holding the pair-detector selections and leaves with
/// the excess block occupants added.
pub fn assign_blocks(
    roster: &mut [TrainInfo],
    map: &TrackBlockMap,
    invisible: &mut HashSet<String>,
    now: u64,
    display_threshold: u64,
) {
    let display_cutoff = now.saturating_sub(display_threshold);

    for train in roster.iter_mut() {
        // Stale pass: never place an unlocated or expired train.
        if (train.lat == 0.0 && train.lon == 0.0) || train.timestamp < display_cutoff {
            train.current_block = None;
            train.previous_block = None;
            continue;
        }

        // Sticky pass: stay put while the train remains inside its block.
        if let Some(current) = train.current_block {
            if let Some(block) = map.resolve(current) {
                if block.contains(train.lat, train.lon) && block.allows_route(&train.route) {
                    train.previous_block = Some(current);
                    continue;
                }
            }
        }

        // Search pass: first matching block in canonical order wins.
        let mut assigned = None;
        for block in map.iter() {
            if !block.contains(train.lat, train.lon) || !block.allows_route(&train.route) {
                continue;
            }
            assigned = Some(if block.platforms.is_empty() {
                block.block_number
            } else {
                select_platform(block, train).unwrap_or(block.block_number)
            });
            break;
        }

        match assigned {
            Some(number) => {
                debug!(
                    train = %train.train_id,
                    block = number,
                    previous = ?train.current_block,
                    "assigned block"
                );
                train.previous_block = train.current_block;
                train.current_block = Some(number);
            }
            None => {
                train.current_block = None;
                train.previous_block = None;
            }
        }
    }

    resolve_conflicts(roster, map, invisible);
}

/// Platform disambiguation, in priority order: a platform serving one of
/// the train's upcoming stops, then a default platform facing the train's
/// bearing, then a default platform with no bearing at all.
fn select_platform(block: &TrackBlock, train: &TrainInfo) -> Option<i32> {
    let allowed = |p: &&Platform| {
        p.routes.is_empty() || p.routes.iter().any(|r| train.route.contains(r.as_str()))
    };

    if let Some(platform) = block.platforms.iter().filter(allowed).find(|p| {
        !p.stop_ids.is_empty()
            && p.stop_ids
                .iter()
                .any(|sid| train.stops.iter().any(|s| &s.stop_id == sid))
    }) {
        return Some(platform.block_number);
    }

    if let Some(train_bearing) = train.bearing {
        if let Some(platform) = block.platforms.iter().filter(allowed).find(|p| {
            p.is_default
                && p.bearing
                    .is_some_and(|b| bearing_difference(b, train_bearing) <= 90.0)
        }) {
            return Some(platform.block_number);
        }
    }

    block
        .platforms
        .iter()
        .filter(allowed)
        .find(|p| p.is_default && p.bearing.is_none())
        .map(|p| p.block_number)
}

/// Enforces the occupancy invariant: per block at most one visible train on
/// the block itself and one on its alt block. The route sort puts in-service
/// trains first so an out-of-service unit never displaces one.
fn resolve_conflicts(roster: &mut [TrainInfo], map: &TrackBlockMap, invisible: &mut HashSet<String>) {
    for block in map.iter() {
        let mut occupants = occupant_indices(roster, invisible, block.block_number);
        if occupants.len() > 1 {
            sort_by_route(roster, &mut occupants);
            let excess_start = if let Some(alt) = block.alt_block {
                roster[occupants[1]].current_block = Some(alt);
                2
            } else {
                1
            };
            for &idx in &occupants[excess_start..] {
                invisible.insert(roster[idx].train_id.clone());
            }
        }

        if let Some(alt) = block.alt_block {
            let mut alt_occupants = occupant_indices(roster, invisible, alt);
            if alt_occupants.len() > 1 {
                sort_by_route(roster, &mut alt_occupants);
                for &idx in &alt_occupants[1..] {
                    invisible.insert(roster[idx].train_id.clone());
                }
            }
        }
    }
}

fn occupant_indices(roster: &[TrainInfo], invisible: &HashSet<String>, number: i32) -> Vec<usize> {
    roster
        .iter()
        .enumerate()
        .filter(|(_, t)| t.current_block == Some(number) && !invisible.contains(&t.train_id))
        .map(|(i, _)| i)
        .collect()
}

fn sort_by_route(roster: &[TrainInfo], indices: &mut [usize]) {
    indices.sort_by(|&a, &b| {
        let key = |t: &TrainInfo| (t.route == OUT_OF_SERVICE, t.route.clone());
        key(&roster[a]).cmp(&key(&roster[b]))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{
        Position, StopTimeEvent, TripDescriptor, TripUpdateData, VehicleData, VehicleDescriptor,
    };

    const NOW: u64 = 1_754_000_000;

    fn entity(
        vehicle_id: &str,
        lat: f64,
        lon: f64,
        speed: Option<f64>,
        bearing: Option<f64>,
        route: Option<&str>,
        timestamp: u64,
    ) -> FeedEntity {
        FeedEntity {
            id: vehicle_id.to_string(),
            is_deleted: false,
            vehicle: Some(VehicleData {
                vehicle: Some(VehicleDescriptor {
                    id: Some(vehicle_id.to_string()),
                    label: None,
                }),
                position: Some(Position {
                    latitude: lat,
                    longitude: lon,
                    speed,
                    bearing,
                }),
                timestamp: Some(timestamp),
                trip: route.map(|r| TripDescriptor {
                    route_id: Some(r.to_string()),
                    trip_id: Some(format!("{r}-trip")),
                }),
            }),
            trip_update: None,
        }
    }

    fn block(number: i32, alt: Option<i32>, polygon: Vec<(f64, f64)>) -> TrackBlock {
        TrackBlock {
            block_number: number,
            alt_block: alt,
            name: number.to_string(),
            priority: false,
            routes: Vec::new(),
            polygon,
            platforms: Vec::new(),
        }
    }

    fn square_a() -> Vec<(f64, f64)> {
        vec![
            (-36.85, 174.76),
            (-36.85, 174.77),
            (-36.84, 174.77),
            (-36.84, 174.76),
        ]
    }

    fn opts() -> ProcessingOptions {
        ProcessingOptions::default()
    }

    // --- roster sync ---

    #[test]
    fn new_train_joins_roster() {
        let mut roster = Vec::new();
        let e = entity("v1", -36.846, 174.765, Some(10.0), Some(90.0), Some("EAST-201"), NOW);
        sync_roster(&mut roster, &[&e], NOW, &opts());

        assert_eq!(roster.len(), 1);
        let train = &roster[0];
        assert_eq!(train.train_id, "v1");
        assert_eq!(train.route, "EAST-201");
        assert_eq!(train.speed, Some(10.0));
        assert!(train.current_block.is_none());
    }

    #[test]
    fn missing_route_becomes_out_of_service() {
        let mut roster = Vec::new();
        let e = entity("v1", -36.846, 174.765, None, None, None, NOW);
        sync_roster(&mut roster, &[&e], NOW, &opts());
        assert_eq!(roster[0].route, OUT_OF_SERVICE);
    }

    #[test]
    fn stationary_train_position_is_smoothed() {
        let mut roster = Vec::new();
        let e1 = entity("v1", -36.8460, 174.7650, Some(0.0), None, Some("EAST"), NOW);
        sync_roster(&mut roster, &[&e1], NOW, &opts());

        let e2 = entity("v1", -36.8470, 174.7660, Some(0.0), None, Some("EAST"), NOW + 20);
        sync_roster(&mut roster, &[&e2], NOW + 20, &opts());

        let train = &roster[0];
        // 0.95 * old + 0.05 * new
        assert!((train.lat - (-36.84605)).abs() < 1e-9, "lat {}", train.lat);
        assert!((train.lon - 174.76505).abs() < 1e-9, "lon {}", train.lon);
        assert_eq!(train.timestamp, NOW + 20);
    }

    #[test]
    fn moving_train_position_overwrites() {
        let mut roster = Vec::new();
        let e1 = entity("v1", -36.8460, 174.7650, Some(10.0), None, Some("EAST"), NOW);
        sync_roster(&mut roster, &[&e1], NOW, &opts());

        let e2 = entity("v1", -36.8470, 174.7660, Some(12.0), None, Some("EAST"), NOW + 20);
        sync_roster(&mut roster, &[&e2], NOW + 20, &opts());

        assert_eq!(roster[0].lat, -36.8470);
        assert_eq!(roster[0].speed, Some(12.0));
    }

    #[test]
    fn speed_computed_from_movement_when_feed_omits_it() {
        let mut roster = Vec::new();
        let e1 = entity("v1", -36.8460, 174.7650, None, None, Some("EAST"), NOW);
        sync_roster(&mut roster, &[&e1], NOW, &opts());

        // ~111 m north over 10 s is ~11 m/s.
        let e2 = entity("v1", -36.8450, 174.7650, None, None, Some("EAST"), NOW + 10);
        sync_roster(&mut roster, &[&e2], NOW + 10, &opts());

        let speed = roster[0].speed.unwrap();
        assert!((10.0..12.5).contains(&speed), "speed {speed}");
    }

    #[test]
    fn bearing_ignored_outside_speed_band() {
        let mut roster = Vec::new();
        let e1 = entity("v1", -36.8460, 174.7650, Some(10.0), Some(90.0), Some("EAST"), NOW);
        sync_roster(&mut roster, &[&e1], NOW, &opts());
        assert_eq!(roster[0].bearing, Some(90.0));

        // Crawling: the reported bearing is jitter, keep the old one.
        let e2 = entity("v1", -36.8461, 174.7650, Some(1.0), Some(240.0), Some("EAST"), NOW + 20);
        sync_roster(&mut roster, &[&e2], NOW + 20, &opts());
        assert_eq!(roster[0].bearing, Some(90.0));

        // Back in the plausible band the bearing tracks again.
        let e3 = entity("v1", -36.8465, 174.7650, Some(15.0), Some(270.0), Some("EAST"), NOW + 40);
        sync_roster(&mut roster, &[&e3], NOW + 40, &opts());
        assert_eq!(roster[0].bearing, Some(270.0));
    }

    #[test]
    fn unchanged_position_leaves_train_untouched() {
        let mut roster = Vec::new();
        let e1 = entity("v1", -36.8460, 174.7650, Some(10.0), None, Some("EAST"), NOW);
        sync_roster(&mut roster, &[&e1], NOW, &opts());

        let e2 = entity("v1", -36.8460, 174.7650, Some(10.0), None, Some("WEST"), NOW + 20);
        sync_roster(&mut roster, &[&e2], NOW + 20, &opts());
        assert_eq!(roster[0].timestamp, NOW, "no position change, no update");
        assert_eq!(roster[0].route, "EAST");
    }

    #[test]
    fn trains_absent_from_store_are_dropped() {
        let mut roster = Vec::new();
        let e1 = entity("v1", -36.846, 174.765, Some(10.0), None, Some("EAST"), NOW);
        let e2 = entity("v2", -36.847, 174.766, Some(10.0), None, Some("EAST"), NOW);
        sync_roster(&mut roster, &[&e1, &e2], NOW, &opts());
        assert_eq!(roster.len(), 2);

        sync_roster(&mut roster, &[&e1], NOW + 20, &opts());
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].train_id, "v1");
    }

    #[test]
    fn stop_updates_upsert_and_prune() {
        let mut roster = Vec::new();
        let mut e = entity("v1", -36.846, 174.765, Some(10.0), None, Some("EAST"), NOW);
        e.trip_update = Some(TripUpdateData {
            trip: None,
            stop_time_update: vec![
                stu("S1", Some(NOW as i64 + 120)),
                stu("S2", Some(NOW as i64 - 700)), // 700 s past: pruned
                stu("S3", None),                   // untimed: kept as 0
            ],
        });
        sync_roster(&mut roster, &[&e], NOW, &opts());

        let stops = &roster[0].stops;
        assert_eq!(stops.len(), 2);
        assert!(stops.iter().any(|s| s.stop_id == "S1"));
        assert!(stops.iter().any(|s| s.stop_id == "S3" && s.departure_time == 0));

        // A later departure for S1 replaces the stored one.
        let mut e2 = entity("v1", -36.8461, 174.765, Some(10.0), None, Some("EAST"), NOW + 20);
        e2.trip_update = Some(TripUpdateData {
            trip: None,
            stop_time_update: vec![stu("S1", Some(NOW as i64 + 300))],
        });
        sync_roster(&mut roster, &[&e2], NOW + 20, &opts());
        let s1 = roster[0].stops.iter().find(|s| s.stop_id == "S1").unwrap();
        assert_eq!(s1.departure_time, NOW + 300);
    }

    fn stu(stop_id: &str, time: Option<i64>) -> StopTimeUpdate {
        StopTimeUpdate {
            stop_id: Some(stop_id.to_string()),
            arrival: None,
            departure: time.map(|t| StopTimeEvent {
                time: Some(t),
                delay: None,
            }),
        }
    }

    // --- block assignment ---

    fn train(id: &str, lat: f64, lon: f64, route: &str) -> TrainInfo {
        TrainInfo {
            train_id: id.to_string(),
            lat,
            lon,
            timestamp: NOW,
            speed: Some(10.0),
            bearing: None,
            current_block: None,
            previous_block: None,
            route: route.to_string(),
            trip_id: None,
            stops: Vec::new(),
        }
    }

    #[test]
    fn single_train_single_block() {
        let map = TrackBlockMap::new(vec![block(101, None, square_a())]);
        let mut roster = vec![train("v1", -36.846, 174.765, "EAST-201")];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);

        assert_eq!(roster[0].current_block, Some(101));
        assert!(roster[0].previous_block.is_none(), "no predecessor yet");
        assert!(invisible.is_empty());
    }

    #[test]
    fn train_leaving_polygon_loses_block() {
        let map = TrackBlockMap::new(vec![block(101, None, square_a())]);
        let mut roster = vec![train("v1", -36.846, 174.765, "EAST-201")];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert_eq!(roster[0].current_block, Some(101));

        roster[0].lat = -36.830;
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert!(roster[0].current_block.is_none());
        assert!(roster[0].previous_block.is_none());
    }

    #[test]
    fn sticky_block_sets_previous_to_current() {
        let map = TrackBlockMap::new(vec![block(101, None, square_a())]);
        let mut roster = vec![train("v1", -36.846, 174.765, "EAST-201")];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);

        roster[0].lat = -36.8455; // still inside
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert_eq!(roster[0].current_block, Some(101));
        assert_eq!(roster[0].previous_block, Some(101));
    }

    #[test]
    fn origin_position_is_never_assigned() {
        // A polygon around (0,0) must still not capture null positions.
        let map = TrackBlockMap::new(vec![block(7, None, vec![
            (-1.0, -1.0),
            (-1.0, 1.0),
            (1.0, 1.0),
            (1.0, -1.0),
        ])]);
        let mut roster = vec![train("v1", 0.0, 0.0, "EAST")];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert!(roster[0].current_block.is_none());
    }

    #[test]
    fn expired_train_is_cleared() {
        let map = TrackBlockMap::new(vec![block(101, None, square_a())]);
        let mut roster = vec![train("v1", -36.846, 174.765, "EAST")];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert_eq!(roster[0].current_block, Some(101));

        assign_blocks(&mut roster, &map, &mut invisible, NOW + 301, 300);
        assert!(roster[0].current_block.is_none());
        assert!(roster[0].previous_block.is_none());
    }

    #[test]
    fn route_filter_excludes_block_by_substring() {
        let mut restricted = block(101, None, square_a());
        restricted.routes = vec!["WEST".to_string()];
        let map = TrackBlockMap::new(vec![restricted]);
        let mut roster = vec![train("v1", -36.846, 174.765, "EAST-201")];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert!(roster[0].current_block.is_none());

        roster[0].route = "WEST-4".to_string();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert_eq!(roster[0].current_block, Some(101));
    }

    #[test]
    fn transition_records_previous_block() {
        let square_b: Vec<(f64, f64)> = vec![
            (-36.84, 174.76),
            (-36.84, 174.77),
            (-36.83, 174.77),
            (-36.83, 174.76),
        ];
        let map = TrackBlockMap::new(vec![block(101, None, square_a()), block(102, None, square_b)]);
        let mut roster = vec![train("v1", -36.846, 174.765, "EAST")];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert_eq!(roster[0].current_block, Some(101));

        roster[0].lat = -36.835;
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert_eq!(roster[0].current_block, Some(102));
        assert_eq!(roster[0].previous_block, Some(101));
    }

    #[test]
    fn platform_disambiguation_by_stop_id() {
        let mut station = block(300, None, square_a());
        station.platforms = vec![
            Platform {
                block_number: 303,
                stop_ids: vec!["S3".to_string()],
                is_default: true,
                bearing: None,
                routes: Vec::new(),
            },
            Platform {
                block_number: 304,
                stop_ids: vec!["S4".to_string()],
                is_default: false,
                bearing: None,
                routes: Vec::new(),
            },
        ];
        let map = TrackBlockMap::new(vec![station]);
        let mut t = train("v1", -36.846, 174.765, "EAST");
        t.stops = vec![TrainStop {
            stop_id: "S4".to_string(),
            departure_time: NOW + 60,
        }];
        let mut roster = vec![t];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert_eq!(roster[0].current_block, Some(304));
    }

    #[test]
    fn platform_disambiguation_by_bearing() {
        let mut station = block(300, None, square_a());
        station.platforms = vec![
            Platform {
                block_number: 303,
                stop_ids: Vec::new(),
                is_default: true,
                bearing: Some(90.0),
                routes: Vec::new(),
            },
            Platform {
                block_number: 304,
                stop_ids: Vec::new(),
                is_default: true,
                bearing: Some(270.0),
                routes: Vec::new(),
            },
        ];
        let map = TrackBlockMap::new(vec![station]);
        let mut t = train("v1", -36.846, 174.765, "EAST");
        t.bearing = Some(265.0);
        let mut roster = vec![t];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert_eq!(roster[0].current_block, Some(304));
    }

    #[test]
    fn platform_falls_back_to_untimed_default() {
        let mut station = block(300, None, square_a());
        station.platforms = vec![
            Platform {
                block_number: 303,
                stop_ids: vec!["S3".to_string()],
                is_default: false,
                bearing: None,
                routes: Vec::new(),
            },
            Platform {
                block_number: 305,
                stop_ids: Vec::new(),
                is_default: true,
                bearing: None,
                routes: Vec::new(),
            },
        ];
        let map = TrackBlockMap::new(vec![station]);
        let mut roster = vec![train("v1", -36.846, 174.765, "EAST")];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert_eq!(roster[0].current_block, Some(305));
    }

    #[test]
    fn two_trains_same_block_use_alt_block() {
        let map = TrackBlockMap::new(vec![block(200, Some(201), square_a())]);
        let mut roster = vec![
            train("t2", -36.846, 174.765, "B"),
            train("t1", -36.847, 174.766, "A"),
        ];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);

        // Route "A" sorts first and keeps the block; "B" moves to the alt.
        let t1 = roster.iter().find(|t| t.train_id == "t1").unwrap();
        let t2 = roster.iter().find(|t| t.train_id == "t2").unwrap();
        assert_eq!(t1.current_block, Some(200));
        assert_eq!(t2.current_block, Some(201));
        assert!(invisible.is_empty());
    }

    #[test]
    fn third_train_in_block_goes_invisible() {
        let map = TrackBlockMap::new(vec![block(200, Some(201), square_a())]);
        let mut roster = vec![
            train("t1", -36.846, 174.765, "A"),
            train("t2", -36.847, 174.766, "B"),
            train("t3", -36.848, 174.767, "C"),
        ];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);

        assert_eq!(invisible.len(), 1);
        assert!(invisible.contains("t3"));
        // The excess train keeps its block assignment.
        let t3 = roster.iter().find(|t| t.train_id == "t3").unwrap();
        assert_eq!(t3.current_block, Some(200));
    }

    #[test]
    fn out_of_service_train_yields_the_block() {
        let map = TrackBlockMap::new(vec![block(200, Some(201), square_a())]);
        let mut roster = vec![
            train("ghost", -36.846, 174.765, OUT_OF_SERVICE),
            train("real", -36.847, 174.766, "EAST"),
        ];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);

        let real = roster.iter().find(|t| t.train_id == "real").unwrap();
        let ghost = roster.iter().find(|t| t.train_id == "ghost").unwrap();
        assert_eq!(real.current_block, Some(200));
        assert_eq!(ghost.current_block, Some(201));
    }

    #[test]
    fn two_trains_without_alt_block_hide_the_second() {
        let map = TrackBlockMap::new(vec![block(200, None, square_a())]);
        let mut roster = vec![
            train("t1", -36.846, 174.765, "A"),
            train("t2", -36.847, 174.766, "B"),
        ];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert!(invisible.contains("t2"));
        assert_eq!(invisible.len(), 1);
    }

    #[test]
    fn occupancy_invariant_holds_per_block_and_alt() {
        let map = TrackBlockMap::new(vec![block(200, Some(201), square_a())]);
        let mut roster: Vec<TrainInfo> = (0..5)
            .map(|i| train(&format!("t{i}"), -36.846 - 0.0002 * i as f64, 174.765, "R"))
            .collect();
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);

        let visible_on = |n: i32| {
            roster
                .iter()
                .filter(|t| t.current_block == Some(n) && !invisible.contains(&t.train_id))
                .count()
        };
        assert!(visible_on(200) <= 1);
        assert!(visible_on(201) <= 1);
        assert_eq!(invisible.len(), 3);
    }

    #[test]
    fn pair_invisible_train_does_not_claim_the_block() {
        let map = TrackBlockMap::new(vec![block(200, None, square_a())]);
        let mut roster = vec![
            train("hidden", -36.846, 174.765, "A"),
            train("shown", -36.847, 174.766, "B"),
        ];
        let mut invisible: HashSet<String> = ["hidden".to_string()].into();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);

        // The pair-hidden train is not an occupant, so "shown" stays visible.
        assert_eq!(invisible.len(), 1);
    }

    #[test]
    fn priority_block_wins_overlap() {
        // Both polygons cover the point; the priority block sorts first.
        let mut station = block(300, None, square_a());
        station.priority = true;
        station.name = "300 Britomart".to_string();
        let plain = block(101, None, square_a());
        let map = TrackBlockMap::new(vec![plain, station]);

        let mut roster = vec![train("v1", -36.846, 174.765, "EAST")];
        let mut invisible = HashSet::new();
        assign_blocks(&mut roster, &map, &mut invisible, NOW, 300);
        assert_eq!(roster[0].current_block, Some(300));
    }
}
