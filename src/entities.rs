//! Vehicle entity store and the train filter.
//!
//! The store is keyed by vehicle id and carries entities across cycles:
//! a vehicle missing from one fetch keeps its last known record until the
//! stale-eviction pass drops it.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info};

use crate::feed::FeedEntity;

#[derive(Debug, Default, Clone)]
pub struct EntityStore {
    map: HashMap<String, FeedEntity>,
}

impl EntityStore {
    pub fn from_map(map: HashMap<String, FeedEntity>) -> Self {
        Self { map }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn map(&self) -> &HashMap<String, FeedEntity> {
        &self.map
    }

    /// Merges one cycle's fetch into the store. Later entities win within
    /// the batch, and the whole batch wins over the prior cycle's records.
    /// Deleted entities drop the stored record.
    pub fn ingest(&mut self, entities: Vec<FeedEntity>) {
        for entity in entities {
            let Some(vehicle_id) = entity.vehicle_id().map(str::to_string) else {
                debug!(entity = %entity.id, "entity has no vehicle id, skipping");
                continue;
            };
            if entity.is_deleted {
                self.map.remove(&vehicle_id);
            } else {
                self.map.insert(vehicle_id, entity);
            }
        }
    }

    /// Drops entities whose feed timestamp is older than `max_age_ms`.
    pub fn evict_stale(&mut self, now_ms: u64, max_age_ms: u64) -> usize {
        let before = self.map.len();
        let cutoff = now_ms.saturating_sub(max_age_ms);
        self.map.retain(|_, e| match e.timestamp() {
            Some(ts) => ts.saturating_mul(1000) >= cutoff,
            None => false,
        });
        let removed = before - self.map.len();
        if removed > 0 {
            info!(removed, remaining = self.map.len(), "evicted stale vehicles");
        }
        removed
    }

    /// Applies the train filter, returning borrowed entities.
    pub fn trains<'a>(&'a self, filter: &TrainFilterConfig) -> Vec<&'a FeedEntity> {
        self.map.values().filter(|e| filter.matches(e)).collect()
    }
}

/// Train filter configuration. The two modes are mutually exclusive by
/// config: an entity-id range, or trip-id substring include/exclude lists.
/// An empty configuration passes every entity through.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrainFilterConfig {
    #[serde(rename = "entityID", default)]
    pub entity_id: Option<EntityIdRange>,
    #[serde(rename = "trip_ID", default)]
    pub trip_id: Option<TripIdFilter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityIdRange {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TripIdFilter {
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl TrainFilterConfig {
    pub fn matches(&self, entity: &FeedEntity) -> bool {
        if let Some(range) = &self.entity_id {
            return entity
                .id
                .parse::<i64>()
                .map(|n| n >= range.start && n <= range.end)
                .unwrap_or(false);
        }
        if let Some(filter) = &self.trip_id {
            let Some(trip_id) = entity.trip_id() else {
                // No trip id to test against: excluded only when an
                // include list demands a match.
                return filter.includes.is_empty();
            };
            if filter.excludes.iter().any(|x| trip_id.contains(x.as_str())) {
                return false;
            }
            if !filter.includes.is_empty() {
                return filter.includes.iter().any(|x| trip_id.contains(x.as_str()));
            }
            return true;
        }
        true
    }
}
