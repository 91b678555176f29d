//! LED board output generation.
//!
//! Each configured board revision gets its own `LedRailsApi` holding the
//! color table, the block remap rules and the latest published payload.
//! The payload is rebuilt wholesale every cycle and swapped in atomically
//! by the network state, so readers never observe a half-written output.

use std::collections::{BTreeMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

use crate::config::{ApiVersionConfig, BlockRemapRule, LedRailsApiConfig};
use crate::tracker::TrainInfo;

/// One block transition on the wire: `b` is `[previousBlock, currentBlock]`
/// (0 when the predecessor is unknown), `c` the color id, `t` the offset in
/// seconds within the animation window. Field names are firmware contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LedUpdate {
    pub b: [i32; 2],
    pub c: u32,
    pub t: u64,
}

/// The published payload for one board revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LedOutput {
    pub version: String,
    /// Epoch seconds of the cycle that produced this payload.
    pub timestamp: u64,
    /// Seconds until the next tick; doubles as the animation window.
    pub update: u64,
    /// Dense color table: colorId -> [R, G, B].
    pub colors: BTreeMap<u32, [u8; 3]>,
    pub updates: Vec<LedUpdate>,
}

#[derive(Debug, Clone)]
pub struct LedRailsApi {
    pub version: String,
    /// Mount path of this revision's payload, e.g. `/v2.json`.
    pub url: String,
    /// Route -> color id, in config declaration order.
    route_to_color_id: Vec<(String, u32)>,
    block_remap: Vec<BlockRemapRule>,
    pub display_threshold: u64,
    pub randomize_time_offset: bool,
    pub update_interval: u64,
    pub output: LedOutput,
}

impl LedRailsApi {
    pub fn new(
        version: &ApiVersionConfig,
        led: &LedRailsApiConfig,
        display_threshold: u64,
        update_interval: u64,
    ) -> Self {
        let entries = led.color_entries();
        let route_to_color_id: Vec<(String, u32)> = entries
            .iter()
            .enumerate()
            .map(|(i, (route, _))| (route.clone(), i as u32))
            .collect();
        let colors: BTreeMap<u32, [u8; 3]> = entries
            .iter()
            .enumerate()
            .map(|(i, (_, rgb))| (i as u32, *rgb))
            .collect();

        Self {
            version: version.version.clone(),
            url: format!("/{}.json", version.version),
            route_to_color_id,
            block_remap: version.block_remap.clone(),
            display_threshold,
            randomize_time_offset: led.randomize_time_offset,
            update_interval,
            output: LedOutput {
                version: version.version.clone(),
                timestamp: 0,
                update: update_interval,
                colors,
                updates: Vec::new(),
            },
        }
    }

    /// Exact route key first, then the first configured route that is a
    /// substring of the train's route (config order), mirroring the block
    /// route filter.
    pub fn color_id_for(&self, route: &str) -> Option<u32> {
        self.route_to_color_id
            .iter()
            .find(|(key, _)| key == route)
            .or_else(|| {
                self.route_to_color_id
                    .iter()
                    .find(|(key, _)| route.contains(key.as_str()))
            })
            .map(|(_, id)| *id)
    }

    /// Rebuilds the payload from the current roster.
    pub fn generate(&mut self, roster: &[TrainInfo], invisible: &HashSet<String>, now_ms: u64) {
        let now = now_ms.div_ceil(1000);
        let display_cutoff = now.saturating_sub(self.display_threshold);
        let update_time = now.saturating_sub(self.update_interval);

        let mut updates = Vec::new();
        let mut rng = rand::thread_rng();

        for train in roster {
            if train.timestamp < display_cutoff || invisible.contains(&train.train_id) {
                continue;
            }
            let Some(current) = train.current_block else {
                continue;
            };
            let previous = train.previous_block.unwrap_or(0);

            let Some(color_id) = self.color_id_for(&train.route) else {
                warn!(
                    train = %train.train_id,
                    route = %train.route,
                    "no color mapping for route, dropping update"
                );
                continue;
            };

            let t = if self.randomize_time_offset {
                if previous == current || self.update_interval < 2 {
                    0
                } else {
                    rng.gen_range(1..self.update_interval)
                }
            } else {
                train.timestamp.saturating_sub(update_time)
            };

            updates.push(LedUpdate {
                b: [self.remap(previous), self.remap(current)],
                c: color_id,
                t,
            });
        }

        self.output.updates = updates;
        // Monotonic per board revision even if the clock steps backwards.
        self.output.timestamp = now.max(self.output.timestamp);
    }

    /// Applies the first matching remap rule, if any.
    fn remap(&self, block: i32) -> i32 {
        self.block_remap
            .iter()
            .find(|r| r.start <= block && block <= r.end)
            .map(|r| block + r.offset)
            .unwrap_or(block)
    }
}
