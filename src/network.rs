//! Per-network state owner and cycle driver.
//!
//! A `Network` owns everything for one rail network: config, loaded block
//! map and stops, the HTTP client, and the mutable tick state behind an
//! async `RwLock`. Cycles are serialized by construction (one loop per
//! network awaiting each cycle), and the HTTP handlers read the state
//! concurrently through the lock, so a reader always observes a complete
//! cycle's output.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::blocks::{load_track_blocks, LoadError, TrackBlockMap};
use crate::cache;
use crate::config::{ConfigError, NetworkConfig};
use crate::entities::EntityStore;
use crate::feed::fetch::fetch_cycle;
use crate::feed::FeedEntity;
use crate::led::LedRailsApi;
use crate::pairs::{PairCandidate, PairDetector, TrainPair};
use crate::stops::{load_stops, StopsMap};
use crate::tracker::{self, TrainInfo};

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("data load: {0}")]
    Load(#[from] LoadError),
    #[error("HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Default)]
pub struct NetworkState {
    pub entities: EntityStore,
    pub pairs: PairDetector,
    pub roster: Vec<TrainInfo>,
    /// Vehicles suppressed in the last completed cycle.
    pub invisible: HashSet<String>,
    pub led_apis: Vec<LedRailsApi>,
    /// Epoch seconds of the last tick attempt and the last success.
    pub last_attempt: Option<u64>,
    pub last_success: Option<u64>,
    last_eviction_ms: u64,
}

pub struct Network {
    pub id: String,
    /// Lowercased mount segment, e.g. `akl-ltm`.
    pub mount: String,
    pub config: NetworkConfig,
    pub blocks: Option<TrackBlockMap>,
    pub stops: Option<StopsMap>,
    api_key: Option<String>,
    client: reqwest::Client,
    cache_base: PathBuf,
    started: Instant,
    state: RwLock<NetworkState>,
}

impl Network {
    /// Loads one network from its `railNetworks/<ID>` directory. The API
    /// key comes from the environment variable named after the network id.
    pub fn load(dir: &Path, cache_base: &Path) -> Result<Self, NetworkError> {
        let id = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let config = NetworkConfig::load(&dir.join("config.json"))?;
        config.validate(&id);

        let blocks = match &config.track_blocks {
            Some(file) => {
                let map = load_track_blocks(&dir.join(&file.file_name))?;
                info!(network = %id, blocks = map.len(), "loaded track blocks");
                Some(map)
            }
            None => None,
        };

        let stops = match &config.stops {
            Some(file) => {
                let map = load_stops(&dir.join(&file.file_name))?;
                info!(network = %id, stops = map.len(), "loaded stops map");
                Some(map)
            }
            None => None,
        };

        let api_key = std::env::var(&id).ok();
        if config.gtfs_realtime_api.key_header.is_some() && api_key.is_none() {
            warn!(network = %id, "keyHeader configured but no API key in environment");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let mut state = NetworkState::default();
        if let Some(led) = &config.led_rails_api {
            state.led_apis = led
                .api_versions
                .iter()
                .map(|version| {
                    LedRailsApi::new(
                        version,
                        led,
                        config.processing_options.display_threshold,
                        config.gtfs_realtime_api.fetch_interval_seconds,
                    )
                })
                .collect();
        }

        if config.processing_options.cache_gtfs {
            match cache::load::<HashMap<String, FeedEntity>>(cache_base, &id, cache::ENTITIES_CACHE)
            {
                Ok(Some(map)) => {
                    info!(network = %id, entities = map.len(), "restored entity cache");
                    state.entities = EntityStore::from_map(map);
                }
                Ok(None) => {}
                Err(e) => warn!(network = %id, error = %e, "entity cache restore failed"),
            }
            match cache::load::<Vec<TrainPair>>(cache_base, &id, cache::TRAIN_PAIRS_CACHE) {
                Ok(Some(pairs)) => {
                    info!(network = %id, pairs = pairs.len(), "restored pair cache");
                    state.pairs = PairDetector::new(pairs);
                }
                Ok(None) => {}
                Err(e) => warn!(network = %id, error = %e, "pair cache restore failed"),
            }
        }

        Ok(Self {
            mount: format!("{}-ltm", id.to_lowercase()),
            id,
            config,
            blocks,
            stops,
            api_key,
            client,
            cache_base: cache_base.to_path_buf(),
            started: Instant::now(),
            state: RwLock::new(state),
        })
    }

    pub async fn state(&self) -> RwLockReadGuard<'_, NetworkState> {
        self.state.read().await
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// One full tick: fetch outside the lock, then run the processing
    /// stages under the write lock so readers see whole cycles only.
    pub async fn run_cycle(&self) {
        let started = Instant::now();
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;

        self.state.write().await.last_attempt = Some(now_ms / 1000);

        let fetched = fetch_cycle(
            &self.client,
            &self.config.gtfs_realtime_api,
            self.api_key.as_deref(),
        )
        .await;

        let mut guard = self.state.write().await;
        self.process(&mut guard, fetched, now_ms);
        info!(
            network = %self.id,
            entities = guard.entities.len(),
            roster = guard.roster.len(),
            invisible = guard.invisible.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cycle complete"
        );
    }

    /// The post-fetch pipeline: ingest, evict, filter, pair, track, emit.
    fn process(&self, st: &mut NetworkState, fetched: Vec<FeedEntity>, now_ms: u64) {
        let now = now_ms / 1000;
        let opts = &self.config.processing_options;

        st.entities.ingest(fetched);

        if let Some(hours) = opts.remove_stale_vehicles_hours {
            let interval_ms = hours.saturating_mul(3_600_000);
            if now_ms.saturating_sub(st.last_eviction_ms) >= interval_ms {
                st.entities.evict_stale(now_ms, interval_ms);
                st.last_eviction_ms = now_ms;
            }
        }

        let trains = st.entities.trains(&self.config.train_filter);

        let mut invisible = HashSet::new();
        if opts.pair_trains {
            let candidates: HashMap<String, PairCandidate> = trains
                .iter()
                .filter_map(|e| PairCandidate::from_entity(e))
                .map(|c| (c.id.clone(), c))
                .collect();
            st.pairs.update(&candidates, now, &self.config.pair_detection);
            invisible = st.pairs.invisible_ids(&candidates);
        }

        tracker::sync_roster(&mut st.roster, &trains, now, opts);
        if let Some(blocks) = &self.blocks {
            tracker::assign_blocks(
                &mut st.roster,
                blocks,
                &mut invisible,
                now,
                opts.display_threshold,
            );
        }

        for api in &mut st.led_apis {
            api.generate(&st.roster, &invisible, now_ms);
        }

        st.invisible = invisible;
        st.last_success = Some(now);
    }

    /// Spawns the tick loop and, when caching is enabled, the save loop.
    /// A tick that overruns the interval is never re-entered: the loop
    /// awaits each cycle and skips the missed ticks.
    pub async fn start(self: Arc<Self>) {
        let tick_net = self.clone();
        let tick_loop = tokio::spawn(async move {
            let period = tick_net
                .config
                .gtfs_realtime_api
                .fetch_interval_seconds
                .max(1);
            let mut interval = tokio::time::interval(Duration::from_secs(period));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tick_net.run_cycle().await;
            }
        });

        if self.config.processing_options.cache_gtfs {
            let save_net = self.clone();
            let save_loop = tokio::spawn(async move {
                let period = save_net
                    .config
                    .processing_options
                    .cache_interval_seconds
                    .max(1);
                let mut interval = tokio::time::interval(Duration::from_secs(period));
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // The first tick fires immediately; nothing to save yet.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    save_net.save_caches().await;
                }
            });
            let _ = tokio::join!(tick_loop, save_loop);
        } else {
            let _ = tick_loop.await;
        }
    }

    async fn save_caches(&self) {
        let (entities, pairs) = {
            let guard = self.state.read().await;
            (guard.entities.map().clone(), guard.pairs.pairs().to_vec())
        };

        if let Err(e) = cache::save(&self.cache_base, &self.id, cache::ENTITIES_CACHE, &entities) {
            warn!(network = %self.id, error = %e, "entity cache save failed");
        }
        if let Err(e) = cache::save(&self.cache_base, &self.id, cache::TRAIN_PAIRS_CACHE, &pairs) {
            warn!(network = %self.id, error = %e, "pair cache save failed");
        }
    }
}
