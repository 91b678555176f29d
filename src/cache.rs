//! Advisory persistence for the entity store and pair set.
//!
//! State is written as gzip-compressed JSON under
//! `cache/<networkId>/<name>.json.gz`. Writes go through a temp file and a
//! rename so a crash mid-save never corrupts the previous snapshot. A cold
//! start without cache files is normal and treated as empty state.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const ENTITIES_CACHE: &str = "entities";
pub const TRAIN_PAIRS_CACHE: &str = "trainPairs";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn cache_path(base: &Path, network_id: &str, name: &str) -> PathBuf {
    base.join(network_id).join(format!("{name}.json.gz"))
}

pub fn save<T: Serialize>(
    base: &Path,
    network_id: &str,
    name: &str,
    value: &T,
) -> Result<(), CacheError> {
    let path = cache_path(base, network_id, name);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let temp_path = path.with_extension("gz.tmp");
    let file = File::create(&temp_path)?;
    let writer = BufWriter::new(file);
    let mut encoder = GzEncoder::new(writer, Compression::default());
    serde_json::to_writer(&mut encoder, value)?;
    encoder.finish()?;

    std::fs::rename(temp_path, path)?;
    Ok(())
}

/// Returns `Ok(None)` when the cache file does not exist.
pub fn load<T: DeserializeOwned>(
    base: &Path,
    network_id: &str,
    name: &str,
) -> Result<Option<T>, CacheError> {
    let path = cache_path(base, network_id, name);
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(path)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    Ok(Some(serde_json::from_reader(decoder)?))
}
