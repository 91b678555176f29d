//! GTFS stops map, loaded once at startup from a `stops.txt`-style CSV.
//!
//! The map is served verbatim on the inspection surface; the pipeline
//! itself matches platform stop ids against trip updates, not this file.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::blocks::LoadError;

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Stop {
    pub stop_id: String,
    #[serde(default)]
    pub stop_name: String,
    #[serde(default)]
    pub stop_lat: Option<f64>,
    #[serde(default)]
    pub stop_lon: Option<f64>,
}

pub type StopsMap = HashMap<String, Stop>;

pub fn load_stops(path: &Path) -> Result<StopsMap, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut stops = StopsMap::new();
    for record in reader.deserialize::<Stop>() {
        let stop = record?;
        stops.insert(stop.stop_id.clone(), stop);
    }
    Ok(stops)
}
