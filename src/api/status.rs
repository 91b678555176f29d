use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::network::Network;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// `ok` once a tick has succeeded, `waiting` before that.
    pub status: String,
    pub epoch: u64,
    /// Seconds since this network was loaded.
    pub uptime: u64,
    pub refresh_interval: u64,
    pub track_blocks: usize,
    pub entities: usize,
    pub tracked_trains: usize,
}

/// Network health and store sizes.
#[utoipa::path(
    get,
    path = "/status",
    responses(
        (status = 200, description = "Network status", body = StatusResponse)
    ),
    tag = "status"
)]
pub async fn status(State(network): State<Arc<Network>>) -> Json<StatusResponse> {
    let state = network.state().await;
    Json(StatusResponse {
        status: if state.last_success.is_some() {
            "ok".to_string()
        } else {
            "waiting".to_string()
        },
        epoch: Utc::now().timestamp().max(0) as u64,
        uptime: network.uptime_seconds(),
        refresh_interval: network.config.gtfs_realtime_api.fetch_interval_seconds,
        track_blocks: network.blocks.as_ref().map(|b| b.len()).unwrap_or(0),
        entities: state.entities.len(),
        tracked_trains: state.roster.len(),
    })
}
