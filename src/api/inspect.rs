//! Read-only inspection endpoints: the raw entity store, the filtered
//! train set, the tracked roster and the stops map.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::ErrorResponse;
use crate::feed::FeedEntity;
use crate::network::Network;
use crate::tracker::TrainInfo;

/// Raw entity store, keyed by vehicle id.
#[utoipa::path(
    get,
    path = "/api/vehicles",
    responses((status = 200, description = "All stored vehicle entities")),
    tag = "inspect"
)]
pub async fn vehicles(State(network): State<Arc<Network>>) -> Json<HashMap<String, FeedEntity>> {
    let state = network.state().await;
    Json(state.entities.map().clone())
}

/// Entities passing the train filter.
#[utoipa::path(
    get,
    path = "/api/vehicles/trains",
    responses((status = 200, description = "Filtered train entities")),
    tag = "inspect"
)]
pub async fn trains(State(network): State<Arc<Network>>) -> Json<Vec<FeedEntity>> {
    let state = network.state().await;
    let trains = state
        .entities
        .trains(&network.config.train_filter)
        .into_iter()
        .cloned()
        .collect();
    Json(trains)
}

/// The tracked-train roster with block assignments.
#[utoipa::path(
    get,
    path = "/api/trackedtrains",
    responses((status = 200, description = "Tracked trains", body = [TrainInfo])),
    tag = "inspect"
)]
pub async fn tracked_trains(State(network): State<Arc<Network>>) -> Json<Vec<TrainInfo>> {
    let state = network.state().await;
    Json(state.roster.clone())
}

/// The stops map, when one is configured for this network.
#[utoipa::path(
    get,
    path = "/api/stops",
    responses(
        (status = 200, description = "Stops map"),
        (status = 404, description = "No stops map configured", body = ErrorResponse)
    ),
    tag = "inspect"
)]
pub async fn stops(State(network): State<Arc<Network>>) -> Response {
    match &network.stops {
        Some(stops) => Json(stops).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("no stops map configured")),
        )
            .into_response(),
    }
}
