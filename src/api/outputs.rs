use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::ErrorResponse;
use crate::led::LedOutput;
use crate::network::Network;

/// Serves `/<version>.json` for every configured board revision. Until the
/// first successful tick the boards get a 503 with the last attempt time,
/// not an empty payload they would render as an all-dark map.
#[utoipa::path(
    get,
    path = "/{version}.json",
    params(("version" = String, Path, description = "Board revision")),
    responses(
        (status = 200, description = "LED board payload", body = LedOutput),
        (status = 404, description = "Unknown board revision", body = ErrorResponse),
        (status = 503, description = "No successful ingestion cycle yet", body = ErrorResponse)
    ),
    tag = "led"
)]
pub async fn output_by_file(
    State(network): State<Arc<Network>>,
    Path(file): Path<String>,
) -> Response {
    let Some(version) = file.strip_suffix(".json") else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("no such resource: {file}"))),
        )
            .into_response();
    };

    let state = network.state().await;
    let Some(api) = state.led_apis.iter().find(|a| a.version == version) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("unknown board revision: {version}"))),
        )
            .into_response();
    };

    if state.last_success.is_none() {
        let mut error = ErrorResponse::new("no successful ingestion cycle yet");
        error.last_attempt = state.last_attempt;
        return (StatusCode::SERVICE_UNAVAILABLE, Json(error)).into_response();
    }

    Json(api.output.clone()).into_response()
}
