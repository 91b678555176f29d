pub mod error;
pub mod inspect;
pub mod outputs;
pub mod status;

pub use error::ErrorResponse;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::network::Network;

/// Routes for one network, nested under `/<id-lower>-ltm/` by the caller.
/// The `{file}` route serves `<version>.json` payloads; static routes take
/// precedence over it.
pub fn network_router(network: Arc<Network>) -> Router {
    Router::new()
        .route("/status", get(status::status))
        .route("/api/vehicles", get(inspect::vehicles))
        .route("/api/vehicles/trains", get(inspect::trains))
        .route("/api/trackedtrains", get(inspect::tracked_trains))
        .route("/api/stops", get(inspect::stops))
        .route("/{file}", get(outputs::output_by_file))
        .with_state(network)
}
