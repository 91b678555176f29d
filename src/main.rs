mod api;
mod blocks;
mod cache;
mod config;
mod entities;
mod feed;
mod geometry;
mod led;
mod network;
mod pairs;
mod stops;
mod tracker;

use std::path::Path;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use network::Network;

/// Root directory scanned for `<ID>/config.json` network definitions.
const NETWORKS_DIR: &str = "railNetworks";
const CACHE_DIR: &str = "cache";

#[derive(OpenApi)]
#[openapi(
    info(title = "LED Rails API", version = "0.1.0"),
    paths(
        api::status::status,
        api::outputs::output_by_file,
        api::inspect::vehicles,
        api::inspect::trains,
        api::inspect::tracked_trains,
        api::inspect::stops,
    ),
    components(schemas(
        api::status::StatusResponse,
        api::ErrorResponse,
        led::LedOutput,
        led::LedUpdate,
        tracker::TrainInfo,
        tracker::TrainStop,
        stops::Stop,
    )),
    tags(
        (name = "led", description = "LED board payloads, one per board revision"),
        (name = "status", description = "Per-network health"),
        (name = "inspect", description = "Raw pipeline state for debugging")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .init();

    let networks = load_networks(Path::new(NETWORKS_DIR));
    if networks.is_empty() {
        tracing::error!(dir = NETWORKS_DIR, "no networks loaded, nothing to serve");
        std::process::exit(1);
    }

    for network in &networks {
        tokio::spawn(network.clone().start());
    }

    let mut app = Router::new().route("/", get(root));
    for network in &networks {
        app = app.nest(
            &format!("/{}", network.mount),
            api::network_router(network.clone()),
        );
        tracing::info!(network = %network.id, mount = %network.mount, "mounted network");
    }
    let app = app
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .unwrap_or_else(|e| {
            tracing::error!(port, error = %e, "failed to bind");
            std::process::exit(1);
        });

    tracing::info!(port, networks = networks.len(), "server running");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server terminated");
        std::process::exit(1);
    }
}

/// Loads every network directory, skipping the broken ones loudly. A
/// single bad config must not take down its siblings.
fn load_networks(root: &Path) -> Vec<Arc<Network>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(dir = %root.display(), error = %e, "cannot read networks directory");
            std::process::exit(1);
        }
    };

    let mut dirs: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    let mut networks = Vec::new();
    for dir in dirs {
        match Network::load(&dir, Path::new(CACHE_DIR)) {
            Ok(network) => {
                tracing::info!(network = %network.id, "loaded network");
                networks.push(Arc::new(network));
            }
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %e, "failed to load network, skipping");
            }
        }
    }
    networks
}

async fn root() -> &'static str {
    "LED Rails API"
}
