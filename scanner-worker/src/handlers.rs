use std::sync::Arc;

use axum::extract::State;
use axum::{routing, Json, Router};
use scanner_common::health::HealthRegistry;
use scanner_common::registry::{EntrySnapshot, Registry};

/// Admin routes: liveness and a read-only view of the registry.
/// Metrics are added on top by `setup_metrics_routes`.
pub fn app(registry: Arc<Registry>, liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
        .route("/_registry", routing::get(entries).with_state(registry))
}

pub async fn index() -> &'static str {
    "token address scanner"
}

async fn entries(State(registry): State<Arc<Registry>>) -> Json<Vec<EntrySnapshot>> {
    Json(registry.snapshot())
}
