//! Prometheus export for the scanner counters, served next to the admin routes.
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// Verification races are bounded by the slowest provider timeout, 8 seconds by default.
const VERIFICATION_SECONDS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0];

/// Serve `router` on `bind` until the listener fails.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await
}

/// Install the global recorder and expose it as `/metrics` on `router`.
/// Fails if a recorder was already installed in this process.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let handle = setup_metrics_recorder()?;

    Ok(router.route("/metrics", get(move || std::future::ready(handle.render()))))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets(VERIFICATION_SECONDS)?
        .install_recorder()
}
