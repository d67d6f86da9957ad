//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::routing::{get, put};
use cask_core::{PROXY_MULTIPART_PATH, PROXY_UPLOAD_PATH};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        // Health check (unauthenticated for load balancers/k8s probes)
        .route("/api/health", get(handlers::health_check))
        // Proxy upload relay, authorized by the signed query alone
        .route(PROXY_UPLOAD_PATH, put(handlers::proxy_upload))
        .route(PROXY_MULTIPART_PATH, put(handlers::proxy_multipart));

    // SECURITY: When enabled, this endpoint MUST be network-restricted
    // to authorized Prometheus scraper IPs only.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
