use axum::{routing::get, Router};

use super::health::{health, metrics, not_found, HealthState};

/// Health-plane router. No trace layer: probes are not logged.
pub fn health_routes(state: HealthState, expose_metrics: bool) -> Router {
    let mut router = Router::new().route("/health", get(health));

    if expose_metrics {
        router = router.route("/metrics", get(metrics));
    }

    router
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .with_state(state)
}
