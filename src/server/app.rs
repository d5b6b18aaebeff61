use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::websocket::ws_handler;

use super::AppState;

/// Message-plane router. Peers may connect on any path.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .fallback(ws_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
