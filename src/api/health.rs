//! Liveness probe and the health plane's not-found response.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::encode_metrics;

pub const SERVICE_NAME: &str = "webrtc-signaling-relay";

/// Static identity of this process, fixed once both listeners are bound
#[derive(Debug, Clone)]
pub struct HealthState {
    pub service: String,
    pub version: String,
    /// Advertised message-plane address
    pub ws_url: String,
    /// Advertised health-plane address
    pub http_url: String,
}

impl HealthState {
    pub fn new(advertise_host: &str, relay_port: u16, health_port: u16) -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ws_url: format!("ws://{}:{}", advertise_host, relay_port),
            http_url: format!("http://{}:{}/health", advertise_host, health_port),
        }
    }
}

/// Computed fresh for every probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub service: String,
    pub ts: String,
    pub version: String,
    pub ws: String,
    pub http: String,
}

impl HealthStatus {
    pub fn now(state: &HealthState) -> Self {
        Self {
            ok: true,
            service: state.service.clone(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            version: state.version.clone(),
            ws: state.ws_url.clone(),
            http: state.http_url.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotFoundResponse {
    pub ok: bool,
    pub error: String,
}

pub async fn health(State(state): State<HealthState>) -> Json<HealthStatus> {
    Json(HealthStatus::now(&state))
}

pub async fn not_found() -> (StatusCode, Json<NotFoundResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundResponse {
            ok: false,
            error: "not_found".to_string(),
        }),
    )
}

pub async fn metrics() -> Response {
    match encode_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
