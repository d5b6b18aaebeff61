//! Prometheus metrics for the signaling relay.
//!
//! - Connection metrics (active, opened, closed, rejected)
//! - Relay metrics (inbound messages, delivery outcomes, fan-out latency)
//! - Keep-alive metrics

mod helpers;

pub use helpers::{encode_metrics, ConnectionMetrics, KeepAliveMetrics, RelayMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "signal_relay";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Number of registered WebSocket connections
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of registered WebSocket connections"
    ).unwrap();

    /// Total connections accepted
    pub static ref CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections opened"
    ).unwrap();

    /// Total connections closed
    pub static ref CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    /// Connections rejected by the connection limit
    pub static ref CONNECTIONS_REJECTED: IntCounter = register_int_counter!(
        format!("{}_connections_rejected_total", METRIC_PREFIX),
        "Total WebSocket connections rejected by the connection limit"
    ).unwrap();

    /// Connection lifetime
    pub static ref CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_connection_duration_seconds", METRIC_PREFIX),
        "WebSocket connection duration in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0]
    ).unwrap();

    // ============================================================================
    // Relay Metrics
    // ============================================================================

    /// Inbound messages by frame kind
    pub static ref MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_received_total", METRIC_PREFIX),
        "Total inbound messages accepted for relay",
        &["kind"]
    ).unwrap();

    /// Per-recipient delivery outcomes
    pub static ref DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_deliveries_total", METRIC_PREFIX),
        "Per-recipient delivery attempts by outcome",
        &["outcome"]
    ).unwrap();

    /// Time to fan one message out to all recipients
    pub static ref BROADCAST_DURATION: Histogram = register_histogram!(
        format!("{}_broadcast_duration_seconds", METRIC_PREFIX),
        "Broadcast fan-out duration in seconds",
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // ============================================================================
    // Keep-alive Metrics
    // ============================================================================

    /// Connections closed because a ping went unanswered
    pub static ref KEEPALIVE_TIMEOUTS: IntCounter = register_int_counter!(
        format!("{}_keepalive_timeouts_total", METRIC_PREFIX),
        "Total connections closed after a keep-alive ping timeout"
    ).unwrap();
}
