//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    BROADCAST_DURATION, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED, CONNECTIONS_OPENED,
    CONNECTIONS_REJECTED, CONNECTION_DURATION, DELIVERIES_TOTAL, KEEPALIVE_TIMEOUTS,
    MESSAGES_RECEIVED,
};
use crate::relay::DeliveryReport;

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    exposition_text(buffer)
}

fn exposition_text(buffer: Vec<u8>) -> Result<String, prometheus::Error> {
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("metrics output is not UTF-8: {}", e)))
}

pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        CONNECTIONS_OPENED.inc();
        CONNECTIONS_ACTIVE.inc();
    }

    pub fn record_closed(duration: Duration) {
        CONNECTIONS_CLOSED.inc();
        CONNECTIONS_ACTIVE.dec();
        CONNECTION_DURATION.observe(duration.as_secs_f64());
    }

    pub fn record_rejected() {
        CONNECTIONS_REJECTED.inc();
    }
}

pub struct RelayMetrics;

impl RelayMetrics {
    pub fn record_received(kind: &str) {
        MESSAGES_RECEIVED.with_label_values(&[kind]).inc();
    }

    /// Record the outcome counts of one fan-out
    pub fn record_report(report: &DeliveryReport, elapsed: Duration) {
        BROADCAST_DURATION.observe(elapsed.as_secs_f64());

        let outcomes = [
            ("delivered", report.delivered),
            ("failed", report.failed),
            ("timed_out", report.timed_out),
            ("skipped", report.skipped),
        ];
        for (outcome, count) in outcomes {
            if count > 0 {
                DELIVERIES_TOTAL
                    .with_label_values(&[outcome])
                    .inc_by(count as u64);
            }
        }
    }
}

pub struct KeepAliveMetrics;

impl KeepAliveMetrics {
    pub fn record_timeout() {
        KEEPALIVE_TIMEOUTS.inc();
    }
}
