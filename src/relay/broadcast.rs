use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use uuid::Uuid;

use crate::connection_manager::{ConnectionHandle, ConnectionRegistry, ConnectionState};
use crate::error::DeliveryError;
use crate::metrics::RelayMetrics;
use crate::websocket::RelayMessage;

/// Maximum number of deliveries in flight for one broadcast
const MAX_CONCURRENT_DELIVERIES: usize = 100;

/// Outcome of fanning one message out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Snapshot members other than the sender
    pub recipients: usize,
    pub delivered: usize,
    /// Recipient's outbound channel was already closed
    pub failed: usize,
    /// Recipient's outbound buffer stayed full past the send timeout
    pub timed_out: usize,
    /// Recipient was already closing
    pub skipped: usize,
}

/// Statistics for the relay
#[derive(Debug, Default)]
pub struct RelayStats {
    pub messages_relayed: AtomicU64,
    pub total_delivered: AtomicU64,
    pub total_failed: AtomicU64,
    pub total_timed_out: AtomicU64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_timed_out: self.total_timed_out.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: &DeliveryReport) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
        self.total_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.total_failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        self.total_timed_out
            .fetch_add(report.timed_out as u64, Ordering::Relaxed);
    }
}

/// Snapshot of relay statistics
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatsSnapshot {
    pub messages_relayed: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
}

/// Fans inbound messages out to every other registered connection.
///
/// There is no pairing: every peer receives what any other peer sends.
pub struct BroadcastRelay {
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
    stats: RelayStats,
}

impl BroadcastRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
            stats: RelayStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Deliver `payload` to every member of the current registry snapshot
    /// except `sender`. Per-recipient failures are counted, never returned.
    #[tracing::instrument(
        name = "relay.broadcast",
        skip(self, payload),
        fields(kind = payload.kind(), bytes = payload.len())
    )]
    pub async fn broadcast(&self, sender: Uuid, payload: RelayMessage) -> DeliveryReport {
        let start = Instant::now();
        RelayMetrics::record_received(payload.kind());

        let snapshot = self.registry.snapshot().await;
        let mut report = DeliveryReport::default();
        let mut deliveries = FuturesUnordered::new();

        for handle in snapshot {
            if handle.id == sender {
                continue;
            }
            report.recipients += 1;

            if matches!(handle.state(), ConnectionState::Closing | ConnectionState::Closed) {
                report.skipped += 1;
                continue;
            }

            let message = payload.clone();
            let limit = self.send_timeout;
            deliveries.push(async move {
                let result = handle.deliver(message, limit).await;
                (handle, result)
            });

            while deliveries.len() >= MAX_CONCURRENT_DELIVERIES {
                match deliveries.next().await {
                    Some((recipient, result)) => Self::tally(&mut report, &recipient, result),
                    None => break,
                }
            }
        }

        while let Some((recipient, result)) = deliveries.next().await {
            Self::tally(&mut report, &recipient, result);
        }

        self.stats.record(&report);
        RelayMetrics::record_report(&report, start.elapsed());

        tracing::trace!(
            recipients = report.recipients,
            delivered = report.delivered,
            failed = report.failed,
            timed_out = report.timed_out,
            skipped = report.skipped,
            "Broadcast completed"
        );

        report
    }

    /// A recipient whose buffer stayed full is abandoned, so later
    /// broadcasts skip it instead of paying the timeout again.
    fn tally(report: &mut DeliveryReport, recipient: &ConnectionHandle, result: Result<(), DeliveryError>) {
        match result {
            Ok(()) => report.delivered += 1,
            Err(DeliveryError::Closed) => {
                report.failed += 1;
                tracing::debug!(recipient = %recipient.id, "Recipient channel closed, skipping");
            }
            Err(e @ DeliveryError::TimedOut { .. }) => {
                report.timed_out += 1;
                if recipient.abandon() {
                    tracing::warn!(
                        recipient = %recipient.id,
                        error = %e,
                        "Recipient is not draining its buffer, closing it"
                    );
                }
            }
        }
    }
}
