//! Keep-alive ping/pong bookkeeping for a single connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::WebSocketConfig;

/// Keep-alive timings for one connection
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    /// `None` disables pings entirely
    pub ping_interval: Option<Duration>,
    pub pong_timeout: Duration,
    pub close_timeout: Duration,
}

impl From<&WebSocketConfig> for KeepAlive {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            ping_interval: (config.ping_interval_secs > 0).then(|| config.ping_interval()),
            pong_timeout: config.pong_timeout(),
            close_timeout: config.close_timeout(),
        }
    }
}

const NO_PING_OUTSTANDING: u64 = u64::MAX;

/// Tracks the oldest unanswered ping. Shared between the reader (which sees
/// pongs) and the writer (which sends pings and enforces the deadline).
#[derive(Debug)]
pub struct PingTracker {
    origin: Instant,
    /// Milliseconds since `origin` at which the oldest unanswered ping was sent
    outstanding_since_ms: AtomicU64,
}

impl PingTracker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            outstanding_since_ms: AtomicU64::new(NO_PING_OUTSTANDING),
        }
    }

    /// Record a ping. An older unanswered ping keeps its deadline.
    pub fn ping_sent(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        let _ = self.outstanding_since_ms.compare_exchange(
            NO_PING_OUTSTANDING,
            now,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn pong_received(&self) {
        self.outstanding_since_ms
            .store(NO_PING_OUTSTANDING, Ordering::Release);
    }

    pub fn is_awaiting_pong(&self) -> bool {
        self.outstanding_since_ms.load(Ordering::Acquire) != NO_PING_OUTSTANDING
    }

    /// When the outstanding ping expires, if there is one
    pub fn deadline(&self, pong_timeout: Duration) -> Option<Instant> {
        match self.outstanding_since_ms.load(Ordering::Acquire) {
            NO_PING_OUTSTANDING => None,
            sent_ms => Some(self.origin + Duration::from_millis(sent_ms) + pong_timeout),
        }
    }

    pub fn is_overdue(&self, pong_timeout: Duration) -> bool {
        self.deadline(pong_timeout)
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new()
    }
}
