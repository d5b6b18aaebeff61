//! Connection handle and related types

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::websocket::RelayMessage;

/// Lifecycle of a single connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Handle for a single WebSocket connection
pub struct ConnectionHandle {
    pub id: Uuid,
    pub peer_addr: Option<SocketAddr>,
    pub sender: mpsc::Sender<RelayMessage>,
    opened_at: Instant,
    /// Unix seconds of the last frame read from the peer
    last_activity: AtomicI64,
    state: AtomicU8,
    /// Wakes the connection's writer when the relay gives up on this peer
    abandoned: Notify,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<RelayMessage>, peer_addr: Option<SocketAddr>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            sender,
            opened_at: Instant::now(),
            last_activity: AtomicI64::new(now.timestamp()),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            abandoned: Notify::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// `Connecting -> Open`. Returns false from any other state.
    pub fn mark_open(&self) -> bool {
        self.transition(ConnectionState::Connecting, ConnectionState::Open)
    }

    /// `Connecting | Open -> Closing`. Only the first caller gets `true`.
    pub fn begin_close(&self) -> bool {
        self.transition(ConnectionState::Open, ConnectionState::Closing)
            || self.transition(ConnectionState::Connecting, ConnectionState::Closing)
    }

    /// `Closing -> Closed`, performed once the registry has dropped the
    /// connection. A connection still `Connecting` or `Open` passes through
    /// `Closing` first.
    pub(crate) fn mark_closed(&self) {
        self.begin_close();
        self.transition(ConnectionState::Closing, ConnectionState::Closed);
    }

    /// Give up on this peer: later broadcasts skip it and its writer is told
    /// to close the socket. Returns `false` if it was already closing.
    pub fn abandon(&self) -> bool {
        if !self.begin_close() {
            return false;
        }
        // notify_one keeps a permit if the writer is not waiting yet
        self.abandoned.notify_one();
        true
    }

    /// Resolves once `abandon` has been called
    pub async fn abandoned(&self) {
        self.abandoned.notified().await;
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    /// Time since the handshake completed
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Queue a message for this connection's writer, waiting at most `limit`
    /// for buffer space.
    pub async fn deliver(&self, message: RelayMessage, limit: Duration) -> Result<(), DeliveryError> {
        match timeout(limit, self.sender.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::TimedOut {
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }
}

/// Error returned when a connection cannot be registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    LimitExceeded { current: usize, max: usize },
    Duplicate(Uuid),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LimitExceeded { current, max } => {
                write!(f, "Connection limit exceeded ({}/{})", current, max)
            }
            Self::Duplicate(id) => write!(f, "Connection {} is already registered", id),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Limits for connection management
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionLimits {
    /// 0 disables the limit
    pub max_connections: usize,
}

impl ConnectionLimits {
    pub fn unlimited() -> Self {
        Self { max_connections: 0 }
    }

    pub fn is_limited(&self) -> bool {
        self.max_connections > 0
    }
}
