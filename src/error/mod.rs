use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Process-level failures. Any of these aborts the process.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Failed to bind {plane} listener on {addr}: {source}")]
    Bind {
        plane: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("{plane} listener stopped: {reason}")]
    PlaneExited { plane: &'static str, reason: String },

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A single failed delivery during fan-out. Never propagated to the sender.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("recipient outbound channel is closed")]
    Closed,

    #[error("recipient did not accept the message within {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },
}

/// Two-way classification of per-connection transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Peer went away: disconnect, reset, broken pipe, already closed
    TransportClosed,
    /// Anything else; logged and ends only the affected connection
    Unexpected,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportClosed => "transport_closed",
            Self::Unexpected => "unexpected",
        }
    }
}

/// Messages the WebSocket layer uses for peers that are gone
const CLOSED_MARKERS: &[&str] = &[
    "connection closed normally",
    "trying to work with closed connection",
    "connection reset",
    "broken pipe",
    "sending after closing is not allowed",
];

/// Classify an error by walking its source chain.
pub fn classify(err: &(dyn StdError + 'static)) -> FailureKind {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);

    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if is_closed_io_kind(io_err.kind()) {
                return FailureKind::TransportClosed;
            }
        }

        let text = e.to_string().to_ascii_lowercase();
        if CLOSED_MARKERS.iter().any(|m| text.contains(m)) {
            return FailureKind::TransportClosed;
        }

        current = e.source();
    }

    FailureKind::Unexpected
}

fn is_closed_io_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}
