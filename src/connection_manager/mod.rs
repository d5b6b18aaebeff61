//! Connection tracking for the relay plane.

mod registry;
mod stats;
mod types;

pub use registry::ConnectionRegistry;
pub use stats::RegistryStats;
pub use types::{ConnectionError, ConnectionHandle, ConnectionLimits, ConnectionState};
