//! Message fan-out between connected peers.

mod broadcast;

pub use broadcast::{BroadcastRelay, DeliveryReport, RelayStats, RelayStatsSnapshot};
