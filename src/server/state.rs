use std::sync::Arc;

use crate::config::Settings;
use crate::connection_manager::{ConnectionLimits, ConnectionRegistry};
use crate::relay::BroadcastRelay;

/// Shared state of the relay plane. The registry is the only mutable part.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<ConnectionRegistry>,
    pub relay: Arc<BroadcastRelay>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let limits = ConnectionLimits {
            max_connections: settings.websocket.max_connections,
        };
        let registry = Arc::new(ConnectionRegistry::with_limits(limits));
        let relay = Arc::new(BroadcastRelay::new(
            registry.clone(),
            settings.websocket.send_timeout(),
        ));

        Self {
            settings: Arc::new(settings),
            registry,
            relay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_shares_registry() {
        let mut settings = Settings::default();
        settings.websocket.max_connections = 3;
        let state = AppState::new(settings);

        assert!(Arc::ptr_eq(&state.registry, state.relay.registry()));
        assert_eq!(state.registry.limits().max_connections, 3);
    }
}
