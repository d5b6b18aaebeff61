use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::metrics::ConnectionMetrics;

use super::stats::RegistryStats;
use super::types::{ConnectionError, ConnectionHandle, ConnectionLimits, ConnectionState};

/// Manages all live WebSocket connections.
///
/// Register and deregister take the write lock. Readers clone the member
/// list under the read lock and release it before doing any I/O, so a
/// broadcast always iterates a point-in-time copy.
pub struct ConnectionRegistry {
    /// connection_id -> ConnectionHandle
    connections: RwLock<HashMap<Uuid, Arc<ConnectionHandle>>>,
    limits: ConnectionLimits,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_limits(ConnectionLimits::unlimited())
    }

    pub fn with_limits(limits: ConnectionLimits) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            limits,
        }
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    /// Add a connection, enforcing the connection limit if one is configured
    pub async fn register(&self, handle: Arc<ConnectionHandle>) -> Result<(), ConnectionError> {
        let mut connections = self.connections.write().await;

        if self.limits.is_limited() && connections.len() >= self.limits.max_connections {
            return Err(ConnectionError::LimitExceeded {
                current: connections.len(),
                max: self.limits.max_connections,
            });
        }

        if connections.contains_key(&handle.id) {
            return Err(ConnectionError::Duplicate(handle.id));
        }

        let connection_id = handle.id;
        connections.insert(connection_id, handle);
        let total = connections.len();
        drop(connections);

        ConnectionMetrics::record_opened();
        tracing::debug!(connection_id = %connection_id, total_connections = total, "Connection registered");

        Ok(())
    }

    /// Remove a connection. Returns `true` only for the call that actually
    /// removed it; later calls are no-ops.
    pub async fn deregister(&self, connection_id: Uuid) -> bool {
        let removed = self.connections.write().await.remove(&connection_id);

        match removed {
            Some(handle) => {
                handle.mark_closed();
                ConnectionMetrics::record_closed(handle.age());
                tracing::debug!(connection_id = %connection_id, "Connection deregistered");
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of the current membership
    pub async fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn get(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn stats(&self) -> RegistryStats {
        let connections = self.connections.read().await;
        let open = connections
            .values()
            .filter(|h| h.state() == ConnectionState::Open)
            .count();

        RegistryStats {
            total_connections: connections.len(),
            open_connections: open,
            max_connections: self
                .limits
                .is_limited()
                .then_some(self.limits.max_connections),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
