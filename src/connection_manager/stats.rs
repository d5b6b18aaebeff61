//! Registry statistics

use serde::Serialize;

/// Registry statistics
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub open_connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}
