//! Health-plane HTTP API.

mod health;
mod routes;

pub use health::{HealthState, HealthStatus, NotFoundResponse, SERVICE_NAME};
pub use routes::health_routes;
