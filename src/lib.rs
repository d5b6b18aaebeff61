// Shared components
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Message plane
pub mod connection_manager;
pub mod relay;
pub mod server;
pub mod websocket;

// Health plane
pub mod api;

// Process wiring
pub mod supervisor;
