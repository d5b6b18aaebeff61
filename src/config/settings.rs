use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Message-plane listener
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_relay_port")]
    pub port: u16,
    /// Host written into the advertised `ws`/`http` URLs (defaults to `host`)
    #[serde(default)]
    pub advertise_host: Option<String>,
}

/// Health-plane listener
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_health_port")]
    pub port: u16,
    /// Serve Prometheus metrics at `/metrics` next to `/health`
    #[serde(default)]
    pub expose_metrics: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Interval between keep-alive pings in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Close the connection if a ping is not answered within this many seconds
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
    /// Upper bound on the closing handshake in seconds
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,
    /// Upper bound on a single delivery into a peer's outbound buffer
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Per-connection outbound buffer size
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
    /// Maximum concurrent connections (0 = unlimited)
    #[serde(default)]
    pub max_connections: usize,
    /// Maximum inbound message size in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_relay_port() -> u16 {
    8765
}

fn default_health_port() -> u16 {
    8766
}

fn default_ping_interval() -> u64 {
    20
}

fn default_pong_timeout() -> u64 {
    20
}

fn default_close_timeout() -> u64 {
    2
}

fn default_send_timeout_ms() -> u64 {
    1000
}

fn default_channel_buffer() -> usize {
    32
}

fn default_max_message_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("relay.host", "0.0.0.0")?
            .set_default("relay.port", 8765)?
            .set_default("health.host", "0.0.0.0")?
            .set_default("health.port", 8766)?
            .set_default("websocket.ping_interval_secs", 20)?
            .set_default("websocket.pong_timeout_secs", 20)?
            .set_default("websocket.close_timeout_secs", 2)?
            .set_default("logging.level", "info")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // RELAY__RELAY__PORT, RELAY__WEBSOCKET__PING_INTERVAL_SECS, ...
            .add_source(
                Environment::with_prefix("RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay.host, self.relay.port)
    }

    pub fn health_addr(&self) -> String {
        format!("{}:{}", self.health.host, self.health.port)
    }

    /// Host used in advertised endpoint URLs
    pub fn advertise_host(&self) -> &str {
        self.relay
            .advertise_host
            .as_deref()
            .unwrap_or(&self.relay.host)
    }
}

impl WebSocketConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_relay_port(),
            advertise_host: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_health_port(),
            expose_metrics: false,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            close_timeout_secs: default_close_timeout(),
            send_timeout_ms: default_send_timeout_ms(),
            channel_buffer: default_channel_buffer(),
            max_connections: 0,
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
