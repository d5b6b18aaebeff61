mod settings;

pub use settings::{
    HealthConfig, LogFormat, LoggingConfig, RelayConfig, Settings, WebSocketConfig,
};
