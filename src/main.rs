use anyhow::Result;

use webrtc_signaling_relay::config::Settings;
use webrtc_signaling_relay::supervisor::Supervisor;
use webrtc_signaling_relay::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;
    init_tracing(&settings.logging)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        max_connections = settings.websocket.max_connections,
        ping_interval_secs = settings.websocket.ping_interval_secs,
        "Configuration loaded"
    );

    // Bind both planes, then serve until a signal or a plane failure
    let running = Supervisor::new(settings).start().await?;
    running.run_until_signal().await?;

    tracing::info!("Relay shutdown complete");
    Ok(())
}
