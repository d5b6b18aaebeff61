//! Process supervision.
//!
//! The health plane and the relay plane run as two independent units:
//!
//! 1. The relay listener is bound (nothing is accepted yet)
//! 2. The health plane is bound and served from its own OS thread and runtime
//! 3. The relay accept loop starts on the main runtime
//!
//! Either bind failing aborts startup. Once running, if either unit stops
//! the supervisor reports it and the process exits (fail-fast); neither unit
//! is restarted in-process. Termination signals stop the process without
//! draining in-flight broadcasts.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::thread;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::api::{health_routes, HealthState};
use crate::config::Settings;
use crate::error::RelayError;
use crate::server::{create_app, AppState};

/// The health listener, running on a dedicated thread with a
/// current-thread runtime so relay load cannot delay probes.
pub struct HealthPlane {
    local_addr: SocketAddr,
    exited: oneshot::Receiver<Result<(), String>>,
    // Dropping the sender stops the server
    _shutdown: oneshot::Sender<()>,
}

impl HealthPlane {
    /// Bind `addr` and serve the router returned by `build` (which receives
    /// the bound address). Resolves once the listener is bound.
    pub async fn start<F>(addr: String, build: F) -> Result<Self, RelayError>
    where
        F: FnOnce(SocketAddr) -> Router + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<SocketAddr, RelayError>>();
        let (exit_tx, exit_rx) = oneshot::channel::<Result<(), String>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        thread::Builder::new()
            .name("health-probe".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(RelayError::Io(e)));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let listener = match TcpListener::bind(&addr).await {
                        Ok(listener) => listener,
                        Err(source) => {
                            let _ = ready_tx.send(Err(RelayError::Bind {
                                plane: "health",
                                addr,
                                source,
                            }));
                            return;
                        }
                    };
                    let local_addr = match listener.local_addr() {
                        Ok(local_addr) => local_addr,
                        Err(e) => {
                            let _ = ready_tx.send(Err(RelayError::Io(e)));
                            return;
                        }
                    };

                    let app = build(local_addr);
                    let _ = ready_tx.send(Ok(local_addr));

                    let result = axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            let _ = shutdown_rx.await;
                        })
                        .await
                        .map_err(|e| e.to_string());
                    let _ = exit_tx.send(result);
                });
            })?;

        let local_addr = ready_rx.await.map_err(|_| RelayError::PlaneExited {
            plane: "health",
            reason: "thread terminated during startup".to_string(),
        })??;

        Ok(Self {
            local_addr,
            exited: exit_rx,
            _shutdown: shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves when the health server stops, with the reason
    pub async fn stopped(&mut self) -> String {
        match (&mut self.exited).await {
            Ok(Ok(())) => "server stopped".to_string(),
            Ok(Err(e)) => e,
            Err(_) => "thread terminated".to_string(),
        }
    }
}

/// Starts both planes
pub struct Supervisor {
    settings: Settings,
}

impl Supervisor {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub async fn start(self) -> Result<RunningRelay, RelayError> {
        let relay_addr = self.settings.relay_addr();
        let listener = TcpListener::bind(&relay_addr)
            .await
            .map_err(|source| RelayError::Bind {
                plane: "relay",
                addr: relay_addr.clone(),
                source,
            })?;
        let relay_local = listener.local_addr()?;

        // Health first, so probes are answerable before peers are accepted
        let advertise_host = self.settings.advertise_host().to_string();
        let expose_metrics = self.settings.health.expose_metrics;
        let relay_port = relay_local.port();
        let health = HealthPlane::start(self.settings.health_addr(), move |health_addr| {
            let state = HealthState::new(&advertise_host, relay_port, health_addr.port());
            health_routes(state, expose_metrics)
        })
        .await?;
        tracing::info!(
            "Health endpoint listening on http://{}/health",
            health.local_addr()
        );

        let state = AppState::new(self.settings);
        let app = create_app(state.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let relay_task = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        });
        tracing::info!("WebSocket relay listening on ws://{}", relay_local);

        Ok(RunningRelay {
            relay_addr: relay_local,
            state,
            health,
            relay_task,
            _shutdown: shutdown_tx,
        })
    }
}

/// Handle on a started relay. Dropping it stops both listeners.
pub struct RunningRelay {
    relay_addr: SocketAddr,
    state: AppState,
    health: HealthPlane,
    relay_task: JoinHandle<io::Result<()>>,
    _shutdown: oneshot::Sender<()>,
}

impl RunningRelay {
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    pub fn health_addr(&self) -> SocketAddr {
        self.health.local_addr()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run until SIGINT/SIGTERM or until either plane stops
    pub async fn run_until_signal(self) -> Result<(), RelayError> {
        self.run_until(shutdown_signal()).await
    }

    pub async fn run_until<S>(mut self, signal: S) -> Result<(), RelayError>
    where
        S: Future<Output = ()>,
    {
        let result = tokio::select! {
            _ = signal => Ok(()),
            joined = &mut self.relay_task => {
                let reason = match joined {
                    Ok(Ok(())) => "accept loop stopped".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                };
                tracing::error!(reason = %reason, "Relay listener stopped unexpectedly");
                Err(RelayError::PlaneExited { plane: "relay", reason })
            }
            reason = self.health.stopped() => {
                tracing::error!(reason = %reason, "Health listener stopped unexpectedly");
                Err(RelayError::PlaneExited { plane: "health", reason })
            }
        };

        let registry = self.state.registry.stats().await;
        let relay = self.state.relay.stats();
        tracing::info!(
            open_connections = registry.total_connections,
            messages_relayed = relay.messages_relayed,
            deliveries = relay.total_delivered,
            "Relay stopped without draining connections"
        );

        result
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, stopping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_settings() -> Settings {
        let mut settings = Settings::default();
        settings.relay.host = "127.0.0.1".to_string();
        settings.relay.port = 0;
        settings.health.host = "127.0.0.1".to_string();
        settings.health.port = 0;
        settings
    }

    #[tokio::test]
    async fn test_health_bind_failure_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut settings = local_settings();
        settings.health.port = taken.local_addr().unwrap().port();

        let err = Supervisor::new(settings).start().await.err().unwrap();
        assert!(matches!(err, RelayError::Bind { plane: "health", .. }));
    }

    #[tokio::test]
    async fn test_relay_bind_failure_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut settings = local_settings();
        settings.relay.port = taken.local_addr().unwrap().port();

        let err = Supervisor::new(settings).start().await.err().unwrap();
        assert!(matches!(err, RelayError::Bind { plane: "relay", .. }));
    }

    #[tokio::test]
    async fn test_run_until_signal_returns_ok() {
        let running = Supervisor::new(local_settings()).start().await.unwrap();
        assert_ne!(running.relay_addr().port(), 0);
        assert_ne!(running.health_addr().port(), 0);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            running.run_until(tokio::time::sleep(Duration::from_millis(20))),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_health_plane_stop_is_reported() {
        let mut plane = HealthPlane::start("127.0.0.1:0".to_string(), |_| Router::new())
            .await
            .unwrap();

        // Replacing the shutdown sender drops the first one, which stops the server
        let (replacement, _rx) = oneshot::channel();
        plane._shutdown = replacement;

        let reason = tokio::time::timeout(Duration::from_secs(2), plane.stopped())
            .await
            .unwrap();
        assert_eq!(reason, "server stopped");
    }
}
