use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tokio::time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior};

use crate::connection_manager::{ConnectionError, ConnectionHandle};
use crate::error::{classify, FailureKind};
use crate::metrics::{ConnectionMetrics, KeepAliveMetrics};
use crate::relay::BroadcastRelay;
use crate::server::AppState;

use super::keepalive::{KeepAlive, PingTracker};
use super::message::RelayMessage;

/// Normal closure
const CLOSE_NORMAL: u16 = 1000;
/// Server-side failure, also used for keep-alive timeouts
const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Server is overloaded
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionExit {
    /// Peer sent a close frame
    PeerClosed,
    /// Inbound stream ended without a close frame
    StreamEnded,
    /// A keep-alive ping went unanswered
    PongTimeout,
    /// A socket write did not complete in time
    WriteStalled,
    /// The relay gave up on a peer that stopped draining its buffer
    Abandoned,
    /// Our side asked the writer to close
    CloseRequested,
    /// Socket error, classified
    Transport { kind: FailureKind, error: String },
    /// A connection task panicked
    Panicked,
    /// A connection task was aborted during teardown
    Aborted,
}

impl ConnectionExit {
    fn transport(error: &axum::Error) -> Self {
        Self::Transport {
            kind: classify(error),
            error: error.to_string(),
        }
    }

    fn from_join(result: Result<ConnectionExit, JoinError>) -> Self {
        match result {
            Ok(exit) => exit,
            Err(e) if e.is_panic() => Self::Panicked,
            Err(_) => Self::Aborted,
        }
    }

    /// Whether this is an expected way for a peer to go away
    pub fn is_expected(&self) -> bool {
        match self {
            Self::Transport { kind, .. } => *kind == FailureKind::TransportClosed,
            Self::Panicked => false,
            _ => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::StreamEnded => "stream_ended",
            Self::PongTimeout => "pong_timeout",
            Self::WriteStalled => "write_stalled",
            Self::Abandoned => "abandoned",
            Self::CloseRequested => "close_requested",
            Self::Transport { kind, .. } => kind.as_str(),
            Self::Panicked => "panicked",
            Self::Aborted => "aborted",
        }
    }
}

/// WebSocket upgrade handler
#[tracing::instrument(name = "ws.upgrade", skip(ws, state))]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let max_message_bytes = state.settings.websocket.max_message_bytes;

    ws.max_message_size(max_message_bytes)
        .max_frame_size(max_message_bytes)
        .on_failed_upgrade(move |e| {
            tracing::warn!(peer = %peer, error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| handle_socket(socket, state, peer))
}

/// Handle an established WebSocket connection
#[tracing::instrument(name = "ws.connection", skip(socket, state))]
async fn handle_socket(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let ws_config = &state.settings.websocket;
    let keepalive = KeepAlive::from(ws_config);

    // Create channel for sending messages to this connection
    let (tx, rx) = mpsc::channel::<RelayMessage>(ws_config.channel_buffer.max(1));
    let handle = Arc::new(ConnectionHandle::new(tx, Some(peer)));
    let connection_id = handle.id;

    if let Err(e) = state.registry.register(handle.clone()).await {
        ConnectionMetrics::record_rejected();
        tracing::warn!(error = %e, "Connection rejected");
        reject(socket, &e, keepalive.close_timeout).await;
        return;
    }
    handle.mark_open();

    tracing::info!(connection_id = %connection_id, "WebSocket connection established");

    let (ws_sender, ws_receiver) = socket.split();
    let tracker = Arc::new(PingTracker::new());
    let (close_tx, close_rx) = oneshot::channel::<CloseFrame>();

    let mut send_task = tokio::spawn(write_loop(
        ws_sender,
        rx,
        handle.clone(),
        tracker.clone(),
        keepalive,
        close_rx,
    ));
    let mut recv_task = tokio::spawn(read_loop(
        ws_receiver,
        state.relay.clone(),
        handle.clone(),
        tracker,
    ));

    // Whichever half stops first decides why the connection ended
    let exit = tokio::select! {
        result = &mut send_task => {
            let exit = ConnectionExit::from_join(result);
            close_connection(&state, &handle).await;

            // The writer already sent its close frame; give the peer a
            // bounded window to answer before dropping the socket.
            if timeout(keepalive.close_timeout, &mut recv_task).await.is_err() {
                recv_task.abort();
            }
            exit
        }
        result = &mut recv_task => {
            let exit = ConnectionExit::from_join(result);
            close_connection(&state, &handle).await;

            let _ = close_tx.send(CloseFrame {
                code: CLOSE_NORMAL,
                reason: "".into(),
            });
            if timeout(keepalive.close_timeout, &mut send_task).await.is_err() {
                send_task.abort();
            }
            exit
        }
    };

    log_exit(&handle, &exit);
}

/// `Open -> Closing -> Closed`; the registry removal happens exactly once.
async fn close_connection(state: &AppState, handle: &ConnectionHandle) {
    handle.begin_close();
    state.registry.deregister(handle.id).await;
}

fn log_exit(handle: &ConnectionHandle, exit: &ConnectionExit) {
    let connection_id = handle.id;
    let duration_secs = handle.age().as_secs_f64();
    let last_activity = handle.last_activity().to_rfc3339();

    match exit {
        ConnectionExit::Panicked => {
            tracing::error!(
                connection_id = %connection_id,
                duration_secs,
                "WebSocket connection task panicked"
            );
        }
        ConnectionExit::Transport { error, .. } if !exit.is_expected() => {
            tracing::warn!(
                connection_id = %connection_id,
                peer = ?handle.peer_addr,
                error = %error,
                duration_secs,
                last_activity = %last_activity,
                "WebSocket connection failed"
            );
        }
        ConnectionExit::Transport { error, .. } => {
            tracing::debug!(
                connection_id = %connection_id,
                error = %error,
                duration_secs,
                "WebSocket transport closed"
            );
        }
        ConnectionExit::PongTimeout => {
            tracing::info!(
                connection_id = %connection_id,
                peer = ?handle.peer_addr,
                duration_secs,
                last_activity = %last_activity,
                "WebSocket connection closed after keep-alive timeout"
            );
        }
        _ => {
            tracing::info!(
                connection_id = %connection_id,
                peer = ?handle.peer_addr,
                reason = exit.as_str(),
                duration_secs,
                last_activity = %last_activity,
                "WebSocket connection closed"
            );
        }
    }
}

/// Refuse a connection that could not be registered
async fn reject(mut socket: WebSocket, err: &ConnectionError, limit: Duration) {
    let reason = match err {
        ConnectionError::LimitExceeded { .. } => "connection limit reached",
        ConnectionError::Duplicate(_) => "duplicate connection",
    };
    let frame = CloseFrame {
        code: CLOSE_TRY_AGAIN_LATER,
        reason: reason.into(),
    };

    if timeout(limit, socket.send(Message::Close(Some(frame))))
        .await
        .is_ok()
    {
        // Wait briefly for the peer's close reply
        let _ = timeout(limit, socket.recv()).await;
    }
}

/// Forward queued relay messages to the socket and drive keep-alive pings
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<RelayMessage>,
    handle: Arc<ConnectionHandle>,
    tracker: Arc<PingTracker>,
    keepalive: KeepAlive,
    mut close_rx: oneshot::Receiver<CloseFrame>,
) -> ConnectionExit {
    let mut ping_timer = keepalive.ping_interval.map(|period| {
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    });
    // A single socket write may not take longer than a ping round trip
    let write_limit = keepalive.pong_timeout.max(Duration::from_secs(1));

    loop {
        let pong_deadline = tracker.deadline(keepalive.pong_timeout);

        tokio::select! {
            frame = &mut close_rx => {
                let frame = frame.ok();
                let _ = timeout(keepalive.close_timeout, sink.send(Message::Close(frame))).await;
                return ConnectionExit::CloseRequested;
            }
            _ = handle.abandoned() => {
                let frame = CloseFrame {
                    code: CLOSE_INTERNAL_ERROR,
                    reason: "send buffer full".into(),
                };
                let _ = timeout(keepalive.close_timeout, sink.send(Message::Close(Some(frame)))).await;
                return ConnectionExit::Abandoned;
            }
            message = rx.recv() => {
                let Some(message) = message else {
                    let _ = timeout(keepalive.close_timeout, sink.send(Message::Close(None))).await;
                    return ConnectionExit::CloseRequested;
                };
                if let Err(exit) = write_frame(&mut sink, message.into(), write_limit).await {
                    return exit;
                }
            }
            _ = next_tick(&mut ping_timer) => {
                tracker.ping_sent();
                if let Err(exit) = write_frame(&mut sink, Message::Ping(Default::default()), write_limit).await {
                    return exit;
                }
            }
            _ = wait_until(pong_deadline) => {
                // A pong may have arrived while we slept
                if tracker.is_overdue(keepalive.pong_timeout) {
                    KeepAliveMetrics::record_timeout();
                    let frame = CloseFrame {
                        code: CLOSE_INTERNAL_ERROR,
                        reason: "keepalive ping timeout".into(),
                    };
                    let _ = timeout(keepalive.close_timeout, sink.send(Message::Close(Some(frame)))).await;
                    return ConnectionExit::PongTimeout;
                }
            }
        }
    }
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    limit: Duration,
) -> Result<(), ConnectionExit> {
    match timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionExit::transport(&e)),
        Err(_) => Err(ConnectionExit::WriteStalled),
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Read frames from the peer and hand data frames to the relay
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    relay: Arc<BroadcastRelay>,
    handle: Arc<ConnectionHandle>,
    tracker: Arc<PingTracker>,
) -> ConnectionExit {
    while let Some(result) = stream.next().await {
        let message = match result {
            Ok(message) => message,
            Err(e) => return ConnectionExit::transport(&e),
        };

        match message {
            Message::Pong(_) => {
                tracker.pong_received();
                handle.update_activity();
            }
            Message::Ping(_) => {
                // Pong replies are queued by the WebSocket layer
                handle.update_activity();
            }
            Message::Close(frame) => {
                tracing::debug!(
                    connection_id = %handle.id,
                    code = ?frame.as_ref().map(|f| f.code),
                    "Received close frame"
                );
                return ConnectionExit::PeerClosed;
            }
            data => {
                if let Some(payload) = RelayMessage::from_ws(data) {
                    handle.update_activity();
                    relay.broadcast(handle.id, payload).await;
                }
            }
        }
    }

    ConnectionExit::StreamEnded
}
