//! End-to-end tests for the message plane
//!
//! Each test starts a full relay on ephemeral loopback ports and talks to it
//! with real WebSocket clients.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use webrtc_signaling_relay::config::Settings;
use webrtc_signaling_relay::supervisor::{RunningRelay, Supervisor};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a relay on loopback with ephemeral ports
async fn start_relay(configure: impl FnOnce(&mut Settings)) -> RunningRelay {
    let mut settings = Settings::default();
    settings.relay.host = "127.0.0.1".to_string();
    settings.relay.port = 0;
    settings.health.host = "127.0.0.1".to_string();
    settings.health.port = 0;
    configure(&mut settings);

    Supervisor::new(settings).start().await.unwrap()
}

async fn connect(relay: &RunningRelay) -> Client {
    let url = format!("ws://{}/", relay.relay_addr());
    let (client, _) = connect_async(url).await.unwrap();
    client
}

/// Upgrades complete before registration, so wait for the registry to settle
async fn wait_for_connections(relay: &RunningRelay, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let current = relay.state().registry.len().await;
        if current == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "expected {} connections, registry has {}",
            expected,
            current
        );
        sleep(Duration::from_millis(10)).await;
    }
}

/// Next data or close frame, skipping keep-alive traffic
async fn next_message(client: &mut Client) -> Option<Message> {
    loop {
        match client.next().await {
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(message)) => return Some(message),
            _ => return None,
        }
    }
}

async fn expect_text(client: &mut Client, expected: &str) {
    let message = timeout(Duration::from_secs(2), next_message(client))
        .await
        .expect("timed out waiting for relayed message")
        .expect("connection ended before message arrived");
    assert_eq!(message.to_text().unwrap(), expected);
}

async fn expect_silence(client: &mut Client) {
    let result = timeout(Duration::from_millis(200), next_message(client)).await;
    assert!(result.is_err(), "unexpected message: {:?}", result);
}

mod fan_out_tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_exchange_excludes_sender() {
        let relay = start_relay(|_| {}).await;
        let mut a = connect(&relay).await;
        let mut b = connect(&relay).await;
        wait_for_connections(&relay, 2).await;

        a.send(Message::text(r#"{"type":"offer","sdp":"v=0"}"#))
            .await
            .unwrap();
        expect_text(&mut b, r#"{"type":"offer","sdp":"v=0"}"#).await;

        b.send(Message::text(r#"{"type":"answer","sdp":"v=0"}"#))
            .await
            .unwrap();
        expect_text(&mut a, r#"{"type":"answer","sdp":"v=0"}"#).await;

        expect_silence(&mut a).await;
        expect_silence(&mut b).await;
    }

    #[tokio::test]
    async fn test_every_other_peer_receives() {
        let relay = start_relay(|_| {}).await;
        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(connect(&relay).await);
        }
        wait_for_connections(&relay, 5).await;

        clients[0].send(Message::text("candidate")).await.unwrap();

        for client in clients.iter_mut().skip(1) {
            expect_text(client, "candidate").await;
        }
        expect_silence(&mut clients[0]).await;

        let stats = relay.state().relay.stats();
        assert_eq!(stats.messages_relayed, 1);
        assert_eq!(stats.total_delivered, 4);
    }

    #[tokio::test]
    async fn test_binary_payload_is_forwarded_verbatim() {
        let relay = start_relay(|_| {}).await;
        let mut a = connect(&relay).await;
        let mut b = connect(&relay).await;
        wait_for_connections(&relay, 2).await;

        let payload = vec![0u8, 159, 146, 150, 255];
        a.send(Message::binary(payload.clone())).await.unwrap();

        let message = timeout(Duration::from_secs(2), next_message(&mut b))
            .await
            .unwrap()
            .unwrap();
        assert!(message.is_binary());
        assert_eq!(message.into_data().to_vec(), payload);
    }

    #[tokio::test]
    async fn test_message_order_is_preserved_per_sender() {
        let relay = start_relay(|_| {}).await;
        let mut a = connect(&relay).await;
        let mut b = connect(&relay).await;
        wait_for_connections(&relay, 2).await;

        for i in 0..20 {
            a.send(Message::text(format!("msg-{}", i))).await.unwrap();
        }
        for i in 0..20 {
            expect_text(&mut b, &format!("msg-{}", i)).await;
        }
    }

    #[tokio::test]
    async fn test_lone_peer_sends_into_nothing() {
        let relay = start_relay(|_| {}).await;
        let mut a = connect(&relay).await;
        wait_for_connections(&relay, 1).await;

        a.send(Message::text("anyone?")).await.unwrap();
        expect_silence(&mut a).await;
        assert_eq!(relay.state().registry.len().await, 1);
    }
}

mod disconnect_tests {
    use super::*;

    /// Drop a client so the kernel sends RST instead of FIN
    #[allow(deprecated)]
    fn reset(client: Client) {
        if let MaybeTlsStream::Plain(stream) = client.get_ref() {
            let _ = stream.set_linger(Some(Duration::ZERO));
        }
        drop(client);
    }

    #[tokio::test]
    async fn test_reset_peer_is_removed_and_others_unaffected() {
        let relay = start_relay(|_| {}).await;
        let mut a = connect(&relay).await;
        let mut b = connect(&relay).await;
        let c = connect(&relay).await;
        wait_for_connections(&relay, 3).await;

        reset(c);
        wait_for_connections(&relay, 2).await;

        a.send(Message::text("still here")).await.unwrap();
        expect_text(&mut b, "still here").await;
        expect_silence(&mut a).await;
    }

    #[tokio::test]
    async fn test_clean_close_is_removed() {
        let relay = start_relay(|_| {}).await;
        let mut a = connect(&relay).await;
        let mut b = connect(&relay).await;
        wait_for_connections(&relay, 2).await;

        b.close(None).await.unwrap();
        wait_for_connections(&relay, 1).await;

        a.send(Message::text("hello?")).await.unwrap();
        expect_silence(&mut a).await;
    }

    #[tokio::test]
    async fn test_reconnect_gets_fresh_identity() {
        let relay = start_relay(|_| {}).await;
        let mut a = connect(&relay).await;
        let b = connect(&relay).await;
        wait_for_connections(&relay, 2).await;

        drop(b);
        wait_for_connections(&relay, 1).await;

        let mut b = connect(&relay).await;
        wait_for_connections(&relay, 2).await;

        a.send(Message::text("welcome back")).await.unwrap();
        expect_text(&mut b, "welcome back").await;
    }
}

mod limit_tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_over_limit_is_closed_with_1013() {
        let relay = start_relay(|s| s.websocket.max_connections = 2).await;
        let _a = connect(&relay).await;
        let _b = connect(&relay).await;
        wait_for_connections(&relay, 2).await;

        let mut c = connect(&relay).await;
        let message = timeout(Duration::from_secs(2), next_message(&mut c))
            .await
            .unwrap();

        match message {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(u16::from(frame.code), 1013);
                assert_eq!(frame.reason.as_str(), "connection limit reached");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
        assert_eq!(relay.state().registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_only_that_connection() {
        let relay = start_relay(|s| s.websocket.max_message_bytes = 1024).await;
        let mut a = connect(&relay).await;
        let mut b = connect(&relay).await;
        let mut c = connect(&relay).await;
        wait_for_connections(&relay, 3).await;

        b.send(Message::text("x".repeat(4096))).await.unwrap();
        wait_for_connections(&relay, 2).await;

        match timeout(Duration::from_secs(2), next_message(&mut b)).await.unwrap() {
            Some(Message::Close(_)) | None => {}
            other => panic!("expected B to be closed, got {:?}", other),
        }

        // Nobody received the oversized payload; A and C still talk
        a.send(Message::text("after")).await.unwrap();
        expect_text(&mut c, "after").await;
        c.send(Message::text("back")).await.unwrap();
        expect_text(&mut a, "back").await;
    }
}

mod keepalive_tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const OPCODE_CLOSE: u8 = 0x8;

    /// Upgrade a plain TCP stream by hand so nothing answers pings or close frames
    async fn raw_upgrade(relay: &RunningRelay) -> TcpStream {
        let mut stream = TcpStream::connect(relay.relay_addr()).await.unwrap();
        let request = format!(
            "GET / HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
            relay.relay_addr()
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        assert!(head.starts_with(b"HTTP/1.1 101"));
        stream
    }

    /// Opcode of the next server frame, or `None` once the socket is gone
    async fn read_frame(stream: &mut TcpStream) -> Option<u8> {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.ok()?;

        let mut len = (header[1] & 0x7f) as usize;
        if len == 126 {
            let mut extended = [0u8; 2];
            stream.read_exact(&mut extended).await.ok()?;
            len = u16::from_be_bytes(extended) as usize;
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.ok()?;

        Some(header[0] & 0x0f)
    }

    #[tokio::test]
    async fn test_unanswered_close_is_dropped_after_close_timeout() {
        let relay = start_relay(|s| {
            s.websocket.ping_interval_secs = 1;
            s.websocket.pong_timeout_secs = 1;
            s.websocket.close_timeout_secs = 1;
        })
        .await;

        let mut stream = raw_upgrade(&relay).await;
        wait_for_connections(&relay, 1).await;

        // Pings go unanswered until the server gives up and sends a close frame
        let close_seen = timeout(Duration::from_secs(5), async {
            loop {
                match read_frame(&mut stream).await {
                    Some(OPCODE_CLOSE) => return Instant::now(),
                    Some(_) => continue,
                    None => panic!("socket dropped before the close frame"),
                }
            }
        })
        .await
        .expect("no close frame after the pong timeout");
        wait_for_connections(&relay, 0).await;

        // We never answer it; the server must drop the socket on its own
        let dropped = timeout(Duration::from_secs(3), async {
            while read_frame(&mut stream).await.is_some() {}
            Instant::now()
        })
        .await
        .expect("server kept the half-closed socket");

        let held = dropped - close_seen;
        assert!(held >= Duration::from_millis(700), "dropped after {:?}", held);
        assert!(held < Duration::from_millis(2500), "dropped after {:?}", held);
    }

    #[tokio::test]
    async fn test_silent_peer_is_dropped_after_pong_timeout() {
        let relay = start_relay(|s| {
            s.websocket.ping_interval_secs = 1;
            s.websocket.pong_timeout_secs = 1;
        })
        .await;

        // Never polled, so never answers pings
        let _silent = connect(&relay).await;

        // Polled continuously, so pongs go out
        let mut responsive = connect(&relay).await;
        let reader = tokio::spawn(async move {
            while let Some(Ok(_)) = responsive.next().await {}
        });

        wait_for_connections(&relay, 2).await;

        let deadline = Instant::now() + Duration::from_secs(6);
        while relay.state().registry.len().await > 1 {
            assert!(Instant::now() < deadline, "silent peer was never dropped");
            sleep(Duration::from_millis(50)).await;
        }

        // Survives at least one more ping round trip
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(relay.state().registry.len().await, 1);
        reader.abort();
    }
}
