//! Integration tests for the push connection, run against a real
//! in-process WebSocket listener: idempotent connect, reconnection with a
//! fresh handshake, the offline emit policy, and the heartbeat toggle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt as _;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use tidemark::transport::{LinkState, TransportClient, TransportConfig};
use tidemark::wire::ClientFrame;

fn fast_config(port: u16) -> TransportConfig {
    let mut config = TransportConfig::new(format!("ws://127.0.0.1:{port}"));
    config.backoff_floor = Duration::from_millis(50);
    config.backoff_cap = Duration::from_millis(200);
    config
}

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn event_name(frame: &str) -> String {
    serde_json::from_str::<serde_json::Value>(frame).unwrap()["event"]
        .as_str()
        .unwrap()
        .to_string()
}

/// Accept connections forever, forwarding every text frame (tagged with a
/// 1-based session number) and counting accepted sockets.
fn spawn_recording_server(
    listener: TcpListener,
    frame_tx: mpsc::UnboundedSender<(usize, String)>,
    accepted: Arc<AtomicUsize>,
) {
    tokio::spawn(async move {
        let mut session = 0usize;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(ws) = accept_async(stream).await else {
                continue;
            };
            session += 1;
            accepted.fetch_add(1, Ordering::SeqCst);
            let tx = frame_tx.clone();
            tokio::spawn(async move {
                let (_write, mut read) = ws.split();
                while let Some(Ok(msg)) = read.next().await {
                    if let WsMessage::Text(text) = msg {
                        let _ = tx.send((session, text));
                    }
                }
            });
        }
    });
}

/// Signal channel fired on every successful handshake.
fn on_connect_signal(client: &TransportClient) -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on_connect(Box::new(move || {
        let _ = tx.send(());
    }));
    rx
}

#[tokio::test]
async fn second_connect_is_a_no_op() {
    let (listener, port) = bind().await;
    let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
    let accepted = Arc::new(AtomicUsize::new(0));
    spawn_recording_server(listener, frame_tx, accepted.clone());

    let client = TransportClient::new(fast_config(port));
    let mut connected = on_connect_signal(&client);
    client.connect("token-1").await;
    client.connect("token-1").await;

    timeout(Duration::from_secs(5), connected.recv())
        .await
        .expect("connect")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), LinkState::Connected);
}

#[tokio::test]
async fn reconnects_with_one_handshake_per_connection() {
    let (listener, port) = bind().await;
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<(usize, String)>();

    // First session: read the handshake, then drop the socket.  Later
    // sessions stay open and record everything.
    tokio::spawn(async move {
        let mut session = 0usize;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = accept_async(stream).await else {
                continue;
            };
            session += 1;
            if session == 1 {
                if let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                    let _ = frame_tx.send((session, text));
                }
                let _ = ws.close(None).await;
            } else {
                let tx = frame_tx.clone();
                tokio::spawn(async move {
                    while let Some(Ok(msg)) = ws.next().await {
                        if let WsMessage::Text(text) = msg {
                            let _ = tx.send((session, text));
                        }
                    }
                });
            }
        }
    });

    let client = TransportClient::new(fast_config(port));
    let connects = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    {
        let connects = connects.clone();
        client.on_connect(Box::new(move || {
            connects.fetch_add(1, Ordering::SeqCst);
        }));
        let drops = drops.clone();
        client.on_disconnect(Box::new(move || {
            drops.fetch_add(1, Ordering::SeqCst);
        }));
    }
    client.connect("tok").await;

    let (session, frame) = timeout(Duration::from_secs(5), frame_rx.recv())
        .await
        .expect("first handshake")
        .unwrap();
    assert_eq!(session, 1);
    assert_eq!(event_name(&frame), "auth:init");

    // The drop is recovered without caller intervention, and the new
    // session starts with a fresh handshake.
    let (session, frame) = timeout(Duration::from_secs(5), frame_rx.recv())
        .await
        .expect("second handshake")
        .unwrap();
    assert_eq!(session, 2);
    assert_eq!(event_name(&frame), "auth:init");

    for _ in 0..200 {
        if connects.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(client.state(), LinkState::Connected);
    assert!(drops.load(Ordering::SeqCst) >= 1);

    // Exactly one handshake per connection; nothing further arrives.
    assert!(timeout(Duration::from_millis(300), frame_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn disconnected_typing_emit_is_dropped_not_replayed() {
    let (listener, port) = bind().await;
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    let accepted = Arc::new(AtomicUsize::new(0));
    spawn_recording_server(listener, frame_tx, accepted);

    let client = TransportClient::new(fast_config(port));
    assert_eq!(client.state(), LinkState::Disconnected);

    // Must not throw while disconnected, and must not be queued.
    client.emit(ClientFrame::TypingStart {
        conversation_id: "u1:u2".to_string(),
    });

    let mut connected = on_connect_signal(&client);
    client.connect("tok").await;
    timeout(Duration::from_secs(5), connected.recv())
        .await
        .expect("connect")
        .unwrap();

    let (_, frame) = timeout(Duration::from_secs(5), frame_rx.recv())
        .await
        .expect("handshake")
        .unwrap();
    assert_eq!(event_name(&frame), "auth:init");
    assert!(timeout(Duration::from_millis(300), frame_rx.recv())
        .await
        .is_err());

    // Once connected the same emit goes straight through.
    client.emit(ClientFrame::TypingStart {
        conversation_id: "u1:u2".to_string(),
    });
    let (_, frame) = timeout(Duration::from_secs(5), frame_rx.recv())
        .await
        .expect("live typing")
        .unwrap();
    assert_eq!(event_name(&frame), "typing:start");
}

#[tokio::test]
async fn queued_receipts_flush_in_order_on_connect() {
    let (listener, port) = bind().await;
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    let accepted = Arc::new(AtomicUsize::new(0));
    spawn_recording_server(listener, frame_tx, accepted);

    let client = TransportClient::new(fast_config(port));
    client.emit(ClientFrame::MessageRead {
        message_id: "m1".to_string(),
        at: 1,
    });
    client.emit(ClientFrame::ReactionAdd {
        message_id: "m1".to_string(),
        emoji: "👍".to_string(),
    });
    client.connect("tok").await;

    let mut names = Vec::new();
    for _ in 0..3 {
        let (_, frame) = timeout(Duration::from_secs(5), frame_rx.recv())
            .await
            .expect("frame")
            .unwrap();
        names.push(event_name(&frame));
    }
    assert_eq!(names, ["auth:init", "message:read", "reaction:add"]);
}

#[tokio::test]
async fn explicit_disconnect_stops_retrying() {
    let (listener, port) = bind().await;
    let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
    let accepted = Arc::new(AtomicUsize::new(0));
    spawn_recording_server(listener, frame_tx, accepted.clone());

    let client = TransportClient::new(fast_config(port));
    let mut connected = on_connect_signal(&client);
    client.connect("tok").await;
    timeout(Duration::from_secs(5), connected.recv())
        .await
        .expect("connect")
        .unwrap();

    client.disconnect().await;
    assert_eq!(client.state(), LinkState::Disconnected);

    // Several backoff periods pass with no redial.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    // Terminal until connect is called again.
    client.connect("tok").await;
    timeout(Duration::from_secs(5), connected.recv())
        .await
        .expect("reconnect after explicit disconnect")
        .unwrap();
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn heartbeat_only_runs_between_start_and_stop() {
    let (listener, port) = bind().await;
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    let accepted = Arc::new(AtomicUsize::new(0));
    spawn_recording_server(listener, frame_tx, accepted);

    let mut config = fast_config(port);
    config.heartbeat_interval = Duration::from_millis(50);
    let client = TransportClient::new(config);
    let mut connected = on_connect_signal(&client);
    client.connect("tok").await;
    timeout(Duration::from_secs(5), connected.recv())
        .await
        .expect("connect")
        .unwrap();

    let (_, frame) = timeout(Duration::from_secs(5), frame_rx.recv())
        .await
        .expect("handshake")
        .unwrap();
    assert_eq!(event_name(&frame), "auth:init");

    // Not self-starting.
    assert!(timeout(Duration::from_millis(200), frame_rx.recv())
        .await
        .is_err());

    client.start_heartbeat();
    for _ in 0..2 {
        let (_, frame) = timeout(Duration::from_secs(5), frame_rx.recv())
            .await
            .expect("heartbeat")
            .unwrap();
        assert_eq!(event_name(&frame), "presence:heartbeat");
    }

    client.stop_heartbeat();
    // Let any in-flight beat land, then expect silence.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while frame_rx.try_recv().is_ok() {}
    assert!(timeout(Duration::from_millis(250), frame_rx.recv())
        .await
        .is_err());
}
