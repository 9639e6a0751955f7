//! The push connection: one logical, authenticated, auto-healing WebSocket
//! per device session.
//!
//! The client is an explicit instance owned by the composing application;
//! two sessions never share hidden state.  A spawned supervisor task owns
//! the socket: it dials with a timeout, performs the `auth:init` handshake,
//! pumps frames in both directions, and on any drop retries forever with
//! capped exponential backoff.  The handshake is re-sent after every
//! successful redial because subscription membership does not survive a
//! reconnect.
//!
//! Emits are fire-and-forget.  While the link is down, ephemeral signals
//! (typing, heartbeat) are dropped outright; queueable ones (receipts,
//! reactions, room membership, drafts) wait in a small bounded FIFO that is
//! flushed in order right after the next handshake.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::mlog;
use crate::wire::{decode_server_frame, ClientFrame, EventKind, ServerEvent};

/// Connection configuration.  The auth token is not part of the config; it
/// is passed to [`TransportClient::connect`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
    pub heartbeat_interval: Duration,
    pub emit_queue_capacity: usize,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            backoff_floor: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(25),
            emit_queue_capacity: 64,
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// One handler per server event kind; re-registration replaces.
pub type EventHandler = Box<dyn FnMut(ServerEvent) + Send>;

/// Callback for connect/disconnect transitions.
pub type LinkHandler = Box<dyn FnMut() + Send>;

struct Shared {
    state: Mutex<LinkState>,
    handlers: Mutex<HashMap<EventKind, EventHandler>>,
    on_connect: Mutex<Option<LinkHandler>>,
    on_disconnect: Mutex<Option<LinkHandler>>,
    // Queueable emits waiting for a link; oldest evicted at capacity.
    pending: Mutex<VecDeque<ClientFrame>>,
    // Writer handle for the live connection, if any.
    live_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the push connection.  Cheap to clone; all clones share the
/// same underlying link.
#[derive(Clone)]
pub struct TransportClient {
    config: Arc<TransportConfig>,
    shared: Arc<Shared>,
}

impl TransportClient {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config: Arc::new(config),
            shared: Arc::new(Shared {
                state: Mutex::new(LinkState::Disconnected),
                handlers: Mutex::new(HashMap::new()),
                on_connect: Mutex::new(None),
                on_disconnect: Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
                live_tx: Mutex::new(None),
                supervisor: Mutex::new(None),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.lock().unwrap()
    }

    fn set_state(&self, state: LinkState) {
        *self.shared.state.lock().unwrap() = state;
    }

    /// Register the handler for an event kind, replacing any previous one.
    pub fn on(&self, kind: EventKind, handler: EventHandler) {
        self.shared.handlers.lock().unwrap().insert(kind, handler);
    }

    /// Remove the handler for an event kind.  Frames of that kind are then
    /// dropped on arrival.
    pub fn clear_handler(&self, kind: EventKind) {
        self.shared.handlers.lock().unwrap().remove(&kind);
    }

    /// Called after every successful handshake, first connect and redials
    /// alike.
    pub fn on_connect(&self, handler: LinkHandler) {
        *self.shared.on_connect.lock().unwrap() = Some(handler);
    }

    /// Called whenever an established link drops.
    pub fn on_disconnect(&self, handler: LinkHandler) {
        *self.shared.on_disconnect.lock().unwrap() = Some(handler);
    }

    /// Open the connection.  Idempotent: if a link is already up or being
    /// established, this is a no-op and the existing connection wins.
    pub async fn connect(&self, token: &str) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != LinkState::Disconnected {
                return;
            }
            *state = LinkState::Connecting;
        }
        // Tear down any stale supervisor from a previous session.
        if let Some(handle) = self.shared.supervisor.lock().unwrap().take() {
            handle.abort();
        }
        let client = self.clone();
        let token = token.to_string();
        let handle = tokio::spawn(async move {
            client.run(token).await;
        });
        *self.shared.supervisor.lock().unwrap() = Some(handle);
    }

    /// Tear the link down.  Terminal until the next `connect`; queued emits
    /// are discarded and in-flight ones are lost, by design.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.shared.supervisor.lock().unwrap().take() {
            handle.abort();
        }
        *self.shared.live_tx.lock().unwrap() = None;
        self.shared.pending.lock().unwrap().clear();
        let was = {
            let mut state = self.shared.state.lock().unwrap();
            std::mem::replace(&mut *state, LinkState::Disconnected)
        };
        if was == LinkState::Connected {
            self.fire_disconnect();
        }
    }

    /// Fire-and-forget emit.  Never throws; see the module docs for what
    /// happens while the link is down.
    pub fn emit(&self, frame: ClientFrame) {
        let live = self.shared.live_tx.lock().unwrap().clone();
        match live {
            Some(tx) => match frame.encode() {
                Ok(text) => {
                    let _ = tx.send(text);
                }
                Err(e) => mlog!("transport: emit encode failed: {e}"),
            },
            None => {
                if frame.is_ephemeral() {
                    return;
                }
                let mut pending = self.shared.pending.lock().unwrap();
                if pending.len() >= self.config.emit_queue_capacity {
                    pending.pop_front();
                    mlog!("transport: emit queue full, evicted oldest");
                }
                pending.push_back(frame);
            }
        }
    }

    /// Start the presence heartbeat.  Not self-starting: the session owner
    /// decides when a heartbeat is worth the wakeups.  Idempotent.
    pub fn start_heartbeat(&self) {
        let mut heartbeat = self.shared.heartbeat.lock().unwrap();
        if heartbeat.is_some() {
            return;
        }
        let client = self.clone();
        let interval = self.config.heartbeat_interval;
        *heartbeat = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                client.emit(ClientFrame::PresenceHeartbeat {});
            }
        }));
    }

    /// Stop the presence heartbeat.
    pub fn stop_heartbeat(&self) {
        if let Some(handle) = self.shared.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn fire_connect(&self) {
        if let Some(handler) = self.shared.on_connect.lock().unwrap().as_mut() {
            handler();
        }
    }

    fn fire_disconnect(&self) {
        if let Some(handler) = self.shared.on_disconnect.lock().unwrap().as_mut() {
            handler();
        }
    }

    fn dispatch(&self, text: &str) {
        match decode_server_frame(text) {
            Ok(event) => {
                let kind = event.kind();
                let mut handlers = self.shared.handlers.lock().unwrap();
                if let Some(handler) = handlers.get_mut(&kind) {
                    handler(event);
                }
            }
            // A malformed frame never halts the pipeline.
            Err(e) => mlog!("transport: dropped malformed frame: {e}"),
        }
    }

    /// Connection supervisor: dial, handshake, pump, and retry forever.
    /// Only an explicit `disconnect` (which aborts this task) gives up.
    async fn run(self, token: String) {
        let mut backoff = self.config.backoff_floor;
        loop {
            let dialed = tokio::time::timeout(
                self.config.connect_timeout,
                connect_async(self.config.url.as_str()),
            )
            .await;

            match dialed {
                Ok(Ok((ws, _response))) => {
                    let (mut write, mut read) = ws.split();

                    let auth = ClientFrame::AuthInit {
                        token: token.clone(),
                    };
                    let handshake_sent = match auth.encode() {
                        Ok(text) => write.send(WsMessage::Text(text)).await.is_ok(),
                        Err(e) => {
                            mlog!("transport: handshake encode failed: {e}");
                            false
                        }
                    };

                    if handshake_sent {
                        self.set_state(LinkState::Connected);
                        backoff = self.config.backoff_floor;

                        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                        // Flush queued emits through the same writer path so
                        // they stay ordered ahead of anything emitted next.
                        {
                            let mut pending = self.shared.pending.lock().unwrap();
                            for frame in pending.drain(..) {
                                if let Ok(text) = frame.encode() {
                                    let _ = tx.send(text);
                                }
                            }
                        }
                        *self.shared.live_tx.lock().unwrap() = Some(tx);
                        // The live path is up before the callback runs, so
                        // anything the callback emits goes straight out.
                        self.fire_connect();

                        loop {
                            tokio::select! {
                                incoming = read.next() => match incoming {
                                    Some(Ok(WsMessage::Text(text))) => self.dispatch(&text),
                                    Some(Ok(WsMessage::Close(_))) | None => break,
                                    Some(Err(e)) => {
                                        mlog!("transport: read error: {e}");
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                },
                                outgoing = rx.recv() => match outgoing {
                                    Some(text) => {
                                        if write.send(WsMessage::Text(text)).await.is_err() {
                                            break;
                                        }
                                    }
                                    None => break,
                                },
                            }
                        }

                        *self.shared.live_tx.lock().unwrap() = None;
                        self.fire_disconnect();
                        mlog!(
                            "transport: link dropped, reconnecting in {}ms",
                            backoff.as_millis()
                        );
                    }
                }
                Ok(Err(e)) => {
                    mlog!(
                        "transport: connect failed (retry in {}ms): {e}",
                        backoff.as_millis()
                    );
                }
                Err(_) => {
                    mlog!(
                        "transport: connect timed out after {}ms",
                        self.config.connect_timeout.as_millis()
                    );
                }
            }

            self.set_state(LinkState::Reconnecting);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.backoff_cap);
        }
    }
}
