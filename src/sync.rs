//! Orchestration: cursor-based catch-up, live application, and cursor
//! advancement.
//!
//! The coordinator sequences startup so the replica converges no matter how
//! long the device was offline: load the last cursor, drain the backfill
//! endpoint page by page, then open the push connection and route every
//! live event through the identical normalize-and-upsert path the backfill
//! used.  Sharing that one path is the whole correctness story: combined
//! with per-id idempotent upserts it makes duplicate delivery, reconnect
//! replays, and a live event racing a backfill page all safe.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::mlog;
use crate::presence::PresenceTracker;
use crate::records::{
    content_id, conversation_id_for, now_ms, AssistantMessage, Message, ThreadKind,
};
use crate::store::LocalStore;
use crate::transport::TransportClient;
use crate::wire::{
    BackfillPage, ClientFrame, EventKind, ServerEvent, WireContact, WireMessage,
};

/// Cursor stream name for message backfill.
pub const MESSAGE_STREAM: &str = "messages";

const BACKFILL_PAGE_LIMIT: u32 = 200;

// ---------------------------------------------------------------------------
// Backfill collaborator
// ---------------------------------------------------------------------------

/// Failure talking to the backfill endpoint.  Never fatal: the coordinator
/// keeps its cursor, logs, and carries on with cached data.
#[derive(Debug)]
pub enum BackfillError {
    Http(String),
    Decode(String),
}

impl std::fmt::Display for BackfillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackfillError::Http(e) => write!(f, "backfill http error: {e}"),
            BackfillError::Decode(e) => write!(f, "backfill decode error: {e}"),
        }
    }
}

impl std::error::Error for BackfillError {}

/// The paginated historical read this engine consumes but does not
/// implement.  One call returns records newer than `cursor`.
#[async_trait]
pub trait BackfillSource: Send + Sync {
    async fn page(&self, cursor: Option<&str>, limit: u32)
        -> Result<BackfillPage, BackfillError>;
}

/// Stock implementation against the portal's REST endpoint.
pub struct HttpBackfill {
    base_url: String,
    token: String,
}

impl HttpBackfill {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl BackfillSource for HttpBackfill {
    async fn page(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<BackfillPage, BackfillError> {
        let mut url = format!("{}/sync?limit={limit}", self.base_url.trim_end_matches('/'));
        if let Some(cursor) = cursor {
            url.push_str(&format!("&cursor={cursor}"));
        }
        let response = ureq::get(&url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .call()
            .map_err(|e| BackfillError::Http(e.to_string()))?;
        response
            .into_json::<BackfillPage>()
            .map_err(|e| BackfillError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Sequences catch-up and live application.  Composed by the application
/// from the store, transport, presence tracker, and a backfill source.
pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    transport: TransportClient,
    presence: Arc<PresenceTracker>,
    backfill: Arc<dyn BackfillSource>,
    page_limit: u32,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<LocalStore>,
        transport: TransportClient,
        presence: Arc<PresenceTracker>,
        backfill: Arc<dyn BackfillSource>,
    ) -> Self {
        Self {
            store,
            transport,
            presence,
            backfill,
            page_limit: BACKFILL_PAGE_LIMIT,
        }
    }

    /// Override the backfill page size.
    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit;
        self
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Full startup: catch up from the backfill endpoint, wire live-event
    /// routing, then open the push connection.
    pub async fn start(&self, token: &str) {
        self.catch_up().await;
        self.wire_live_events();
        self.transport.connect(token).await;
    }

    /// Drain the backfill endpoint from the stored cursor.  The cursor
    /// advances after every applied page, so an interrupted catch-up never
    /// refetches what it already wrote, and never skips what it did not.
    pub async fn catch_up(&self) {
        let mut cursor = self.store.cursor(MESSAGE_STREAM).await;
        loop {
            let page = match self.backfill.page(cursor.as_deref(), self.page_limit).await {
                Ok(page) => page,
                Err(e) => {
                    // Offline is not an error state; cached data serves.
                    mlog!("sync: backfill unavailable, using cached data: {e}");
                    return;
                }
            };
            let BackfillPage {
                messages,
                contacts,
                next_cursor,
                has_more,
            } = page;
            let fetched = messages.len();
            self.apply_backfill_records(messages, contacts).await;
            if fetched > 0 {
                mlog!("sync: applied {fetched} backfill record(s)");
            }
            match next_cursor {
                Some(next) => {
                    self.store.set_cursor(MESSAGE_STREAM, &next).await;
                    cursor = Some(next);
                }
                // A page that cannot advance the cursor ends the drain;
                // looping on the same cursor would refetch forever.
                None => break,
            }
            if !has_more {
                break;
            }
        }
        self.store.set_last_sync_at(now_ms()).await;
    }

    async fn apply_backfill_records(
        &self,
        messages: Vec<WireMessage>,
        contacts: Vec<WireContact>,
    ) {
        let mut direct = Vec::new();
        let mut assistant = Vec::new();
        for wire_msg in messages {
            match wire_msg.thread {
                ThreadKind::Assistant => match wire_msg.into_assistant_message() {
                    Ok(msg) => assistant.push(msg),
                    Err(e) => mlog!("sync: dropped backfill record: {e}"),
                },
                ThreadKind::Direct => match wire_msg.into_message() {
                    Ok(msg) => direct.push(msg),
                    Err(e) => mlog!("sync: dropped backfill record: {e}"),
                },
            }
        }
        let mut cached_contacts = Vec::new();
        for wire_contact in contacts {
            match wire_contact.into_contact() {
                Ok(contact) => cached_contacts.push(contact),
                Err(e) => mlog!("sync: dropped backfill contact: {e}"),
            }
        }
        self.store.put_messages(&direct).await;
        self.store.put_assistant_messages(&assistant).await;
        self.store.put_contacts(&cached_contacts).await;
    }

    /// Register transport handlers.  Message-family events funnel into one
    /// apply loop so application is serialized; presence and typing update
    /// the tracker in place with no store I/O.
    pub fn wire_live_events(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        for kind in [
            EventKind::MessageNew,
            EventKind::MessageEdited,
            EventKind::MessageDeleted,
            EventKind::MessageRead,
            EventKind::MessageDelivered,
            EventKind::ReactionAdded,
            EventKind::ReactionRemoved,
        ] {
            let tx = tx.clone();
            self.transport.on(
                kind,
                Box::new(move |event| {
                    let _ = tx.send(event);
                }),
            );
        }

        let presence = self.presence.clone();
        self.transport.on(
            EventKind::Presence,
            Box::new(move |event| {
                if let ServerEvent::Presence(update) = event {
                    presence.apply_presence(&update);
                }
            }),
        );
        let presence = self.presence.clone();
        self.transport.on(
            EventKind::PresenceBulk,
            Box::new(move |event| {
                if let ServerEvent::PresenceBulk(snapshot) = event {
                    presence.apply_snapshot(&snapshot);
                }
            }),
        );
        let presence = self.presence.clone();
        self.transport.on(
            EventKind::Typing,
            Box::new(move |event| {
                if let ServerEvent::Typing(typing) = event {
                    presence.apply_typing(&typing);
                }
            }),
        );
        // Awareness state is never authoritative across a gap: drop it on
        // disconnect and let the next bulk snapshot rebuild it.
        let presence = self.presence.clone();
        self.transport.on_disconnect(Box::new(move || {
            presence.clear();
        }));

        let store = self.store.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                apply_event(&store, event).await;
            }
        });
    }

    /// Forward the embedded live-chat-widget events to the collaborating
    /// feature.  Payloads are opaque here and never stored.
    pub fn route_widget_events(&self, handler: Box<dyn FnMut(ServerEvent) + Send>) {
        let shared = Arc::new(std::sync::Mutex::new(handler));
        let for_messages = shared.clone();
        self.transport.on(
            EventKind::VisitorMessage,
            Box::new(move |event| {
                (*for_messages.lock().unwrap())(event);
            }),
        );
        self.transport.on(
            EventKind::VisitorSession,
            Box::new(move |event| {
                (*shared.lock().unwrap())(event);
            }),
        );
    }

    /// Optimistic local send: the message is in the replica (pending, no
    /// `delivered_at`) before any network attempt, so offline sends are
    /// never lost to a dropped socket.
    pub async fn send_message(&self, recipient_id: &str, body: &str) -> Message {
        let sender_id = self.store.session_user().await.unwrap_or_default();
        let created_at = now_ms();
        let message = Message {
            id: content_id(&sender_id, recipient_id, body, created_at),
            conversation_id: conversation_id_for(
                None,
                ThreadKind::Direct,
                &sender_id,
                recipient_id,
            ),
            sender_id,
            recipient_id: recipient_id.to_string(),
            body: Some(body.to_string()),
            created_at,
            read_at: None,
            delivered_at: None,
            edited_at: None,
            deleted_at: None,
            thread: ThreadKind::Direct,
            reactions: Vec::new(),
        };
        self.store.put_message(&message).await;
        message
    }

    /// Optimistic send into the assistant thread.
    pub async fn send_assistant_message(&self, body: &str) -> AssistantMessage {
        let sender_id = self.store.session_user().await.unwrap_or_default();
        let created_at = now_ms();
        let message = AssistantMessage {
            id: content_id(&sender_id, "", body, created_at),
            sender_id,
            body: Some(body.to_string()),
            created_at,
            read_at: None,
            edited_at: None,
            deleted_at: None,
        };
        self.store.put_assistant_message(&message).await;
        message
    }

    /// Mark a message read locally and acknowledge to the server.  The ack
    /// is queueable, so an offline read is replayed on reconnect.
    pub async fn mark_read(&self, message_id: &str) {
        let at = now_ms();
        self.store.mark_message_read(message_id, at).await;
        self.transport.emit(ClientFrame::MessageRead {
            message_id: message_id.to_string(),
            at,
        });
    }

    /// Mark a message delivered locally and acknowledge to the server.
    pub async fn mark_delivered(&self, message_id: &str) {
        let at = now_ms();
        self.store.mark_message_delivered(message_id, at).await;
        self.transport.emit(ClientFrame::MessageDelivered {
            message_id: message_id.to_string(),
            at,
        });
    }

    /// Stop the heartbeat and close the link.  The replica stays intact.
    pub async fn shutdown(&self) {
        self.transport.stop_heartbeat();
        self.transport.disconnect().await;
    }

    /// Explicit logout: close the link and wipe every collection.
    pub async fn logout(&self) {
        self.shutdown().await;
        self.store.clear_all().await;
    }
}

/// The single application path shared by backfill and live events.
async fn apply_event(store: &LocalStore, event: ServerEvent) {
    match event {
        ServerEvent::MessageNew(wire_msg) | ServerEvent::MessageEdited(wire_msg) => {
            match wire_msg.thread {
                ThreadKind::Assistant => match wire_msg.into_assistant_message() {
                    Ok(msg) => store.put_assistant_message(&msg).await,
                    Err(e) => mlog!("sync: dropped live event: {e}"),
                },
                ThreadKind::Direct => match wire_msg.into_message() {
                    Ok(msg) => store.put_message(&msg).await,
                    Err(e) => mlog!("sync: dropped live event: {e}"),
                },
            }
        }
        ServerEvent::MessageDeleted(deletion) => match deletion.thread {
            ThreadKind::Assistant => {
                store
                    .mark_assistant_message_deleted(&deletion.id, deletion.deleted_at)
                    .await
            }
            ThreadKind::Direct => {
                store
                    .mark_message_deleted(&deletion.id, deletion.deleted_at)
                    .await
            }
        },
        ServerEvent::MessageRead(receipt) => match receipt.thread {
            ThreadKind::Assistant => {
                store
                    .mark_assistant_message_read(&receipt.message_id, receipt.at)
                    .await
            }
            ThreadKind::Direct => {
                store
                    .mark_message_read(&receipt.message_id, receipt.at)
                    .await
            }
        },
        ServerEvent::MessageDelivered(receipt) => {
            store
                .mark_message_delivered(&receipt.message_id, receipt.at)
                .await
        }
        ServerEvent::ReactionAdded(reaction) => {
            store
                .apply_reaction(&reaction.message_id, &reaction.user_id, &reaction.emoji, true)
                .await
        }
        ServerEvent::ReactionRemoved(reaction) => {
            store
                .apply_reaction(
                    &reaction.message_id,
                    &reaction.user_id,
                    &reaction.emoji,
                    false,
                )
                .await
        }
        // Presence, typing, and widget events are routed straight off the
        // transport; they never reach the store path.
        ServerEvent::Typing(_)
        | ServerEvent::Presence(_)
        | ServerEvent::PresenceBulk(_)
        | ServerEvent::VisitorMessage(_)
        | ServerEvent::VisitorSession(_) => {}
    }
}
