//! Wire formats for the push connection and the backfill endpoint.
//!
//! This module is the single ingestion boundary: every external record,
//! a live frame off the socket or a row from a backfill page, is decoded
//! into a typed shape here and validated before it becomes a canonical
//! [`crate::records`] type.  Unrecognized event names and malformed
//! payloads are rejected with a [`WireError`], logged by the caller, and
//! dropped; nothing downstream ever guesses at alternate field names.
//!
//! Frames are JSON in both directions: `{"event": "...", "data": {...}}`
//! with snake_case payload fields.

use serde::{Deserialize, Serialize};

use crate::presence::PresenceState;
use crate::records::{
    conversation_id_for, AssistantMessage, Contact, Message, Reaction, ThreadKind,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A frame or record that failed strict decoding or validation.
#[derive(Debug)]
pub enum WireError {
    Serde(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Serde(e) => write!(f, "decode error: {e}"),
            WireError::Invalid(msg) => write!(f, "invalid record: {msg}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        WireError::Serde(e)
    }
}

fn require(field: &str, value: &str) -> Result<(), WireError> {
    if value.trim().is_empty() {
        Err(WireError::Invalid(format!("missing {field}")))
    } else {
        Ok(())
    }
}

fn default_thread() -> ThreadKind {
    ThreadKind::Direct
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Server → client events
// ---------------------------------------------------------------------------

/// Every event the server pushes over the connection.
///
/// The two `visitor:*` events carry embedded live-chat-widget payloads for a
/// separate collaborator feature; they are opaque to the sync engine and
/// forwarded as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew(WireMessage),
    #[serde(rename = "message:edited")]
    MessageEdited(WireMessage),
    #[serde(rename = "message:deleted")]
    MessageDeleted(WireDeletion),
    #[serde(rename = "message:read")]
    MessageRead(WireReceipt),
    #[serde(rename = "message:delivered")]
    MessageDelivered(WireReceipt),
    #[serde(rename = "typing")]
    Typing(WireTyping),
    #[serde(rename = "presence")]
    Presence(WirePresence),
    #[serde(rename = "presence:bulk")]
    PresenceBulk(WirePresenceBulk),
    #[serde(rename = "reaction:added")]
    ReactionAdded(WireReaction),
    #[serde(rename = "reaction:removed")]
    ReactionRemoved(WireReaction),
    #[serde(rename = "visitor:message")]
    VisitorMessage(serde_json::Value),
    #[serde(rename = "visitor:session")]
    VisitorSession(serde_json::Value),
}

/// Discriminant for handler registration: one handler per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageNew,
    MessageEdited,
    MessageDeleted,
    MessageRead,
    MessageDelivered,
    Typing,
    Presence,
    PresenceBulk,
    ReactionAdded,
    ReactionRemoved,
    VisitorMessage,
    VisitorSession,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::MessageNew(_) => EventKind::MessageNew,
            ServerEvent::MessageEdited(_) => EventKind::MessageEdited,
            ServerEvent::MessageDeleted(_) => EventKind::MessageDeleted,
            ServerEvent::MessageRead(_) => EventKind::MessageRead,
            ServerEvent::MessageDelivered(_) => EventKind::MessageDelivered,
            ServerEvent::Typing(_) => EventKind::Typing,
            ServerEvent::Presence(_) => EventKind::Presence,
            ServerEvent::PresenceBulk(_) => EventKind::PresenceBulk,
            ServerEvent::ReactionAdded(_) => EventKind::ReactionAdded,
            ServerEvent::ReactionRemoved(_) => EventKind::ReactionRemoved,
            ServerEvent::VisitorMessage(_) => EventKind::VisitorMessage,
            ServerEvent::VisitorSession(_) => EventKind::VisitorSession,
        }
    }
}

/// Decode one text frame off the socket.
pub fn decode_server_frame(text: &str) -> Result<ServerEvent, WireError> {
    Ok(serde_json::from_str(text)?)
}

/// A message as the server sends it, live or via backfill.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WireMessage {
    pub id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub sender_id: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub read_at: Option<i64>,
    #[serde(default)]
    pub delivered_at: Option<i64>,
    #[serde(default)]
    pub edited_at: Option<i64>,
    #[serde(default)]
    pub deleted_at: Option<i64>,
    #[serde(default = "default_thread")]
    pub thread: ThreadKind,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl WireMessage {
    /// Validate and convert into a canonical direct [`Message`], deriving
    /// the conversation id with the standard priority rules.
    pub fn into_message(self) -> Result<Message, WireError> {
        require("id", &self.id)?;
        require("sender_id", &self.sender_id)?;
        if self.created_at <= 0 {
            return Err(WireError::Invalid(format!(
                "message {}: created_at must be positive",
                self.id
            )));
        }
        let recipient_id = self.recipient_id.unwrap_or_default();
        let explicit = self.conversation_id.as_deref();
        let has_explicit = explicit.map(|c| !c.trim().is_empty()).unwrap_or(false);
        if self.thread == ThreadKind::Direct && !has_explicit {
            require("recipient_id", &recipient_id)?;
        }
        let conversation_id =
            conversation_id_for(explicit, self.thread, &self.sender_id, &recipient_id);
        Ok(Message {
            id: self.id,
            conversation_id,
            sender_id: self.sender_id,
            recipient_id,
            body: self.body,
            created_at: self.created_at,
            read_at: self.read_at,
            delivered_at: self.delivered_at,
            edited_at: self.edited_at,
            deleted_at: self.deleted_at,
            thread: self.thread,
            reactions: self.reactions,
        })
    }

    /// Validate and convert into an [`AssistantMessage`].  The recipient,
    /// if any, is dropped: assistant messages have none.
    pub fn into_assistant_message(self) -> Result<AssistantMessage, WireError> {
        require("id", &self.id)?;
        require("sender_id", &self.sender_id)?;
        if self.created_at <= 0 {
            return Err(WireError::Invalid(format!(
                "assistant message {}: created_at must be positive",
                self.id
            )));
        }
        Ok(AssistantMessage {
            id: self.id,
            sender_id: self.sender_id,
            body: self.body,
            created_at: self.created_at,
            read_at: self.read_at,
            edited_at: self.edited_at,
            deleted_at: self.deleted_at,
        })
    }
}

/// A deletion notice.  Carries only the id and timestamp; the store
/// tombstones in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WireDeletion {
    pub id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub deleted_at: i64,
    #[serde(default = "default_thread")]
    pub thread: ThreadKind,
}

/// A read or delivered receipt for a stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WireReceipt {
    pub message_id: String,
    pub at: i64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_thread")]
    pub thread: ThreadKind,
}

/// A typing indicator.  `is_typing: false` is an explicit stop; stops are
/// not guaranteed, so the tracker also expires entries on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WireTyping {
    pub conversation_id: String,
    pub user_id: String,
    #[serde(default = "default_true")]
    pub is_typing: bool,
}

/// A single user's presence update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WirePresence {
    pub user_id: String,
    pub state: PresenceState,
    pub last_seen_at: i64,
}

/// A full presence snapshot; replaces all previously tracked state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WirePresenceBulk {
    pub users: Vec<WirePresence>,
}

/// A reaction added to or removed from a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WireReaction {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
}

/// A contact row from a backfill page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WireContact {
    pub id: String,
    pub org_id: String,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub updated_at: i64,
}

impl WireContact {
    pub fn into_contact(self) -> Result<Contact, WireError> {
        require("id", &self.id)?;
        require("org_id", &self.org_id)?;
        Ok(Contact {
            id: self.id,
            org_id: self.org_id,
            display_name: self.display_name,
            email: self.email,
            avatar_url: self.avatar_url,
            updated_at: self.updated_at,
        })
    }
}

/// One page from the backfill endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BackfillPage {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub contacts: Vec<WireContact>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

// ---------------------------------------------------------------------------
// Client → server frames
// ---------------------------------------------------------------------------

/// Every frame the client emits.  All emits are fire-and-forget; see
/// [`crate::transport`] for the offline queueing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "auth:init")]
    AuthInit { token: String },
    #[serde(rename = "typing:start")]
    TypingStart { conversation_id: String },
    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: String },
    #[serde(rename = "message:read")]
    MessageRead { message_id: String, at: i64 },
    #[serde(rename = "message:delivered")]
    MessageDelivered { message_id: String, at: i64 },
    #[serde(rename = "presence:heartbeat")]
    PresenceHeartbeat {},
    #[serde(rename = "reaction:add")]
    ReactionAdd { message_id: String, emoji: String },
    #[serde(rename = "reaction:remove")]
    ReactionRemove { message_id: String, emoji: String },
    #[serde(rename = "thread:join")]
    ThreadJoin { conversation_id: String },
    #[serde(rename = "thread:leave")]
    ThreadLeave { conversation_id: String },
    #[serde(rename = "draft:save")]
    DraftSave { conversation_id: String, body: String },
}

impl ClientFrame {
    /// Ephemeral signals tolerate loss: they are dropped when the link is
    /// down rather than queued.  Typing indicators and heartbeats are
    /// worthless after the moment has passed; receipts, reactions, room
    /// membership, and drafts are worth replaying.
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self,
            ClientFrame::TypingStart { .. }
                | ClientFrame::TypingStop { .. }
                | ClientFrame::PresenceHeartbeat {}
        )
    }

    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}
