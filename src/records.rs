//! Canonical record types for the replica.
//!
//! Everything that crosses a module boundary inside the engine is one of
//! these types.  External wire shapes are converted here exactly once, at
//! the ingestion boundary in [`crate::wire`]; the store, the coordinator,
//! and the application all speak these types only.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Conversation id sentinel for the AI-assistant thread.
pub const ASSISTANT_CONVERSATION: &str = "assistant";

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Which thread a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Direct,
    Assistant,
}

impl ThreadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadKind::Direct => "direct",
            ThreadKind::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ThreadKind::Direct),
            "assistant" => Some(ThreadKind::Assistant),
            _ => None,
        }
    }
}

/// A single emoji reaction on a message.  Stored inline on the message
/// record; one entry per (user, emoji).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Reaction {
    pub user_id: String,
    pub emoji: String,
}

/// A direct message as the replica stores it.
///
/// `id` is the sole upsert identity.  A deleted message stays in place as a
/// logical tombstone: `deleted_at` set, `body` cleared, id and `created_at`
/// retained so ordering and history queries remain valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: String,
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
    pub thread: ThreadKind,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

/// A conversation summary row.  Never created independently; upserted as a
/// side effect of applying a message that references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Conversation {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub thread: ThreadKind,
    pub last_message_at: i64,
    pub unread: u32,
}

/// A cached contact projection for offline display.  Read-mostly and not
/// authoritative; the server owns contact truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Contact {
    pub id: String,
    pub org_id: String,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub updated_at: i64,
}

/// An assistant-thread message: same shape as [`Message`] minus the
/// recipient, kept in its own collection so assistant volume stays out of
/// the direct-message indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AssistantMessage {
    pub id: String,
    pub sender_id: String,
    pub body: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub read_at: Option<i64>,
    #[serde(default)]
    pub edited_at: Option<i64>,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

/// Per-collection counts plus the last full-sync timestamp, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StoreStats {
    pub messages: u64,
    pub conversations: u64,
    pub contacts: u64,
    pub assistant_messages: u64,
    pub meta_entries: u64,
    pub last_sync_at: Option<i64>,
}

/// Derive the conversation id for a direct exchange between two users.
///
/// Symmetric: the sorted join means A→B and B→A land in the same
/// conversation.
pub fn direct_conversation_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

/// Canonical conversation-id resolution, applied on every write path.
///
/// Priority: explicit non-empty value, then the assistant sentinel, then
/// the symmetric sender/recipient derivation.
pub fn conversation_id_for(
    explicit: Option<&str>,
    thread: ThreadKind,
    sender_id: &str,
    recipient_id: &str,
) -> String {
    match explicit {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ if thread == ThreadKind::Assistant => ASSISTANT_CONVERSATION.to_string(),
        _ => direct_conversation_id(sender_id, recipient_id),
    }
}

/// Content-address id for an optimistic local send: sha256 over the parts
/// that identify the send, URL-safe base64 without padding.
pub fn content_id(sender_id: &str, recipient_id: &str, body: &str, created_at: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(recipient_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    hasher.update([0u8]);
    hasher.update(created_at.to_be_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
