//! SQLite replica of server-known conversational state (the local store).
//!
//! Five logical collections: messages, conversations, contacts, assistant
//! messages, and sync metadata.  All writes are idempotent upserts keyed by
//! id, which is what makes duplicate delivery, reconnection replays, and
//! overlapping backfill/live writes safe without any cross-writer lock.
//!
//! The store is a best-effort cache, not the system of record.  After a
//! successful `open`, no operation surfaces an error to the caller: each
//! one catches its own I/O failure, logs it, and returns a safe default
//! (empty vec, `None`, or a silent no-op).  An empty read means "nothing
//! cached yet", never "something broke".

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::mlog;
use crate::records::{
    conversation_id_for, direct_conversation_id, AssistantMessage, Contact, Conversation,
    Message, Reaction, StoreStats, ThreadKind,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Internal store failure.  Only `open`/`open_in_memory` ever return this;
/// every other operation swallows it after logging.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::Serde(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// Metadata keys
// ---------------------------------------------------------------------------

const META_LAST_SYNC: &str = "last_sync_at";
const META_SESSION_USER: &str = "session_user_id";

fn cursor_key(stream: &str) -> String {
    format!("cursor:{stream}")
}

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

/// Durable per-device replica.  One connection, behind an async mutex so
/// callers suspend at every read/write; the device is the sole writer of
/// its own replica.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open or create the database at `path`.  This is the one operation
    /// that surfaces an error: with no database there is nothing to fall
    /// back to.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn create_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender_id       TEXT NOT NULL,
                recipient_id    TEXT NOT NULL,
                body            TEXT,
                created_at      INTEGER NOT NULL,
                read_at         INTEGER,
                delivered_at    INTEGER,
                edited_at       INTEGER,
                deleted_at      INTEGER,
                thread          TEXT NOT NULL DEFAULT 'direct',
                reactions       TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_messages_sender
                ON messages(sender_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_recipient
                ON messages(recipient_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_created
                ON messages(created_at);

            CREATE TABLE IF NOT EXISTS conversations (
                id              TEXT PRIMARY KEY,
                participant_a   TEXT NOT NULL,
                participant_b   TEXT NOT NULL,
                thread          TEXT NOT NULL,
                last_message_at INTEGER NOT NULL,
                unread          INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_recency
                ON conversations(last_message_at);
            CREATE INDEX IF NOT EXISTS idx_conversations_thread
                ON conversations(thread);

            CREATE TABLE IF NOT EXISTS contacts (
                id              TEXT PRIMARY KEY,
                org_id          TEXT NOT NULL,
                display_name    TEXT NOT NULL,
                email           TEXT,
                avatar_url      TEXT,
                updated_at      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_contacts_org
                ON contacts(org_id);
            CREATE INDEX IF NOT EXISTS idx_contacts_name
                ON contacts(display_name);

            CREATE TABLE IF NOT EXISTS assistant_messages (
                id              TEXT PRIMARY KEY,
                sender_id       TEXT NOT NULL,
                body            TEXT,
                created_at      INTEGER NOT NULL,
                read_at         INTEGER,
                edited_at       INTEGER,
                deleted_at      INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_assistant_created
                ON assistant_messages(created_at);

            CREATE TABLE IF NOT EXISTS sync_meta (
                key     TEXT PRIMARY KEY,
                value   TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Row mapping
    // -----------------------------------------------------------------------

    fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
        let thread: String = row.get(10)?;
        let reactions: String = row.get(11)?;
        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            recipient_id: row.get(3)?,
            body: row.get(4)?,
            created_at: row.get(5)?,
            read_at: row.get(6)?,
            delivered_at: row.get(7)?,
            edited_at: row.get(8)?,
            deleted_at: row.get(9)?,
            thread: ThreadKind::parse(&thread).unwrap_or(ThreadKind::Direct),
            reactions: serde_json::from_str::<Vec<Reaction>>(&reactions).unwrap_or_default(),
        })
    }

    const MESSAGE_COLUMNS: &'static str = "id, conversation_id, sender_id, recipient_id, body, \
         created_at, read_at, delivered_at, edited_at, deleted_at, thread, reactions";

    fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
        let thread: String = row.get(3)?;
        Ok(Conversation {
            id: row.get(0)?,
            participant_a: row.get(1)?,
            participant_b: row.get(2)?,
            thread: ThreadKind::parse(&thread).unwrap_or(ThreadKind::Direct),
            last_message_at: row.get(4)?,
            unread: row.get::<_, i64>(5)? as u32,
        })
    }

    fn contact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
        Ok(Contact {
            id: row.get(0)?,
            org_id: row.get(1)?,
            display_name: row.get(2)?,
            email: row.get(3)?,
            avatar_url: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn assistant_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssistantMessage> {
        Ok(AssistantMessage {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            body: row.get(2)?,
            created_at: row.get(3)?,
            read_at: row.get(4)?,
            edited_at: row.get(5)?,
            deleted_at: row.get(6)?,
        })
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    fn put_message_tx(conn: &Connection, msg: &Message) -> Result<String, StoreError> {
        // Normalization contract: never trust the caller's conversation id.
        let conversation_id = conversation_id_for(
            Some(&msg.conversation_id),
            msg.thread,
            &msg.sender_id,
            &msg.recipient_id,
        );
        let reactions = serde_json::to_string(&msg.reactions)?;
        conn.execute(
            "INSERT OR REPLACE INTO messages
             (id, conversation_id, sender_id, recipient_id, body, created_at,
              read_at, delivered_at, edited_at, deleted_at, thread, reactions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                msg.id,
                conversation_id,
                msg.sender_id,
                msg.recipient_id,
                msg.body,
                msg.created_at,
                msg.read_at,
                msg.delivered_at,
                msg.edited_at,
                msg.deleted_at,
                msg.thread.as_str(),
                reactions,
            ],
        )?;
        Ok(conversation_id)
    }

    /// Recompute the conversation summary row from its messages.  Idempotent
    /// and safe to call after any message write; a conversation with no
    /// rows is left untouched.
    fn refresh_conversation(
        conn: &Connection,
        conversation_id: &str,
        sender_id: &str,
        recipient_id: &str,
        thread: ThreadKind,
    ) -> Result<(), StoreError> {
        let last_message_at: Option<i64> = conn
            .query_row(
                "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let Some(last_message_at) = last_message_at else {
            return Ok(());
        };

        let viewer: Option<String> = Self::meta_get_tx(conn, META_SESSION_USER)?;
        let unread: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1
               AND read_at IS NULL
               AND deleted_at IS NULL
               AND (?2 IS NULL OR sender_id != ?2)",
            params![conversation_id, viewer],
            |row| row.get(0),
        )?;

        let pair = direct_conversation_id(sender_id, recipient_id);
        let (participant_a, participant_b) = match pair.split_once(':') {
            Some((a, b)) => (a.to_string(), b.to_string()),
            None => (sender_id.to_string(), recipient_id.to_string()),
        };

        conn.execute(
            "INSERT OR REPLACE INTO conversations
             (id, participant_a, participant_b, thread, last_message_at, unread)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation_id,
                participant_a,
                participant_b,
                thread.as_str(),
                last_message_at,
                unread,
            ],
        )?;
        Ok(())
    }

    async fn with_conn<T>(
        &self,
        what: &str,
        default: T,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> T {
        let conn = self.conn.lock().await;
        match f(&conn) {
            Ok(value) => value,
            Err(e) => {
                mlog!("store: {what} failed: {e}");
                default
            }
        }
    }

    /// Idempotent upsert by id; also refreshes the conversation summary.
    pub async fn put_message(&self, msg: &Message) {
        self.with_conn("put_message", (), |conn| {
            let conversation_id = Self::put_message_tx(conn, msg)?;
            Self::refresh_conversation(
                conn,
                &conversation_id,
                &msg.sender_id,
                &msg.recipient_id,
                msg.thread,
            )
        })
        .await
    }

    /// Batch upsert in a single transaction; conversation summaries are
    /// refreshed once per distinct conversation.
    pub async fn put_messages(&self, msgs: &[Message]) {
        if msgs.is_empty() {
            return;
        }
        self.with_conn("put_messages", (), |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut refreshed: Vec<(String, String, String, ThreadKind)> = Vec::new();
            for msg in msgs {
                let conversation_id = Self::put_message_tx(&tx, msg)?;
                if !refreshed.iter().any(|(c, ..)| c == &conversation_id) {
                    refreshed.push((
                        conversation_id,
                        msg.sender_id.clone(),
                        msg.recipient_id.clone(),
                        msg.thread,
                    ));
                }
            }
            for (conversation_id, sender, recipient, thread) in &refreshed {
                Self::refresh_conversation(&tx, conversation_id, sender, recipient, *thread)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Point read by id.
    pub async fn message(&self, id: &str) -> Option<Message> {
        self.with_conn("message", None, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE id = ?1",
                Self::MESSAGE_COLUMNS
            ))?;
            Ok(stmt
                .query_row(params![id], Self::message_from_row)
                .optional()?)
        })
        .await
    }

    /// All messages in a conversation, ascending `created_at` with id as a
    /// deterministic tie-break; insertion order never matters.
    pub async fn conversation_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.with_conn("conversation_messages", Vec::new(), |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC",
                Self::MESSAGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![conversation_id], Self::message_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Incremental diff: every message created, edited, or deleted after
    /// `since` (unix ms).
    pub async fn messages_since(&self, since: i64) -> Vec<Message> {
        self.with_conn("messages_since", Vec::new(), |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages
                 WHERE created_at > ?1
                    OR COALESCE(edited_at, 0) > ?1
                    OR COALESCE(deleted_at, 0) > ?1
                 ORDER BY created_at ASC, id ASC",
                Self::MESSAGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![since], Self::message_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Stamp a read receipt and refresh the unread counter.  No-op for an
    /// id the replica has not seen.
    pub async fn mark_message_read(&self, id: &str, at: i64) {
        self.with_conn("mark_message_read", (), |conn| {
            conn.execute(
                "UPDATE messages SET read_at = ?1 WHERE id = ?2 AND read_at IS NULL",
                params![at, id],
            )?;
            Self::refresh_conversation_of(conn, id)
        })
        .await
    }

    /// Stamp a delivered receipt.  No-op for an unknown id.
    pub async fn mark_message_delivered(&self, id: &str, at: i64) {
        self.with_conn("mark_message_delivered", (), |conn| {
            conn.execute(
                "UPDATE messages SET delivered_at = ?1 WHERE id = ?2 AND delivered_at IS NULL",
                params![at, id],
            )?;
            Ok(())
        })
        .await
    }

    /// Tombstone in place: clear the body, stamp `deleted_at`, keep id and
    /// `created_at` so ordering and history queries stay valid.
    pub async fn mark_message_deleted(&self, id: &str, at: i64) {
        self.with_conn("mark_message_deleted", (), |conn| {
            conn.execute(
                "UPDATE messages SET deleted_at = ?1, body = NULL WHERE id = ?2",
                params![at, id],
            )?;
            Self::refresh_conversation_of(conn, id)
        })
        .await
    }

    fn refresh_conversation_of(conn: &Connection, message_id: &str) -> Result<(), StoreError> {
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT conversation_id, sender_id, recipient_id, thread
                 FROM messages WHERE id = ?1",
                params![message_id],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                },
            )
            .optional()?;
        if let Some((conversation_id, sender, recipient, thread)) = row {
            let thread = ThreadKind::parse(&thread).unwrap_or(ThreadKind::Direct);
            Self::refresh_conversation(conn, &conversation_id, &sender, &recipient, thread)?;
        }
        Ok(())
    }

    /// Add or remove a reaction on a stored message.  One entry per
    /// (user, emoji); replays converge.
    pub async fn apply_reaction(&self, message_id: &str, user_id: &str, emoji: &str, add: bool) {
        self.with_conn("apply_reaction", (), |conn| {
            let current: Option<String> = conn
                .query_row(
                    "SELECT reactions FROM messages WHERE id = ?1",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Ok(());
            };
            let mut reactions: Vec<Reaction> =
                serde_json::from_str(&current).unwrap_or_default();
            let entry = Reaction {
                user_id: user_id.to_string(),
                emoji: emoji.to_string(),
            };
            if add {
                if !reactions.contains(&entry) {
                    reactions.push(entry);
                }
            } else {
                reactions.retain(|r| r != &entry);
            }
            conn.execute(
                "UPDATE messages SET reactions = ?1 WHERE id = ?2",
                params![serde_json::to_string(&reactions)?, message_id],
            )?;
            Ok(())
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    pub async fn conversation(&self, id: &str) -> Option<Conversation> {
        self.with_conn("conversation", None, |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, participant_a, participant_b, thread, last_message_at, unread
                 FROM conversations WHERE id = ?1",
            )?;
            Ok(stmt
                .query_row(params![id], Self::conversation_from_row)
                .optional()?)
        })
        .await
    }

    /// All conversations, most recently active first.
    pub async fn conversations_by_recency(&self) -> Vec<Conversation> {
        self.with_conn("conversations_by_recency", Vec::new(), |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, participant_a, participant_b, thread, last_message_at, unread
                 FROM conversations ORDER BY last_message_at DESC, id ASC",
            )?;
            let rows = stmt.query_map([], Self::conversation_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Contacts
    // -----------------------------------------------------------------------

    pub async fn put_contact(&self, contact: &Contact) {
        self.with_conn("put_contact", (), |conn| {
            Self::put_contact_tx(conn, contact)
        })
        .await
    }

    pub async fn put_contacts(&self, contacts: &[Contact]) {
        if contacts.is_empty() {
            return;
        }
        self.with_conn("put_contacts", (), |conn| {
            let tx = conn.unchecked_transaction()?;
            for contact in contacts {
                Self::put_contact_tx(&tx, contact)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    fn put_contact_tx(conn: &Connection, contact: &Contact) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR REPLACE INTO contacts
             (id, org_id, display_name, email, avatar_url, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                contact.id,
                contact.org_id,
                contact.display_name,
                contact.email,
                contact.avatar_url,
                contact.updated_at,
            ],
        )?;
        Ok(())
    }

    pub async fn contact(&self, id: &str) -> Option<Contact> {
        self.with_conn("contact", None, |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, org_id, display_name, email, avatar_url, updated_at
                 FROM contacts WHERE id = ?1",
            )?;
            Ok(stmt
                .query_row(params![id], Self::contact_from_row)
                .optional()?)
        })
        .await
    }

    pub async fn contacts_by_org(&self, org_id: &str) -> Vec<Contact> {
        self.with_conn("contacts_by_org", Vec::new(), |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, org_id, display_name, email, avatar_url, updated_at
                 FROM contacts WHERE org_id = ?1 ORDER BY display_name ASC",
            )?;
            let rows = stmt.query_map(params![org_id], Self::contact_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Assistant messages
    // -----------------------------------------------------------------------

    pub async fn put_assistant_message(&self, msg: &AssistantMessage) {
        self.with_conn("put_assistant_message", (), |conn| {
            Self::put_assistant_tx(conn, msg)
        })
        .await
    }

    pub async fn put_assistant_messages(&self, msgs: &[AssistantMessage]) {
        if msgs.is_empty() {
            return;
        }
        self.with_conn("put_assistant_messages", (), |conn| {
            let tx = conn.unchecked_transaction()?;
            for msg in msgs {
                Self::put_assistant_tx(&tx, msg)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    fn put_assistant_tx(conn: &Connection, msg: &AssistantMessage) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR REPLACE INTO assistant_messages
             (id, sender_id, body, created_at, read_at, edited_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                msg.id,
                msg.sender_id,
                msg.body,
                msg.created_at,
                msg.read_at,
                msg.edited_at,
                msg.deleted_at,
            ],
        )?;
        Ok(())
    }

    /// The assistant thread, ascending `created_at` with id tie-break.
    pub async fn assistant_messages(&self) -> Vec<AssistantMessage> {
        self.with_conn("assistant_messages", Vec::new(), |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, body, created_at, read_at, edited_at, deleted_at
                 FROM assistant_messages ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map([], Self::assistant_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn mark_assistant_message_read(&self, id: &str, at: i64) {
        self.with_conn("mark_assistant_message_read", (), |conn| {
            conn.execute(
                "UPDATE assistant_messages SET read_at = ?1 WHERE id = ?2 AND read_at IS NULL",
                params![at, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_assistant_message_deleted(&self, id: &str, at: i64) {
        self.with_conn("mark_assistant_message_deleted", (), |conn| {
            conn.execute(
                "UPDATE assistant_messages SET deleted_at = ?1, body = NULL WHERE id = ?2",
                params![at, id],
            )?;
            Ok(())
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Sync metadata
    // -----------------------------------------------------------------------

    fn meta_get_tx(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
        Ok(conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn meta_set_tx(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Pagination cursor for a named sync stream.
    pub async fn cursor(&self, stream: &str) -> Option<String> {
        let key = cursor_key(stream);
        self.with_conn("cursor", None, |conn| Self::meta_get_tx(conn, &key))
            .await
    }

    pub async fn set_cursor(&self, stream: &str, value: &str) {
        let key = cursor_key(stream);
        self.with_conn("set_cursor", (), |conn| Self::meta_set_tx(conn, &key, value))
            .await
    }

    pub async fn last_sync_at(&self) -> Option<i64> {
        self.with_conn("last_sync_at", None, |conn| {
            Ok(Self::meta_get_tx(conn, META_LAST_SYNC)?.and_then(|v| v.parse().ok()))
        })
        .await
    }

    pub async fn set_last_sync_at(&self, at: i64) {
        self.with_conn("set_last_sync_at", (), |conn| {
            Self::meta_set_tx(conn, META_LAST_SYNC, &at.to_string())
        })
        .await
    }

    /// Cached session-user id, kept so unread counters and offline reads
    /// work with no network at all.
    pub async fn session_user(&self) -> Option<String> {
        self.with_conn("session_user", None, |conn| {
            Self::meta_get_tx(conn, META_SESSION_USER)
        })
        .await
    }

    pub async fn set_session_user(&self, user_id: &str) {
        self.with_conn("set_session_user", (), |conn| {
            Self::meta_set_tx(conn, META_SESSION_USER, user_id)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Wipe every collection.  Only called on explicit logout/reset.
    pub async fn clear_all(&self) {
        self.with_conn("clear_all", (), |conn| {
            conn.execute_batch(
                "DELETE FROM messages;
                 DELETE FROM conversations;
                 DELETE FROM contacts;
                 DELETE FROM assistant_messages;
                 DELETE FROM sync_meta;",
            )?;
            Ok(())
        })
        .await
    }

    /// Per-collection counts plus the last sync timestamp, for diagnostics.
    pub async fn stats(&self) -> StoreStats {
        self.with_conn("stats", StoreStats::default(), |conn| {
            let count = |table: &str| -> Result<u64, StoreError> {
                Ok(conn.query_row(
                    &format!("SELECT COUNT(*) FROM {table}"),
                    [],
                    |row| row.get::<_, i64>(0),
                )? as u64)
            };
            Ok(StoreStats {
                messages: count("messages")?,
                conversations: count("conversations")?,
                contacts: count("contacts")?,
                assistant_messages: count("assistant_messages")?,
                meta_entries: count("sync_meta")?,
                last_sync_at: Self::meta_get_tx(conn, META_LAST_SYNC)?
                    .and_then(|v| v.parse().ok()),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, sender: &str, recipient: &str, created_at: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: String::new(),
            sender_id: sender.to_string(),
            recipient_id: recipient.to_string(),
            body: Some(format!("body of {id}")),
            created_at,
            read_at: None,
            delivered_at: None,
            edited_at: None,
            deleted_at: None,
            thread: ThreadKind::Direct,
            reactions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn schema_and_meta_round_trip() {
        let store = LocalStore::open_in_memory().unwrap();
        assert!(store.cursor("messages").await.is_none());
        store.set_cursor("messages", "abc").await;
        assert_eq!(store.cursor("messages").await.as_deref(), Some("abc"));

        store.set_last_sync_at(1234).await;
        assert_eq!(store.last_sync_at().await, Some(1234));

        store.set_session_user("u1").await;
        assert_eq!(store.session_user().await.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn conversation_summary_tracks_messages() {
        let store = LocalStore::open_in_memory().unwrap();
        store.set_session_user("u1").await;
        store.put_message(&msg("m1", "u2", "u1", 100)).await;
        store.put_message(&msg("m2", "u2", "u1", 200)).await;

        let conv = store.conversation("u1:u2").await.unwrap();
        assert_eq!(conv.last_message_at, 200);
        assert_eq!(conv.unread, 2);
        assert_eq!(conv.participant_a, "u1");
        assert_eq!(conv.participant_b, "u2");

        store.mark_message_read("m1", 250).await;
        let conv = store.conversation("u1:u2").await.unwrap();
        assert_eq!(conv.unread, 1);
    }

    #[tokio::test]
    async fn own_messages_do_not_count_as_unread() {
        let store = LocalStore::open_in_memory().unwrap();
        store.set_session_user("u1").await;
        store.put_message(&msg("m1", "u1", "u2", 100)).await;
        let conv = store.conversation("u1:u2").await.unwrap();
        assert_eq!(conv.unread, 0);
    }

    #[tokio::test]
    async fn tombstone_keeps_ordering_fields() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put_message(&msg("m1", "u1", "u2", 100)).await;
        store.put_message(&msg("m2", "u1", "u2", 200)).await;
        store.mark_message_deleted("m1", 300).await;

        let stored = store.message("m1").await.unwrap();
        assert!(stored.body.is_none());
        assert_eq!(stored.deleted_at, Some(300));
        assert_eq!(stored.created_at, 100);

        // Tombstones keep their position in ordering queries.
        let all = store.conversation_messages("u1:u2").await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "m1");
    }

    #[tokio::test]
    async fn reactions_converge_on_replay() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put_message(&msg("m1", "u1", "u2", 100)).await;
        store.apply_reaction("m1", "u2", "👍", true).await;
        store.apply_reaction("m1", "u2", "👍", true).await;
        let stored = store.message("m1").await.unwrap();
        assert_eq!(stored.reactions.len(), 1);

        store.apply_reaction("m1", "u2", "👍", false).await;
        let stored = store.message("m1").await.unwrap();
        assert!(stored.reactions.is_empty());

        // Reacting to an unknown message is a no-op, not an error.
        store.apply_reaction("nope", "u2", "👍", true).await;
    }

    #[tokio::test]
    async fn assistant_collection_is_separate() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put_message(&msg("m1", "u1", "u2", 100)).await;
        store
            .put_assistant_message(&AssistantMessage {
                id: "a1".to_string(),
                sender_id: "u1".to_string(),
                body: Some("ask".to_string()),
                created_at: 50,
                read_at: None,
                edited_at: None,
                deleted_at: None,
            })
            .await;

        let stats = store.stats().await;
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.assistant_messages, 1);
        assert_eq!(store.assistant_messages().await.len(), 1);
        // Assistant volume never shows up in direct-message queries.
        assert!(store.conversation_messages("assistant").await.is_empty());
    }
}
