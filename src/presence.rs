//! Ephemeral online/typing awareness.
//!
//! Nothing here is persisted and none of it is authoritative history: the
//! tracker is rebuilt wholesale from the next `presence:bulk` snapshot
//! after a reconnect.  Typing indicators expire client-side because an
//! explicit stop event is not guaranteed to arrive.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::wire::{WirePresence, WirePresenceBulk, WireTyping};

/// How long a typing indicator survives without a refresh.
pub const TYPING_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Online,
    Away,
    Offline,
}

/// The last known state for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPresence {
    pub state: PresenceState,
    pub last_seen_at: i64,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, UserPresence>,
    // conversation id → user id → last typing signal
    typing: HashMap<String, HashMap<String, Instant>>,
}

/// In-memory presence map, safe to update from transport handler callbacks.
/// The lock is never held across an await point.
pub struct PresenceTracker {
    inner: Mutex<Inner>,
    typing_ttl: Duration,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            typing_ttl: TYPING_TTL,
        }
    }

    /// Tracker with a custom typing expiry, for tests.
    pub fn with_typing_ttl(typing_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            typing_ttl,
        }
    }

    /// Apply a single presence update.
    pub fn apply_presence(&self, update: &WirePresence) {
        let mut inner = self.inner.lock().unwrap();
        inner.users.insert(
            update.user_id.clone(),
            UserPresence {
                state: update.state,
                last_seen_at: update.last_seen_at,
            },
        );
    }

    /// Replace all tracked user state with a full snapshot.  Typing state
    /// is left alone; it expires on its own schedule.
    pub fn apply_snapshot(&self, snapshot: &WirePresenceBulk) {
        let mut inner = self.inner.lock().unwrap();
        inner.users.clear();
        for update in &snapshot.users {
            inner.users.insert(
                update.user_id.clone(),
                UserPresence {
                    state: update.state,
                    last_seen_at: update.last_seen_at,
                },
            );
        }
    }

    /// Apply a typing indicator.  A stop removes the entry immediately;
    /// a start (re)arms the expiry clock.
    pub fn apply_typing(&self, typing: &WireTyping) {
        let mut inner = self.inner.lock().unwrap();
        if typing.is_typing {
            inner
                .typing
                .entry(typing.conversation_id.clone())
                .or_default()
                .insert(typing.user_id.clone(), Instant::now());
        } else if let Some(users) = inner.typing.get_mut(&typing.conversation_id) {
            users.remove(&typing.user_id);
        }
    }

    /// Users currently typing in a conversation, expired entries pruned.
    pub fn typing_in(&self, conversation_id: &str) -> Vec<String> {
        let ttl = self.typing_ttl;
        let mut inner = self.inner.lock().unwrap();
        let Some(users) = inner.typing.get_mut(conversation_id) else {
            return Vec::new();
        };
        users.retain(|_, seen| seen.elapsed() < ttl);
        let mut out: Vec<String> = users.keys().cloned().collect();
        out.sort();
        out
    }

    /// Last known presence for a user, if any update has been seen.
    pub fn user_state(&self, user_id: &str) -> Option<UserPresence> {
        self.inner.lock().unwrap().users.get(user_id).copied()
    }

    /// Drop everything.  Called on disconnect so the next snapshot is the
    /// sole source of truth.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.users.clear();
        inner.typing.clear();
    }
}
