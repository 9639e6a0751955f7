//! tidemark: offline-first message synchronization for the portal.
//!
//! Keeps a device's local replica of conversations (direct messages and the
//! AI-assistant thread) converging with the server under intermittent
//! connectivity, duplicate and out-of-order delivery, and reconnection.
//! The composing application owns the pieces and wires them together:
//!
//! - [`store::LocalStore`]: durable SQLite replica, queried by the UI.
//! - [`transport::TransportClient`]: one auto-healing push connection.
//! - [`presence::PresenceTracker`]: ephemeral online/typing state.
//! - [`sync::SyncCoordinator`]: backfill catch-up plus live application.

pub mod logging;
pub mod presence;
pub mod records;
pub mod store;
pub mod sync;
pub mod transport;
pub mod wire;
