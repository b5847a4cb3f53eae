//! Queue store: durable per-recipient message queues and cross-instance
//! live-session records.
//!
//! One contract, three backends. Each backend owns its connection lifecycle
//! and schema bootstrap; all of them satisfy the same conformance suite
//! (`tests/store_conformance.rs`). The in-memory backend is exempt only from
//! cross-instance guarantees, trivially, because it has no other instances.

mod memory;
mod postgres;
mod redis;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

/// Delivery state of a queued message.
///
/// `Sending` covers both "handed to a live session" and "reserved by a
/// pickup poll awaiting client confirmation". The two share the single
/// recovery transition back to `Pending`, so the store treats them as one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Pending,
    Sending,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Pending => "pending",
            MessageState::Sending => "sending",
        }
    }
}

impl std::str::FromStr for MessageState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageState::Pending),
            "sending" => Ok(MessageState::Sending),
            other => Err(StorageError::Backend {
                reason: format!("unknown message state '{}'", other),
            }),
        }
    }
}

/// A message queued for a recipient.
///
/// The payload is an opaque encrypted envelope; the store never inspects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    /// Logical recipient, stable across reconnections.
    pub connection_id: String,
    /// Recipient key identifiers the envelope is addressed to.
    pub recipient_dids: Vec<String>,
    pub encrypted_message: serde_json::Value,
    pub state: MessageState,
    /// Assigned at enqueue; doubles as `received_at` and as the FIFO key.
    pub created_at: DateTime<Utc>,
}

/// A live delivery session as seen across instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSessionRecord {
    pub session_id: String,
    pub connection_id: String,
    /// Process instance holding the socket.
    pub instance: String,
    pub created_at: DateTime<Utc>,
}

/// Contract every queue store backend satisfies.
///
/// Same-connection reservation is serialized inside the backend: the reserve
/// step of [`take_messages`](PickupStore::take_messages) is a single atomic
/// select-then-update, never a read-then-write race.
#[async_trait]
pub trait PickupStore: Send + Sync {
    /// Connect and bootstrap schema/indexes. Idempotent.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Insert a message. State starts as `Sending` when the caller already
    /// holds a local live session for the recipient, `Pending` otherwise.
    ///
    /// On error the caller must not assume the message was persisted:
    /// at-least-once, ids are invisible until success, retrying is safe.
    async fn add_message(
        &self,
        connection_id: &str,
        recipient_dids: &[String],
        payload: &serde_json::Value,
        has_local_session: bool,
    ) -> Result<(Uuid, DateTime<Utc>), StorageError>;

    /// Pending messages for the connection (or, when `recipient_did` is
    /// given, also any message addressed to that key), oldest first, capped
    /// by `limit`.
    ///
    /// With `delete` false the returned messages are reserved (flipped to
    /// `Sending`); they return to `Pending` only through
    /// [`requeue_in_flight`](PickupStore::requeue_in_flight). With `delete`
    /// true they are removed immediately (receipt already confirmed
    /// out-of-band).
    async fn take_messages(
        &self,
        connection_id: &str,
        limit: Option<usize>,
        delete: bool,
        recipient_did: Option<&str>,
    ) -> Result<Vec<QueuedMessage>, StorageError>;

    /// Number of `Pending` messages matching the connection (or, when
    /// `recipient_did` is given, also that key). Never counts `Sending`.
    async fn pending_count(
        &self,
        connection_id: &str,
        recipient_did: Option<&str>,
    ) -> Result<usize, StorageError>;

    /// Delete the given messages. Idempotent; unknown ids are a no-op.
    async fn remove_messages(
        &self,
        connection_id: &str,
        message_ids: &[Uuid],
    ) -> Result<(), StorageError>;

    /// Bulk `Sending → Pending` for a connection, so messages reserved by a
    /// torn-down session become redeliverable. Returns how many moved.
    async fn requeue_in_flight(&self, connection_id: &str) -> Result<u64, StorageError>;

    /// The authoritative live session for a connection, if any instance
    /// holds one. When duplicates exist the most recent wins.
    async fn find_live_session(
        &self,
        connection_id: &str,
    ) -> Result<Option<LiveSessionRecord>, StorageError>;

    /// Record a live session held by `instance`.
    async fn save_live_session(
        &self,
        session_id: &str,
        connection_id: &str,
        instance: &str,
    ) -> Result<(), StorageError>;

    /// Drop the live-session record for a connection. No-op when absent.
    async fn remove_live_session(&self, connection_id: &str) -> Result<(), StorageError>;

    /// Startup reconciliation: drop every live-session record tagged with
    /// `instance`. Clears rows left behind by an ungraceful crash of this
    /// instance without touching sessions other instances hold.
    async fn clear_instance_sessions(&self, instance: &str) -> Result<u64, StorageError>;
}
