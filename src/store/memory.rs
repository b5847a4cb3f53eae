//! Non-durable, single-process queue store.
//!
//! Everything lives behind one lock, which also gives the reserve step its
//! atomicity: two concurrent takes cannot see the same pending message.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StorageError;
use crate::store::{LiveSessionRecord, MessageState, PickupStore, QueuedMessage};

#[derive(Default)]
struct State {
    messages: Vec<QueuedMessage>,
    live_sessions: HashMap<String, LiveSessionRecord>,
}

/// In-memory queue store for tests and single-instance deployments.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches(msg: &QueuedMessage, connection_id: &str, recipient_did: Option<&str>) -> bool {
    msg.connection_id == connection_id
        || recipient_did.is_some_and(|did| msg.recipient_dids.iter().any(|d| d == did))
}

#[async_trait]
impl PickupStore for InMemoryStore {
    async fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn add_message(
        &self,
        connection_id: &str,
        recipient_dids: &[String],
        payload: &serde_json::Value,
        has_local_session: bool,
    ) -> Result<(Uuid, DateTime<Utc>), StorageError> {
        let mut state = self.state.write().await;
        // Stamped under the lock, so Vec order always equals timestamp
        // order and the FIFO sort never disagrees with insertion order.
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        state.messages.push(QueuedMessage {
            id,
            connection_id: connection_id.to_string(),
            recipient_dids: recipient_dids.to_vec(),
            encrypted_message: payload.clone(),
            state: if has_local_session {
                MessageState::Sending
            } else {
                MessageState::Pending
            },
            created_at,
        });

        Ok((id, created_at))
    }

    async fn take_messages(
        &self,
        connection_id: &str,
        limit: Option<usize>,
        delete: bool,
        recipient_did: Option<&str>,
    ) -> Result<Vec<QueuedMessage>, StorageError> {
        let mut state = self.state.write().await;

        let mut picked: Vec<usize> = state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, msg)| {
                msg.state == MessageState::Pending && matches(msg, connection_id, recipient_did)
            })
            .map(|(idx, _)| idx)
            .collect();
        picked.sort_by(|&a, &b| {
            let (ma, mb) = (&state.messages[a], &state.messages[b]);
            ma.created_at.cmp(&mb.created_at).then(ma.id.cmp(&mb.id))
        });
        if let Some(limit) = limit {
            picked.truncate(limit);
        }

        let mut taken = Vec::with_capacity(picked.len());
        for &idx in &picked {
            if !delete {
                state.messages[idx].state = MessageState::Sending;
            }
            taken.push(state.messages[idx].clone());
        }
        if delete {
            // Remove by id, not by saved index: indexes sorted by the FIFO
            // key are not guaranteed to be ascending Vec positions.
            let picked_ids: HashSet<Uuid> = taken.iter().map(|msg| msg.id).collect();
            state.messages.retain(|msg| !picked_ids.contains(&msg.id));
        }

        Ok(taken)
    }

    async fn pending_count(
        &self,
        connection_id: &str,
        recipient_did: Option<&str>,
    ) -> Result<usize, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .filter(|msg| {
                msg.state == MessageState::Pending && matches(msg, connection_id, recipient_did)
            })
            .count())
    }

    async fn remove_messages(
        &self,
        connection_id: &str,
        message_ids: &[Uuid],
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        state
            .messages
            .retain(|msg| !(msg.connection_id == connection_id && message_ids.contains(&msg.id)));
        Ok(())
    }

    async fn requeue_in_flight(&self, connection_id: &str) -> Result<u64, StorageError> {
        let mut state = self.state.write().await;
        let mut moved = 0;
        for msg in state
            .messages
            .iter_mut()
            .filter(|msg| msg.connection_id == connection_id && msg.state == MessageState::Sending)
        {
            msg.state = MessageState::Pending;
            moved += 1;
        }
        Ok(moved)
    }

    async fn find_live_session(
        &self,
        connection_id: &str,
    ) -> Result<Option<LiveSessionRecord>, StorageError> {
        let state = self.state.read().await;
        Ok(state.live_sessions.get(connection_id).cloned())
    }

    async fn save_live_session(
        &self,
        session_id: &str,
        connection_id: &str,
        instance: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        // Insert replaces: the most recent session wins.
        state.live_sessions.insert(
            connection_id.to_string(),
            LiveSessionRecord {
                session_id: session_id.to_string(),
                connection_id: connection_id.to_string(),
                instance: instance.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn remove_live_session(&self, connection_id: &str) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        state.live_sessions.remove(connection_id);
        Ok(())
    }

    async fn clear_instance_sessions(&self, instance: &str) -> Result<u64, StorageError> {
        let mut state = self.state.write().await;
        let before = state.live_sessions.len();
        state.live_sessions.retain(|_, rec| rec.instance != instance);
        Ok((before - state.live_sessions.len()) as u64)
    }
}
