//! The pickup repository facade.
//!
//! Implements the queue contract the external agent runtime consumes
//! (add/take/count/remove) and owns the delivery decision for every new
//! message: hand it to a local live session, wake the instance that holds
//! one, or fall back to a push notification. Session lifecycle events from
//! the runtime keep the local registry, the store's live-session table, and
//! the wake-up subscriptions in step.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{StoreBackend, WaystationConfig};
use crate::error::{PickupError, RuntimeError};
use crate::notify::{HttpNotificationSender, NotificationSender};
use crate::pubsub::{
    InProcessPubSub, PostgresPubSub, PubSub, RedisPubSub, WakeupHandler, Wakeups,
};
use crate::sessions::LiveSessionRegistry;
use crate::store::{
    InMemoryStore, MessageState, PickupStore, PostgresStore, QueuedMessage, RedisStore,
};

/// Capabilities the external mediator runtime provides to this subsystem.
///
/// Everything behind this trait is an external collaborator: wire delivery
/// over the actual session transport and the connection records that hold
/// device push tokens.
#[async_trait]
pub trait MediatorRuntime: Send + Sync {
    /// Push token registered for the device behind a connection, if any.
    async fn find_push_token(&self, connection_id: &str)
    -> Result<Option<String>, RuntimeError>;

    /// Hand messages to an open live session for wire delivery. The
    /// runtime confirms receipt out-of-band; the caller then removes them.
    async fn deliver_live(
        &self,
        session_id: &str,
        messages: Vec<QueuedMessage>,
    ) -> Result<(), RuntimeError>;

    /// Ask the holder of a live session to drain the queue through its
    /// live delivery path.
    async fn deliver_from_queue(&self, session_id: &str) -> Result<(), RuntimeError>;
}

/// Orchestrates the queue store, session registry, wake-up coordinator, and
/// push fallback behind the four-operation queue contract.
pub struct PickupRepository {
    store: Arc<dyn PickupStore>,
    registry: Arc<LiveSessionRegistry>,
    wakeups: Arc<Wakeups>,
    notifier: Option<Arc<dyn NotificationSender>>,
    runtime: Arc<dyn MediatorRuntime>,
    instance: String,
}

impl PickupRepository {
    pub fn new(
        store: Arc<dyn PickupStore>,
        registry: Arc<LiveSessionRegistry>,
        wakeups: Arc<Wakeups>,
        notifier: Option<Arc<dyn NotificationSender>>,
        runtime: Arc<dyn MediatorRuntime>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            wakeups,
            notifier,
            runtime,
            instance: instance.into(),
        }
    }

    /// Assemble a repository from configuration: backend-matched store and
    /// wake-up transport, plus the push sender when one is configured.
    pub async fn from_config(
        config: &WaystationConfig,
        runtime: Arc<dyn MediatorRuntime>,
    ) -> Result<Self, PickupError> {
        let store: Arc<dyn PickupStore> = match config.backend {
            StoreBackend::Memory => Arc::new(InMemoryStore::new()),
            StoreBackend::Postgres => Arc::new(PostgresStore::new(&config.postgres)?),
            StoreBackend::Redis => Arc::new(RedisStore::connect(&config.redis).await?),
        };
        let transport: Arc<dyn PubSub> = match config.backend {
            StoreBackend::Memory => Arc::new(InProcessPubSub::new()),
            StoreBackend::Postgres => Arc::new(PostgresPubSub::connect(&config.postgres).await?),
            StoreBackend::Redis => Arc::new(RedisPubSub::connect(&config.redis).await?),
        };
        let notifier: Option<Arc<dyn NotificationSender>> = config
            .push
            .as_ref()
            .map(|push| Arc::new(HttpNotificationSender::new(push)) as Arc<dyn NotificationSender>);

        Ok(Self::new(
            store,
            Arc::new(LiveSessionRegistry::new()),
            Arc::new(Wakeups::new(transport, config.topology)),
            notifier,
            runtime,
            config.instance.clone(),
        ))
    }

    /// Bootstrap the store, clear this instance's stale live-session rows,
    /// and start the wake-up subscription.
    pub async fn initialize(&self) -> Result<(), PickupError> {
        self.store.initialize().await?;
        self.store.clear_instance_sessions(&self.instance).await?;
        self.wakeups.start(self.wakeup_handler()).await?;
        tracing::info!("pickup repository initialized as instance {}", self.instance);
        Ok(())
    }

    /// Queue a message and get it moving: local live delivery when this
    /// instance holds the session, a wake-up hint when another instance
    /// does, a push notification when nobody does.
    pub async fn add_message(
        &self,
        connection_id: &str,
        recipient_dids: &[String],
        payload: serde_json::Value,
    ) -> Result<Uuid, PickupError> {
        let local_session = self.registry.get(connection_id).await;
        let (message_id, received_at) = self
            .store
            .add_message(connection_id, recipient_dids, &payload, local_session.is_some())
            .await?;
        tracing::debug!("queued message {} for {}", message_id, connection_id);

        if let Some(session_id) = local_session {
            // We hold the socket; skip pub/sub and deliver straight away.
            let message = QueuedMessage {
                id: message_id,
                connection_id: connection_id.to_string(),
                recipient_dids: recipient_dids.to_vec(),
                encrypted_message: payload,
                state: MessageState::Sending,
                created_at: received_at,
            };
            self.runtime.deliver_live(&session_id, vec![message]).await?;
        } else if self.store.find_live_session(connection_id).await?.is_some() {
            // Another instance holds the session; a lost hint is fine, the
            // message is durable and goes out on the next poll.
            if let Err(e) = self.wakeups.notify(connection_id).await {
                tracing::warn!("wake-up publish for {} failed: {}", connection_id, e);
            }
        } else {
            self.push_notify(connection_id, &message_id.to_string()).await;
        }

        Ok(message_id)
    }

    /// Serve an explicit pickup poll. No session awareness: the store
    /// reserves (or deletes) and returns, oldest first.
    pub async fn take_from_queue(
        &self,
        connection_id: &str,
        limit: Option<usize>,
        delete_messages: bool,
        recipient_did: Option<&str>,
    ) -> Result<Vec<QueuedMessage>, PickupError> {
        let messages = self
            .store
            .take_messages(connection_id, limit, delete_messages, recipient_did)
            .await?;
        tracing::debug!(
            "take_from_queue returned {} message(s) for {}",
            messages.len(),
            connection_id
        );
        Ok(messages)
    }

    /// Pending messages awaiting pickup, matched the same way as
    /// [`take_from_queue`](PickupRepository::take_from_queue). In-flight
    /// messages don't count.
    pub async fn available_message_count(
        &self,
        connection_id: &str,
        recipient_did: Option<&str>,
    ) -> Result<usize, PickupError> {
        Ok(self.store.pending_count(connection_id, recipient_did).await?)
    }

    /// Delete messages whose receipt the client confirmed. Idempotent, and
    /// an explicit no-op on empty input.
    pub async fn remove_messages(
        &self,
        connection_id: &str,
        message_ids: &[Uuid],
    ) -> Result<(), PickupError> {
        if message_ids.is_empty() {
            tracing::debug!("remove_messages for {} with no ids, nothing to do", connection_id);
            return Ok(());
        }
        self.store.remove_messages(connection_id, message_ids).await?;
        Ok(())
    }

    /// The runtime reported a live session established for a connection.
    pub async fn on_live_session_saved(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<(), PickupError> {
        tracing::info!("live session {} saved for {}", session_id, connection_id);
        if let Some(old) = self.registry.register(connection_id, session_id).await {
            tracing::debug!("superseded local session {} for {}", old, connection_id);
        }
        self.store
            .save_live_session(session_id, connection_id, &self.instance)
            .await?;
        if let Err(e) = self.wakeups.watch(connection_id).await {
            tracing::warn!("wake-up subscription for {} failed: {}", connection_id, e);
        }
        Ok(())
    }

    /// The runtime reported a live session closed for a connection.
    pub async fn on_live_session_removed(&self, connection_id: &str) -> Result<(), PickupError> {
        tracing::info!("live session removed for {}", connection_id);
        self.registry.unregister(connection_id).await;
        // Requeue before dropping the record: messages reserved by the
        // dead session must become redeliverable.
        self.store.requeue_in_flight(connection_id).await?;
        self.store.remove_live_session(connection_id).await?;
        if let Err(e) = self.wakeups.unwatch(connection_id).await {
            tracing::warn!("wake-up unsubscribe for {} failed: {}", connection_id, e);
        }
        Ok(())
    }

    /// Wake-up dispatch: if this instance holds the named connection's live
    /// session, drain the queue through it. In fixed-channel mode every
    /// instance hears every hint, so "not ours" is the common case.
    fn wakeup_handler(&self) -> WakeupHandler {
        let registry = Arc::clone(&self.registry);
        let runtime = Arc::clone(&self.runtime);
        Arc::new(move |connection_id: String| {
            let registry = Arc::clone(&registry);
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                let Some(session_id) = registry.get(&connection_id).await else {
                    tracing::trace!("no local live session for {}, ignoring wake-up", connection_id);
                    return;
                };
                tracing::debug!(
                    "wake-up for {}: delivering queued messages via session {}",
                    connection_id,
                    session_id
                );
                if let Err(e) = runtime.deliver_from_queue(&session_id).await {
                    tracing::warn!("queued delivery for {} failed: {}", connection_id, e);
                }
            });
        })
    }

    /// Best-effort push. Token lookup and send failures are logged and
    /// swallowed; the message stays queued either way.
    async fn push_notify(&self, connection_id: &str, message_id: &str) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if !notifier.is_enabled() {
            tracing::debug!("push sender disabled, message for {} stays queued", connection_id);
            return;
        }

        let token = match self.runtime.find_push_token(connection_id).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("push token lookup for {} failed: {}", connection_id, e);
                return;
            }
        };
        let Some(token) = token else {
            tracing::debug!("no push token for {}, message stays queued", connection_id);
            return;
        };

        if let Err(e) = notifier.send(&token, message_id).await {
            tracing::warn!("push notification for {} failed: {}", connection_id, e);
        }
    }
}
