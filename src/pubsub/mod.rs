//! Pub/sub wake-up coordination between mediator instances.
//!
//! The instance that enqueues a message is not always the instance holding
//! the recipient's live session. Wake-ups bridge that gap: a bare hint on a
//! channel, telling whichever instance holds the session to drain the queue
//! through its live delivery path. Message bytes never travel here; a lost
//! wake-up only delays delivery until the next pickup poll.
//!
//! The transport trait is implemented per storage engine (in-process
//! dispatch, Postgres LISTEN/NOTIFY, Redis pub/sub); [`Wakeups`] layers the
//! deployment-selected channel topology on top.

mod memory;
mod postgres;
mod redis;

pub use memory::InProcessPubSub;
pub use postgres::PostgresPubSub;
pub use redis::RedisPubSub;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::PubSubTopology;
use crate::error::PubSubError;

/// Called with the payload of each message arriving on a subscribed channel.
pub type ChannelHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Called with the `connection_id` a wake-up is for.
pub type WakeupHandler = Arc<dyn Fn(String) + Send + Sync>;

/// A named-channel pub/sub transport.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Deliver messages on `channel` to `handler` until unsubscribed.
    async fn subscribe(&self, channel: &str, handler: ChannelHandler) -> Result<(), PubSubError>;

    /// Stop listening on `channel`. No-op when not subscribed.
    async fn unsubscribe(&self, channel: &str) -> Result<(), PubSubError>;

    /// Publish `payload` to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError>;
}

/// Shared channel used in fixed-channel mode.
const FIXED_CHANNEL: &str = "waystation.pickup";

fn connection_channel(connection_id: &str) -> String {
    format!("waystation.pickup.{}", connection_id)
}

/// Wake-up coordinator: maps connection ids onto channels according to the
/// configured topology.
///
/// Per-connection mode subscribes one channel per live session (no false
/// wake-ups, churn on connect/disconnect). Fixed-channel mode subscribes
/// once at startup and every instance checks locally whether it holds the
/// named session (O(1) subscriptions, O(instances) fan-out).
pub struct Wakeups {
    transport: Arc<dyn PubSub>,
    topology: PubSubTopology,
    handler: RwLock<Option<WakeupHandler>>,
}

impl Wakeups {
    pub fn new(transport: Arc<dyn PubSub>, topology: PubSubTopology) -> Self {
        Self {
            transport,
            topology,
            handler: RwLock::new(None),
        }
    }

    /// Register the handler wake-ups are dispatched to. In fixed-channel
    /// mode this also opens the one shared subscription.
    pub async fn start(&self, handler: WakeupHandler) -> Result<(), PubSubError> {
        *self.handler.write().await = Some(Arc::clone(&handler));

        if self.topology == PubSubTopology::FixedChannel {
            tracing::debug!("subscribing to fixed wake-up channel {}", FIXED_CHANNEL);
            // The payload names the connection the wake-up is for.
            self.transport
                .subscribe(FIXED_CHANNEL, Arc::new(move |payload| handler(payload)))
                .await?;
        }
        Ok(())
    }

    /// Begin listening for wake-ups for a connection. Called when this
    /// instance saves a live session; a no-op in fixed-channel mode.
    pub async fn watch(&self, connection_id: &str) -> Result<(), PubSubError> {
        if self.topology != PubSubTopology::PerConnection {
            return Ok(());
        }
        let handler = self
            .handler
            .read()
            .await
            .clone()
            .ok_or(PubSubError::NotStarted)?;

        let connection = connection_id.to_string();
        self.transport
            .subscribe(
                &connection_channel(connection_id),
                // The channel itself names the connection; payload is empty.
                Arc::new(move |_payload| handler(connection.clone())),
            )
            .await
    }

    /// Release the subscription for a connection. Called when this
    /// instance's live session goes away; a no-op in fixed-channel mode.
    pub async fn unwatch(&self, connection_id: &str) -> Result<(), PubSubError> {
        if self.topology != PubSubTopology::PerConnection {
            return Ok(());
        }
        self.transport
            .unsubscribe(&connection_channel(connection_id))
            .await
    }

    /// Publish a wake-up hint for a connection.
    pub async fn notify(&self, connection_id: &str) -> Result<(), PubSubError> {
        match self.topology {
            PubSubTopology::PerConnection => {
                self.transport
                    .publish(&connection_channel(connection_id), "")
                    .await
            }
            PubSubTopology::FixedChannel => {
                self.transport.publish(FIXED_CHANNEL, connection_id).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_handler() -> (WakeupHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: WakeupHandler = Arc::new(move |connection_id| {
            sink.lock().unwrap().push(connection_id);
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn test_per_connection_wakeup_reaches_watcher() {
        let wakeups = Wakeups::new(
            Arc::new(InProcessPubSub::new()),
            PubSubTopology::PerConnection,
        );
        let (handler, seen) = recording_handler();
        wakeups.start(handler).await.unwrap();
        wakeups.watch("c1").await.unwrap();

        wakeups.notify("c1").await.unwrap();
        wakeups.notify("c2").await.unwrap(); // nobody watches c2

        assert_eq!(*seen.lock().unwrap(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_per_connection_unwatch_stops_delivery() {
        let wakeups = Wakeups::new(
            Arc::new(InProcessPubSub::new()),
            PubSubTopology::PerConnection,
        );
        let (handler, seen) = recording_handler();
        wakeups.start(handler).await.unwrap();
        wakeups.watch("c1").await.unwrap();
        wakeups.unwatch("c1").await.unwrap();

        wakeups.notify("c1").await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fixed_channel_carries_connection_in_payload() {
        let wakeups = Wakeups::new(
            Arc::new(InProcessPubSub::new()),
            PubSubTopology::FixedChannel,
        );
        let (handler, seen) = recording_handler();
        wakeups.start(handler).await.unwrap();
        // No watch() needed in fixed mode.

        wakeups.notify("c7").await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["c7".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_before_start_is_an_error() {
        let wakeups = Wakeups::new(
            Arc::new(InProcessPubSub::new()),
            PubSubTopology::PerConnection,
        );
        assert!(matches!(
            wakeups.watch("c1").await,
            Err(PubSubError::NotStarted)
        ));
    }
}
