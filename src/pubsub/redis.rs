//! Wake-up transport on Redis pub/sub.
//!
//! One pub/sub connection split into a sink (subscribe/unsubscribe) and a
//! message stream consumed by a background task; publishing goes through a
//! regular multiplexed connection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::{MultiplexedConnection, PubSubSink};
use tokio::sync::{Mutex, RwLock};

use crate::config::RedisConfig;
use crate::error::PubSubError;
use crate::pubsub::{ChannelHandler, PubSub};

/// Redis SUBSCRIBE/PUBLISH transport.
pub struct RedisPubSub {
    publish_conn: MultiplexedConnection,
    sink: Mutex<PubSubSink>,
    handlers: Arc<RwLock<HashMap<String, ChannelHandler>>>,
}

impl RedisPubSub {
    /// Open the pub/sub and publish connections and start the receive loop.
    pub async fn connect(config: &RedisConfig) -> Result<Self, PubSubError> {
        let client = redis::Client::open(config.url.as_str())?;
        let publish_conn = client.get_multiplexed_async_connection().await?;
        let (sink, mut stream) = client.get_async_pubsub().await?.split();

        let handlers: Arc<RwLock<HashMap<String, ChannelHandler>>> = Arc::default();
        let dispatch = Arc::clone(&handlers);

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = msg.get_payload().unwrap_or_default();
                let handler = {
                    let handlers = dispatch.read().await;
                    handlers.get(&channel).cloned()
                };
                if let Some(handler) = handler {
                    handler(payload);
                }
            }
            tracing::warn!("redis pub/sub stream closed");
        });

        Ok(Self {
            publish_conn,
            sink: Mutex::new(sink),
            handlers,
        })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn subscribe(&self, channel: &str, handler: ChannelHandler) -> Result<(), PubSubError> {
        {
            let mut handlers = self.handlers.write().await;
            handlers.insert(channel.to_string(), handler);
        }
        let mut sink = self.sink.lock().await;
        sink.subscribe(channel).await?;
        tracing::debug!("subscribed to redis channel {}", channel);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), PubSubError> {
        {
            let mut sink = self.sink.lock().await;
            sink.unsubscribe(channel).await?;
        }
        let mut handlers = self.handlers.write().await;
        handlers.remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError> {
        let mut conn = self.publish_conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }
}
