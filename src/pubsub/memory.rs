//! In-process pub/sub for the in-memory deployment.
//!
//! There is only one instance, so "fan-out" is a handler map and a direct
//! call. Keeps the facade's wiring identical across backends.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::PubSubError;
use crate::pubsub::{ChannelHandler, PubSub};

/// Process-local pub/sub transport.
#[derive(Default)]
pub struct InProcessPubSub {
    handlers: RwLock<HashMap<String, ChannelHandler>>,
}

impl InProcessPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSub for InProcessPubSub {
    async fn subscribe(&self, channel: &str, handler: ChannelHandler) -> Result<(), PubSubError> {
        let mut handlers = self.handlers.write().await;
        handlers.insert(channel.to_string(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), PubSubError> {
        let mut handlers = self.handlers.write().await;
        handlers.remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(channel).cloned()
        };
        if let Some(handler) = handler {
            handler(payload.to_string());
        }
        Ok(())
    }
}
