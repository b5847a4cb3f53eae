//! Wake-up transport on Postgres LISTEN/NOTIFY.
//!
//! Notifications only reach the connection that issued LISTEN, so this
//! transport keeps one dedicated connection for listening (its driver runs
//! in a background task) and publishes through the same client with
//! `pg_notify`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_postgres::{AsyncMessage, NoTls};

use crate::config::PostgresConfig;
use crate::error::PubSubError;
use crate::pubsub::{ChannelHandler, PubSub};

/// Postgres LISTEN/NOTIFY transport.
pub struct PostgresPubSub {
    client: tokio_postgres::Client,
    handlers: Arc<RwLock<HashMap<String, ChannelHandler>>>,
}

impl PostgresPubSub {
    /// Open the dedicated listen connection and start its driver.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, PubSubError> {
        let (client, mut connection) = tokio_postgres::connect(&config.url, NoTls).await?;

        let handlers: Arc<RwLock<HashMap<String, ChannelHandler>>> = Arc::default();
        let dispatch = Arc::clone(&handlers);

        tokio::spawn(async move {
            let mut messages =
                futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(item) = messages.next().await {
                match item {
                    Ok(AsyncMessage::Notification(notification)) => {
                        let handler = {
                            let handlers = dispatch.read().await;
                            handlers.get(notification.channel()).cloned()
                        };
                        if let Some(handler) = handler {
                            handler(notification.payload().to_string());
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("postgres pub/sub connection lost: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self { client, handlers })
    }
}

/// LISTEN/UNLISTEN take an identifier, not a parameter; quote it.
fn quote_ident(channel: &str) -> String {
    format!("\"{}\"", channel.replace('"', "\"\""))
}

#[async_trait]
impl PubSub for PostgresPubSub {
    async fn subscribe(&self, channel: &str, handler: ChannelHandler) -> Result<(), PubSubError> {
        {
            let mut handlers = self.handlers.write().await;
            handlers.insert(channel.to_string(), handler);
        }
        self.client
            .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
            .await?;
        tracing::debug!("listening on postgres channel {}", channel);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), PubSubError> {
        self.client
            .batch_execute(&format!("UNLISTEN {}", quote_ident(channel)))
            .await?;
        let mut handlers = self.handlers.write().await;
        handlers.remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError> {
        self.client
            .execute("SELECT pg_notify($1, $2)", &[&channel, &payload])
            .await?;
        Ok(())
    }
}
