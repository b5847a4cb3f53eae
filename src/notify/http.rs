//! HTTP push relay sender.
//!
//! Posts `{device_token, message_id}` to an external relay service that
//! talks to the actual push provider. The request deadline comes from
//! configuration; a late answer counts as a failed push. A sender whose
//! HTTP client cannot be built comes up disabled instead of failing
//! mediator startup.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PushConfig;
use crate::error::NotificationError;
use crate::notify::NotificationSender;

#[derive(Serialize)]
struct PushRequest<'a> {
    device_token: &'a str,
    message_id: &'a str,
}

#[derive(Deserialize)]
struct PushResponse {
    response: PushResult,
}

#[derive(Deserialize)]
struct PushResult {
    success: bool,
}

/// Sender that delegates to an HTTP push relay.
pub struct HttpNotificationSender {
    client: Option<reqwest::Client>,
    service_url: String,
    timeout: Duration,
}

impl HttpNotificationSender {
    pub fn new(config: &PushConfig) -> Self {
        let client = match reqwest::Client::builder().timeout(config.timeout).build() {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("push relay client unavailable, notifications disabled: {}", e);
                None
            }
        };
        Self {
            client,
            service_url: config.service_url.clone(),
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl NotificationSender for HttpNotificationSender {
    fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    async fn send(&self, device_token: &str, message_id: &str) -> Result<(), NotificationError> {
        let Some(client) = &self.client else {
            return Err(NotificationError::NotInitialized);
        };
        tracing::debug!("pushing wake-up for message {} to relay", message_id);

        let response = client
            .post(&self.service_url)
            .json(&PushRequest {
                device_token,
                message_id,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotificationError::Timeout(self.timeout)
                } else {
                    NotificationError::Http(e)
                }
            })?
            .error_for_status()?;

        let body: PushResponse = response.json().await?;
        if body.response.success {
            Ok(())
        } else {
            Err(NotificationError::Rejected {
                reason: "relay reported failure".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slow_relay_surfaces_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept connections and hold them open without answering.
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let _socket = socket;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        });

        let sender = HttpNotificationSender::new(&PushConfig {
            service_url: format!("http://{}/push", addr),
            timeout: Duration::from_millis(100),
        });
        assert!(sender.is_enabled());

        let err = sender.send("device-token", "m1").await.unwrap_err();
        assert!(matches!(err, NotificationError::Timeout(_)));
    }
}
