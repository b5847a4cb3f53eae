//! Push-notification fallback.
//!
//! When no instance holds a live session for a recipient, the facade looks
//! up the device's push token and hands it here. Failures never propagate:
//! the message is already durably queued and will go out on the next poll.

mod http;

pub use http::HttpNotificationSender;

use async_trait::async_trait;

use crate::error::NotificationError;

/// Capability for waking a device through a push channel.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Whether the sender is usable. A sender that failed to initialize
    /// reports false and `send` becomes a logged no-op at the call site.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Tell the device identified by `device_token` that `message_id`
    /// awaits pickup.
    async fn send(&self, device_token: &str, message_id: &str) -> Result<(), NotificationError>;
}
