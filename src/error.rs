//! Error types for the pickup queue subsystem.

use std::time::Duration;

/// Errors raised by the queue store backends.
///
/// A storage error means durability cannot be guaranteed for the operation;
/// callers of the queue contract see these directly and may retry.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to create the connection pool.
    #[error("pool creation failed: {reason}")]
    CreatePool { reason: String },

    /// Failed to check a connection out of the pool.
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Postgres query or connection failure.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Redis command or connection failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored document could not be decoded.
    #[error("malformed stored record: {0}")]
    Decode(#[from] serde_json::Error),

    /// Backend-specific failure that has no structured form.
    #[error("storage backend error: {reason}")]
    Backend { reason: String },
}

/// Errors raised by the pub/sub wake-up transports.
///
/// Wake-ups are hints, not a transport for message bytes: the facade logs
/// publish failures and moves on, the message stays durably queued.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// Postgres LISTEN/NOTIFY failure.
    #[error("postgres pub/sub error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Redis SUBSCRIBE/PUBLISH failure.
    #[error("redis pub/sub error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The coordinator was used before `start` registered a handler.
    #[error("pub/sub coordinator not started")]
    NotStarted,
}

/// Errors raised by push-notification senders.
///
/// Never propagated past the repository facade: a failed push leaves the
/// message queued for the recipient's next pickup poll.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// HTTP request to the push relay failed.
    #[error("push relay request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The relay answered but did not accept the notification.
    #[error("push relay rejected notification: {reason}")]
    Rejected { reason: String },

    /// The relay did not answer within the configured deadline.
    #[error("push relay timed out after {0:?}")]
    Timeout(Duration),

    /// Sender was constructed without working credentials or endpoint.
    #[error("notification sender not initialized")]
    NotInitialized,
}

/// Error surface of the external mediator runtime capabilities.
#[derive(Debug, thiserror::Error)]
#[error("mediator runtime error: {reason}")]
pub struct RuntimeError {
    pub reason: String,
}

impl RuntimeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the repository facade to the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum PickupError {
    /// The queue store failed; the enqueue attempt may or may not have
    /// completed. Ids are invisible until success, so retrying is safe.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Live delivery through the external runtime failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The wake-up coordinator could not be set up. Publish failures after
    /// startup are logged and swallowed instead; only wiring errors land
    /// here.
    #[error(transparent)]
    PubSub(#[from] PubSubError),
}

/// Errors raised while reading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

impl ConfigError {
    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
