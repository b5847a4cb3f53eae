//! Local live-session registry.
//!
//! One per process instance: maps `connection_id` to the id of the live
//! pickup session this instance currently holds. It is a cache over the
//! queue store's live-session table, valid only for sessions local to this
//! instance, and mutated exclusively by the session-saved/removed events
//! the external runtime raises. A restart starts empty; the store is the
//! cross-instance authority.

use std::collections::HashMap;

use tokio::sync::RwLock;

/// In-process map of live delivery sessions held by this instance.
#[derive(Default)]
pub struct LiveSessionRegistry {
    sessions: RwLock<HashMap<String, String>>,
}

impl LiveSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live session for a connection. A newer session for the same
    /// connection supersedes the previous one; the superseded id is
    /// returned so the caller can log it.
    pub async fn register(&self, connection_id: &str, session_id: &str) -> Option<String> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(connection_id.to_string(), session_id.to_string())
    }

    /// Drop the session for a connection, returning its id if one was held.
    pub async fn unregister(&self, connection_id: &str) -> Option<String> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(connection_id)
    }

    /// The id of the live session this instance holds for a connection.
    pub async fn get(&self, connection_id: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions.get(connection_id).cloned()
    }

    /// Number of live sessions this instance holds.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = LiveSessionRegistry::new();
        assert!(registry.get("c1").await.is_none());

        registry.register("c1", "s1").await;
        assert_eq!(registry.get("c1").await.as_deref(), Some("s1"));
        assert!(registry.get("c2").await.is_none());
    }

    #[tokio::test]
    async fn test_newer_session_supersedes() {
        let registry = LiveSessionRegistry::new();
        assert!(registry.register("c1", "s1").await.is_none());

        let superseded = registry.register("c1", "s2").await;
        assert_eq!(superseded.as_deref(), Some("s1"));
        assert_eq!(registry.get("c1").await.as_deref(), Some("s2"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = LiveSessionRegistry::new();
        registry.register("c1", "s1").await;

        assert_eq!(registry.unregister("c1").await.as_deref(), Some("s1"));
        assert!(registry.unregister("c1").await.is_none());
        assert!(registry.is_empty().await);
    }
}
