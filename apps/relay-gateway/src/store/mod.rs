//! The store gateway: the only layer that speaks to the shared key-value
//! store. Everything above it works in terms of namespaced keys, hashes,
//! sets, sorted sets, and pub/sub topics.

pub mod batcher;
pub mod memory;
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Store-boundary error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or timed out. The batcher retries these.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but the data is not what we persisted.
    #[error("corrupt store data: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Semantic wrapper over the shared key-value store.
///
/// Backed by Redis in production and an in-memory map in tests.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;
    async fn zrange(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError>;

    /// Open a dedicated pub/sub link. The event bus drives it: one subscriber
    /// per replica, topics added and removed on demand.
    async fn open_subscriber(&self) -> Result<Box<dyn TopicSubscriber>, StoreError>;
}

/// A live pub/sub subscription multiplexing any number of topics.
#[async_trait]
pub trait TopicSubscriber: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), StoreError>;
    async fn unsubscribe(&mut self, topic: &str) -> Result<(), StoreError>;

    /// Next `(topic, payload)` event, or `None` when the link is gone.
    async fn next_event(&mut self) -> Option<(String, String)>;
}

/// Key and topic namespaces, in one place so nothing formats keys by hand.
pub mod keys {
    /// `users:<username>` — user record hash.
    pub fn user(username: &str) -> String {
        format!("users:{username}")
    }

    /// `sessions:<sid>` — session hash.
    pub fn session(sid: &str) -> String {
        format!("sessions:{sid}")
    }

    /// `user_sessions:<username>` — set of the user's session ids.
    pub fn user_sessions(username: &str) -> String {
        format!("user_sessions:{username}")
    }

    /// `connections:<sid>` — connection record hash.
    pub fn connection(sid: &str) -> String {
        format!("connections:{sid}")
    }

    /// Sorted set of connected session ids scored by last-seen.
    pub const CONNECTED_USERS: &str = "connected_users";

    /// Pub/sub topic fanning out to all of a user's sockets.
    pub fn user_topic(username: &str) -> String {
        format!("user:{username}")
    }

    /// Pub/sub topic targeting a single session's socket.
    pub fn session_topic(sid: &str) -> String {
        format!("session:{sid}")
    }
}
