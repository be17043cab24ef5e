//! In-memory store backend for tests and local development.
//!
//! Pub/sub rides a process-wide broadcast channel, so two `AppState`s built
//! over one `MemoryStore` behave like two replicas sharing a store — enough
//! to exercise cross-replica fan-out without Redis.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{StoreError, StoreGateway, TopicSubscriber};

const EVENT_CAPACITY: usize = 4096;

#[derive(Default)]
struct Tables {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    events: broadcast::Sender<(String, String)>,
    write_count: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            events,
            write_count: AtomicU64::new(0),
        }
    }

    /// Number of mutating commands observed. Lets tests assert that the
    /// batcher coalesced a burst into a single write.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    fn record_write(&self) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl StoreGateway for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.tables.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, _ttl_secs: Option<u64>) -> Result<(), StoreError> {
        self.record_write();
        self.tables
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.record_write();
        let mut t = self.tables.lock();
        t.strings.remove(key);
        t.hashes.remove(key);
        t.sets.remove(key);
        t.zsets.remove(key);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .tables
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        self.record_write();
        let mut t = self.tables.lock();
        let hash = t.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.record_write();
        if let Some(hash) = self.tables.lock().hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.tables.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.record_write();
        self.tables
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.record_write();
        if let Some(set) = self.tables.lock().sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .tables
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.record_write();
        self.tables
            .lock()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        let mut members: Vec<(String, f64)> = self
            .tables
            .lock()
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.record_write();
        if let Some(zset) = self.tables.lock().zsets.get_mut(key) {
            zset.remove(member);
        }
        Ok(())
    }

    async fn expire(&self, _key: &str, _ttl_secs: u64) -> Result<(), StoreError> {
        // Expiry is enforced lazily from `last_access` by the registries; the
        // store-level TTL is a Redis-side safety net this backend skips.
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let t = self.tables.lock();
        let mut out: Vec<String> = t
            .strings
            .keys()
            .chain(t.hashes.keys())
            .chain(t.sets.keys())
            .chain(t.zsets.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        // Err means no subscribers, which is fine.
        let _ = self.events.send((topic.to_string(), payload.to_string()));
        Ok(())
    }

    async fn open_subscriber(&self) -> Result<Box<dyn TopicSubscriber>, StoreError> {
        Ok(Box::new(MemorySubscriber {
            rx: self.events.subscribe(),
            topics: HashSet::new(),
        }))
    }
}

struct MemorySubscriber {
    rx: broadcast::Receiver<(String, String)>,
    topics: HashSet<String>,
}

#[async_trait]
impl TopicSubscriber for MemorySubscriber {
    async fn subscribe(&mut self, topic: &str) -> Result<(), StoreError> {
        self.topics.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), StoreError> {
        self.topics.remove(topic);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<(String, String)> {
        loop {
            match self.rx.recv().await {
                Ok((topic, payload)) => {
                    if self.topics.contains(&topic) {
                        return Some((topic, payload));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "memory subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::keys;

    #[tokio::test]
    async fn string_roundtrip_and_delete() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_fields() {
        let store = MemoryStore::new();
        store
            .hset(
                "h",
                &[
                    ("a".to_string(), "1".to_string()),
                    ("b".to_string(), "2".to_string()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap().as_deref(), Some("1"));
        store.hdel("h", "a").await.unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap(), None);
        assert_eq!(store.hgetall("h").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zset_is_score_ordered() {
        let store = MemoryStore::new();
        store.zadd(keys::CONNECTED_USERS, "s2", 20.0).await.unwrap();
        store.zadd(keys::CONNECTED_USERS, "s1", 10.0).await.unwrap();
        let range = store.zrange(keys::CONNECTED_USERS).await.unwrap();
        assert_eq!(range[0].0, "s1");
        assert_eq!(range[1].0, "s2");
        store.zrem(keys::CONNECTED_USERS, "s1").await.unwrap();
        assert_eq!(store.zrange(keys::CONNECTED_USERS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn keys_glob() {
        let store = MemoryStore::new();
        store.set("sessions:a", "{}", None).await.unwrap();
        store.set("sessions:b", "{}", None).await.unwrap();
        store.set("users:x", "{}", None).await.unwrap();
        let found = store.keys("sessions:*").await.unwrap();
        assert_eq!(found, vec!["sessions:a", "sessions:b"]);
    }

    #[tokio::test]
    async fn pubsub_filters_by_topic() {
        let store = MemoryStore::new();
        let mut sub = store.open_subscriber().await.unwrap();
        sub.subscribe("user:alice").await.unwrap();

        store.publish("user:bob", "ignored").await.unwrap();
        store.publish("user:alice", "hello").await.unwrap();

        let (topic, payload) = sub.next_event().await.unwrap();
        assert_eq!(topic, "user:alice");
        assert_eq!(payload, "hello");
    }
}
