//! Distributed connection registry: which replica owns the live socket for
//! a session. Records live in `connections:<sid>` hashes plus the
//! `connected_users` sorted set scored by last-seen.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::store::batcher::Batcher;
use crate::store::{keys, StoreGateway};

/// A connection record as persisted in the store.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Connection {
    pub session_id: String,
    pub gateway_id: String,
    pub ws_connected: bool,
    pub last_seen: f64,
}

impl Connection {
    fn from_hash(sid: &str, hash: &HashMap<String, String>) -> Option<Self> {
        let gateway_id = hash.get("gateway_id")?.clone();
        Some(Self {
            session_id: sid.to_string(),
            gateway_id,
            ws_connected: hash.get("ws_connected").map(String::as_str) == Some("1"),
            last_seen: hash
                .get("last_seen")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
        })
    }
}

pub struct ConnectionRegistry {
    store: Arc<dyn StoreGateway>,
    batcher: Arc<Batcher>,
    gateway_id: String,
    ttl: Duration,
    ping_interval: Duration,
}

impl ConnectionRegistry {
    pub fn new(
        store: Arc<dyn StoreGateway>,
        batcher: Arc<Batcher>,
        gateway_id: String,
        ttl: Duration,
        ping_interval: Duration,
    ) -> Self {
        Self {
            store,
            batcher,
            gateway_id,
            ttl,
            ping_interval,
        }
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Create (or rebind) the record for a session on this replica.
    pub async fn register(&self, sid: &str) -> Result<(), ApiError> {
        let now = relay_common::clock::unix_now();
        self.batcher
            .hset(
                &keys::connection(sid),
                vec![
                    ("gateway_id".to_string(), self.gateway_id.clone()),
                    ("ws_connected".to_string(), "0".to_string()),
                    ("last_seen".to_string(), now.to_string()),
                ],
                Some(self.ttl.as_secs()),
            )
            .await?;
        Ok(())
    }

    /// Flip the live-socket flag. Idempotent, so a re-login after a replica
    /// crash rebinds cleanly. `true` also enters `connected_users`.
    pub async fn mark_connected(&self, sid: &str, connected: bool) -> Result<(), ApiError> {
        let now = relay_common::clock::unix_now();
        self.batcher
            .hset(
                &keys::connection(sid),
                vec![
                    ("gateway_id".to_string(), self.gateway_id.clone()),
                    (
                        "ws_connected".to_string(),
                        if connected { "1" } else { "0" }.to_string(),
                    ),
                    ("last_seen".to_string(), now.to_string()),
                ],
                Some(self.ttl.as_secs()),
            )
            .await?;
        if connected {
            self.batcher
                .zadd(keys::CONNECTED_USERS, sid.to_string(), now)
                .await?;
        } else {
            self.batcher
                .zrem(keys::CONNECTED_USERS, sid.to_string())
                .await?;
        }
        Ok(())
    }

    /// Refresh last-seen. High-rate path; the batcher coalesces the bumps.
    pub async fn heartbeat(&self, sid: &str) -> Result<(), ApiError> {
        let now = relay_common::clock::unix_now();
        self.batcher
            .hset(
                &keys::connection(sid),
                vec![("last_seen".to_string(), now.to_string())],
                Some(self.ttl.as_secs()),
            )
            .await?;
        self.batcher
            .zadd(keys::CONNECTED_USERS, sid.to_string(), now)
            .await?;
        Ok(())
    }

    /// Drop the record from both structures. The queued delete supersedes
    /// any heartbeat still waiting in the batcher.
    pub async fn remove(&self, sid: &str) -> Result<(), ApiError> {
        self.batcher.delete(&keys::connection(sid)).await?;
        self.batcher
            .zrem(keys::CONNECTED_USERS, sid.to_string())
            .await?;
        Ok(())
    }

    pub async fn lookup(&self, sid: &str) -> Result<Option<Connection>, ApiError> {
        let hash = self.store.hgetall(&keys::connection(sid)).await?;
        Ok(Connection::from_hash(sid, &hash))
    }

    /// Reap records this replica owns whose socket is gone: last-seen older
    /// than twice the ping interval with no live socket left behind. Entries
    /// pinned to other replicas are left alone.
    pub async fn sweep_stale(&self) -> Result<usize, ApiError> {
        let stale_after = 2.0 * self.ping_interval.as_secs_f64();
        let mut removed = 0;
        for (sid, last_seen) in self.store.zrange(keys::CONNECTED_USERS).await? {
            if relay_common::clock::age_secs(last_seen) <= stale_after {
                continue;
            }
            match self.lookup(&sid).await? {
                Some(conn) if conn.gateway_id == self.gateway_id => {
                    tracing::warn!(session_id = %sid, "removing stale connection record");
                    self.remove(&sid).await?;
                    removed += 1;
                }
                // Another replica's socket, or the hash already expired and
                // only the sorted-set entry lingers on a dead replica's id.
                Some(_) => {}
                None => {
                    self.batcher
                        .zrem(keys::CONNECTED_USERS, sid.clone())
                        .await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn registry_on(gateway: &str) -> (Arc<ConnectionRegistry>, Arc<MemoryStore>, Arc<Batcher>) {
        let store = Arc::new(MemoryStore::new());
        let batcher = Batcher::new(
            store.clone() as Arc<dyn StoreGateway>,
            Duration::from_millis(10),
        );
        let registry = Arc::new(ConnectionRegistry::new(
            store.clone() as Arc<dyn StoreGateway>,
            batcher.clone(),
            gateway.to_string(),
            Duration::from_secs(1800),
            Duration::from_secs(25),
        ));
        (registry, store, batcher)
    }

    fn shared_registry(
        store: Arc<MemoryStore>,
        gateway: &str,
        ping_interval: Duration,
    ) -> (Arc<ConnectionRegistry>, Arc<Batcher>) {
        let batcher = Batcher::new(
            store.clone() as Arc<dyn StoreGateway>,
            Duration::from_millis(10),
        );
        let registry = Arc::new(ConnectionRegistry::new(
            store as Arc<dyn StoreGateway>,
            batcher.clone(),
            gateway.to_string(),
            Duration::from_secs(1800),
            ping_interval,
        ));
        (registry, batcher)
    }

    #[tokio::test]
    async fn register_then_mark_connected() {
        let (registry, store, batcher) = registry_on("gw1:8000");
        registry.register("s1").await.unwrap();
        registry.mark_connected("s1", true).await.unwrap();
        batcher.drain(Duration::from_secs(1)).await;

        let conn = registry.lookup("s1").await.unwrap().unwrap();
        assert!(conn.ws_connected);
        assert_eq!(conn.gateway_id, "gw1:8000");
        assert_eq!(store.zrange(keys::CONNECTED_USERS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_disconnected_leaves_record_but_exits_zset() {
        let (registry, store, batcher) = registry_on("gw1:8000");
        registry.register("s1").await.unwrap();
        registry.mark_connected("s1", true).await.unwrap();
        registry.mark_connected("s1", false).await.unwrap();
        batcher.drain(Duration::from_secs(1)).await;

        let conn = registry.lookup("s1").await.unwrap().unwrap();
        assert!(!conn.ws_connected);
        assert!(store.zrange(keys::CONNECTED_USERS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_clears_both_structures() {
        let (registry, store, batcher) = registry_on("gw1:8000");
        registry.register("s1").await.unwrap();
        registry.mark_connected("s1", true).await.unwrap();
        registry.heartbeat("s1").await.unwrap();
        registry.remove("s1").await.unwrap();
        batcher.drain(Duration::from_secs(1)).await;

        assert!(registry.lookup("s1").await.unwrap().is_none());
        assert!(store.zrange(keys::CONNECTED_USERS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweeper_only_touches_own_stale_entries() {
        let store = Arc::new(MemoryStore::new());
        let ping = Duration::from_millis(10);
        let (gw1, batcher1) = shared_registry(store.clone(), "gw1:8000", ping);
        let (gw2, batcher2) = shared_registry(store.clone(), "gw2:8000", ping);

        gw1.register("s1").await.unwrap();
        gw1.mark_connected("s1", true).await.unwrap();
        gw2.register("s2").await.unwrap();
        gw2.mark_connected("s2", true).await.unwrap();
        batcher1.drain(Duration::from_secs(1)).await;
        batcher2.drain(Duration::from_secs(1)).await;

        // Both records go stale (no heartbeats for > 2 × ping interval).
        tokio::time::sleep(Duration::from_millis(50)).await;

        let removed = gw1.sweep_stale().await.unwrap();
        batcher1.drain(Duration::from_secs(1)).await;
        assert_eq!(removed, 1);
        assert!(gw1.lookup("s1").await.unwrap().is_none());
        // gw2's record survives gw1's sweep.
        assert!(gw1.lookup("s2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweeper_keeps_fresh_entries() {
        let (registry, _, batcher) = registry_on("gw1:8000");
        registry.register("s1").await.unwrap();
        registry.mark_connected("s1", true).await.unwrap();
        batcher.drain(Duration::from_secs(1)).await;

        assert_eq!(registry.sweep_stale().await.unwrap(), 0);
        assert!(registry.lookup("s1").await.unwrap().is_some());
    }
}
