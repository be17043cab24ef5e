//! Write-behind batcher: mutating store operations are acknowledged locally
//! and flushed as coalesced writes on a fixed cadence, so tens of thousands
//! of sockets never translate into per-message store round-trips.
//!
//! Coalescing is per key: a scalar set keeps only the latest value, hash
//! writes keep the latest value per field, set/sorted-set membership ops
//! cancel pairwise, and a delete supersedes everything queued before it.
//! Publishes do not coalesce; they take an immediate path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::{StoreError, StoreGateway};

/// Retry backoff bounds for a failing flush.
const BACKOFF_MIN: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Above this many pending keys, submissions write through synchronously
/// until the queue drains.
const HIGH_WATER: usize = 50_000;

/// One coalesced write queued for a key.
#[derive(Debug, Clone)]
enum PendingWrite {
    Set {
        value: String,
        ttl: Option<u64>,
    },
    Hash {
        fields: HashMap<String, String>,
        ttl: Option<u64>,
        /// A delete was queued before these fields; flush as DEL + HSET.
        replace: bool,
    },
    SetMembers {
        add: HashSet<String>,
        rem: HashSet<String>,
        replace: bool,
    },
    Zset {
        add: HashMap<String, f64>,
        rem: HashSet<String>,
        replace: bool,
    },
    Delete,
}

/// Apply `incoming` on top of `base`, keeping the net effect.
fn merge_write(base: &mut PendingWrite, incoming: PendingWrite) {
    match incoming {
        PendingWrite::Delete => *base = PendingWrite::Delete,
        // SET replaces the whole value, so it wins over anything pending.
        PendingWrite::Set { .. } => *base = incoming,
        PendingWrite::Hash { fields, ttl, .. } => match base {
            PendingWrite::Hash {
                fields: base_fields,
                ttl: base_ttl,
                ..
            } => {
                base_fields.extend(fields);
                if ttl.is_some() {
                    *base_ttl = ttl;
                }
            }
            PendingWrite::Delete => {
                *base = PendingWrite::Hash {
                    fields,
                    ttl,
                    replace: true,
                }
            }
            _ => *base = PendingWrite::Hash { fields, ttl, replace: false },
        },
        PendingWrite::SetMembers { add, rem, .. } => match base {
            PendingWrite::SetMembers {
                add: base_add,
                rem: base_rem,
                ..
            } => {
                for member in rem {
                    base_add.remove(&member);
                    base_rem.insert(member);
                }
                for member in add {
                    base_rem.remove(&member);
                    base_add.insert(member);
                }
            }
            PendingWrite::Delete => {
                *base = PendingWrite::SetMembers { add, rem, replace: true }
            }
            _ => *base = PendingWrite::SetMembers { add, rem, replace: false },
        },
        PendingWrite::Zset { add, rem, .. } => match base {
            PendingWrite::Zset {
                add: base_add,
                rem: base_rem,
                ..
            } => {
                for member in rem {
                    base_add.remove(&member);
                    base_rem.insert(member);
                }
                for (member, score) in add {
                    base_rem.remove(&member);
                    base_add.insert(member, score);
                }
            }
            PendingWrite::Delete => *base = PendingWrite::Zset { add, rem, replace: true },
            _ => *base = PendingWrite::Zset { add, rem, replace: false },
        },
    }
}

pub struct Batcher {
    store: Arc<dyn StoreGateway>,
    pending: Mutex<HashMap<String, PendingWrite>>,
    flush_interval: Duration,
    high_water: usize,
}

impl Batcher {
    pub fn new(store: Arc<dyn StoreGateway>, flush_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            pending: Mutex::new(HashMap::new()),
            flush_interval,
            high_water: HIGH_WATER,
        })
    }

    /// Spawn the background flusher. Flush errors back off exponentially
    /// without losing the coalesced state.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = BACKOFF_MIN;
            loop {
                tokio::time::sleep(batcher.flush_interval).await;
                match batcher.flush_once().await {
                    Ok(flushed) => {
                        if flushed > 0 {
                            tracing::debug!(flushed, "batch flushed");
                        }
                        backoff = BACKOFF_MIN;
                    }
                    Err(e) => {
                        tracing::warn!(%e, "batch flush failed; backing off");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
        })
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    // -- typed submission API ------------------------------------------------

    pub async fn set(&self, key: &str, value: String, ttl: Option<u64>) -> Result<(), StoreError> {
        self.enqueue(key, PendingWrite::Set { value, ttl }).await
    }

    pub async fn hset(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Option<u64>,
    ) -> Result<(), StoreError> {
        self.enqueue(
            key,
            PendingWrite::Hash {
                fields: fields.into_iter().collect(),
                ttl,
                replace: false,
            },
        )
        .await
    }

    pub async fn sadd(&self, key: &str, member: String) -> Result<(), StoreError> {
        self.enqueue(
            key,
            PendingWrite::SetMembers {
                add: HashSet::from([member]),
                rem: HashSet::new(),
                replace: false,
            },
        )
        .await
    }

    pub async fn srem(&self, key: &str, member: String) -> Result<(), StoreError> {
        self.enqueue(
            key,
            PendingWrite::SetMembers {
                add: HashSet::new(),
                rem: HashSet::from([member]),
                replace: false,
            },
        )
        .await
    }

    pub async fn zadd(&self, key: &str, member: String, score: f64) -> Result<(), StoreError> {
        self.enqueue(
            key,
            PendingWrite::Zset {
                add: HashMap::from([(member, score)]),
                rem: HashSet::new(),
                replace: false,
            },
        )
        .await
    }

    pub async fn zrem(&self, key: &str, member: String) -> Result<(), StoreError> {
        self.enqueue(
            key,
            PendingWrite::Zset {
                add: HashMap::new(),
                rem: HashSet::from([member]),
                replace: false,
            },
        )
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.enqueue(key, PendingWrite::Delete).await
    }

    /// Immediate, non-coalesced event publish. Fire-and-forget: failures are
    /// logged, not surfaced, since events are advisory.
    pub async fn publish(&self, topic: &str, payload: &str) {
        if let Err(e) = self.store.publish(topic, payload).await {
            tracing::warn!(%e, %topic, "event publish failed");
        }
    }

    /// Flush everything pending, retrying until the deadline. Returns whether
    /// the queue is empty.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let end = Instant::now() + deadline;
        loop {
            if self.pending_len() == 0 {
                return true;
            }
            if Instant::now() >= end {
                tracing::warn!(pending = self.pending_len(), "drain deadline elapsed");
                return false;
            }
            if let Err(e) = self.flush_once().await {
                tracing::warn!(%e, "drain flush failed");
                tokio::time::sleep(BACKOFF_MIN).await;
            }
        }
    }

    // -- internals -----------------------------------------------------------

    async fn enqueue(&self, key: &str, write: PendingWrite) -> Result<(), StoreError> {
        let overflow = {
            let mut pending = self.pending.lock();
            if let Some(existing) = pending.get_mut(key) {
                merge_write(existing, write);
                None
            } else if pending.len() >= self.high_water {
                // Past the high-water mark new keys write through; keys with
                // pending state keep coalescing so per-key order holds.
                Some(write)
            } else {
                pending.insert(key.to_string(), write);
                None
            }
        };

        match overflow {
            Some(write) => {
                tracing::warn!(%key, "batcher over high-water mark; writing through");
                apply_write(self.store.as_ref(), key, &write).await
            }
            None => Ok(()),
        }
    }

    /// Flush the current pending set. On a store error the unflushed entries
    /// are re-merged under anything submitted since, and the error surfaces
    /// to the caller for backoff.
    async fn flush_once(&self) -> Result<usize, StoreError> {
        let batch: Vec<(String, PendingWrite)> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let total = batch.len();
        let mut iter = batch.into_iter();
        while let Some((key, write)) = iter.next() {
            if let Err(e) = apply_write(self.store.as_ref(), &key, &write).await {
                let mut unflushed: Vec<(String, PendingWrite)> = vec![(key, write)];
                unflushed.extend(iter);
                self.requeue(unflushed);
                return Err(e);
            }
        }
        Ok(total)
    }

    fn requeue(&self, entries: Vec<(String, PendingWrite)>) {
        let mut pending = self.pending.lock();
        for (key, old) in entries {
            match pending.remove(&key) {
                // Submissions that raced the failed flush are newer; they
                // merge on top of the state we are putting back.
                Some(newer) => {
                    let mut merged = old;
                    merge_write(&mut merged, newer);
                    pending.insert(key, merged);
                }
                None => {
                    pending.insert(key, old);
                }
            }
        }
    }
}

async fn apply_write(
    store: &dyn StoreGateway,
    key: &str,
    write: &PendingWrite,
) -> Result<(), StoreError> {
    match write {
        PendingWrite::Set { value, ttl } => store.set(key, value, *ttl).await,
        PendingWrite::Hash { fields, ttl, replace } => {
            if *replace {
                store.delete(key).await?;
            }
            let pairs: Vec<(String, String)> =
                fields.iter().map(|(f, v)| (f.clone(), v.clone())).collect();
            store.hset(key, &pairs).await?;
            if let Some(ttl) = ttl {
                store.expire(key, *ttl).await?;
            }
            Ok(())
        }
        PendingWrite::SetMembers { add, rem, replace } => {
            if *replace {
                store.delete(key).await?;
            }
            for member in rem {
                store.srem(key, member).await?;
            }
            for member in add {
                store.sadd(key, member).await?;
            }
            Ok(())
        }
        PendingWrite::Zset { add, rem, replace } => {
            if *replace {
                store.delete(key).await?;
            }
            for member in rem {
                store.zrem(key, member).await?;
            }
            for (member, score) in add {
                store.zadd(key, member, *score).await?;
            }
            Ok(())
        }
        PendingWrite::Delete => store.delete(key).await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::TopicSubscriber;

    fn batcher_over(store: Arc<MemoryStore>) -> Arc<Batcher> {
        Batcher::new(store, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn scalar_sets_coalesce_to_last_writer() {
        let store = Arc::new(MemoryStore::new());
        let batcher = batcher_over(store.clone());

        for i in 1..=50 {
            batcher.set("k", format!("v{i}"), None).await.unwrap();
        }
        assert_eq!(store.write_count(), 0, "nothing written before flush");

        batcher.flush_once().await.unwrap();
        assert_eq!(store.write_count(), 1, "one coalesced write");
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v50"));
    }

    #[tokio::test]
    async fn hash_fields_keep_latest_per_field() {
        let store = Arc::new(MemoryStore::new());
        let batcher = batcher_over(store.clone());

        batcher
            .hset("h", vec![("a".into(), "1".into())], None)
            .await
            .unwrap();
        batcher
            .hset("h", vec![("a".into(), "2".into()), ("b".into(), "3".into())], None)
            .await
            .unwrap();
        batcher.flush_once().await.unwrap();

        let hash = store.hgetall("h").await.unwrap();
        assert_eq!(hash.get("a").map(String::as_str), Some("2"));
        assert_eq!(hash.get("b").map(String::as_str), Some("3"));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn delete_cancels_pending_writes() {
        let store = Arc::new(MemoryStore::new());
        let batcher = batcher_over(store.clone());

        batcher.set("k", "v".into(), None).await.unwrap();
        batcher.delete("k").await.unwrap();
        batcher.flush_once().await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.write_count(), 1, "only the delete hits the store");
    }

    #[tokio::test]
    async fn write_after_delete_replaces_the_key() {
        let store = Arc::new(MemoryStore::new());
        store
            .hset("h", &[("stale".to_string(), "x".to_string())])
            .await
            .unwrap();

        let batcher = batcher_over(store.clone());
        batcher.delete("h").await.unwrap();
        batcher
            .hset("h", vec![("fresh".into(), "y".into())], None)
            .await
            .unwrap();
        batcher.flush_once().await.unwrap();

        let hash = store.hgetall("h").await.unwrap();
        assert_eq!(hash.get("fresh").map(String::as_str), Some("y"));
        assert!(!hash.contains_key("stale"), "delete flushed before the write");
    }

    #[tokio::test]
    async fn set_membership_ops_cancel_pairwise() {
        let store = Arc::new(MemoryStore::new());
        let batcher = batcher_over(store.clone());

        batcher.sadd("s", "a".into()).await.unwrap();
        batcher.sadd("s", "b".into()).await.unwrap();
        batcher.srem("s", "a".into()).await.unwrap();
        batcher.flush_once().await.unwrap();

        let members = store.smembers("s").await.unwrap();
        assert_eq!(members, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn high_water_switches_to_write_through() {
        let store = Arc::new(MemoryStore::new());
        let batcher = Arc::new(Batcher {
            store: store.clone() as Arc<dyn StoreGateway>,
            pending: Mutex::new(HashMap::new()),
            flush_interval: Duration::from_millis(10),
            high_water: 1,
        });

        batcher.set("k1", "v1".into(), None).await.unwrap();
        assert_eq!(store.write_count(), 0);

        // Second key is over the mark: written through immediately.
        batcher.set("k2", "v2".into(), None).await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.get("k2").await.unwrap().as_deref(), Some("v2"));

        // An existing key still coalesces.
        batcher.set("k1", "v1b".into(), None).await.unwrap();
        assert_eq!(store.write_count(), 1);

        batcher.flush_once().await.unwrap();
        assert_eq!(store.get("k1").await.unwrap().as_deref(), Some("v1b"));
    }

    #[tokio::test]
    async fn drain_flushes_everything() {
        let store = Arc::new(MemoryStore::new());
        let batcher = batcher_over(store.clone());

        for i in 0..10 {
            batcher.set(&format!("k{i}"), "v".into(), None).await.unwrap();
        }
        assert!(batcher.drain(Duration::from_secs(1)).await);
        assert_eq!(batcher.pending_len(), 0);
        assert_eq!(store.keys("k*").await.unwrap().len(), 10);
    }

    /// Store double that fails mutations while a flag is set.
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::Relaxed) {
                Err(StoreError::Unavailable("injected".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl StoreGateway for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<(), StoreError> {
            self.check()?;
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.delete(key).await
        }
        async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
            self.inner.hget(key, field).await
        }
        async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
            self.check()?;
            self.inner.hset(key, fields).await
        }
        async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.hdel(key, field).await
        }
        async fn hgetall(
            &self,
            key: &str,
        ) -> Result<std::collections::HashMap<String, String>, StoreError> {
            self.inner.hgetall(key).await
        }
        async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.sadd(key, member).await
        }
        async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.srem(key, member).await
        }
        async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.inner.smembers(key).await
        }
        async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
            self.check()?;
            self.inner.zadd(key, member, score).await
        }
        async fn zrange(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
            self.inner.zrange(key).await
        }
        async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.zrem(key, member).await
        }
        async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
            self.inner.expire(key, ttl_secs).await
        }
        async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys(pattern).await
        }
        async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
            self.inner.publish(topic, payload).await
        }
        async fn open_subscriber(&self) -> Result<Box<dyn TopicSubscriber>, StoreError> {
            self.inner.open_subscriber().await
        }
    }

    #[tokio::test]
    async fn failed_flush_keeps_coalesced_state() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(false),
        });
        let batcher = Batcher::new(store.clone() as Arc<dyn StoreGateway>, Duration::from_millis(10));

        batcher.set("k", "v1".into(), None).await.unwrap();
        store.failing.store(true, Ordering::Relaxed);
        assert!(batcher.flush_once().await.is_err());
        assert_eq!(batcher.pending_len(), 1, "state survives the failure");

        // A newer submission during the outage still wins.
        batcher.set("k", "v2".into(), None).await.unwrap();
        store.failing.store(false, Ordering::Relaxed);
        batcher.flush_once().await.unwrap();
        assert_eq!(store.inner.get("k").await.unwrap().as_deref(), Some("v2"));
    }
}
