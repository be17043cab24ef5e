//! Distributed session registry.
//!
//! The store owns the sessions; this registry is the per-replica view over
//! it. Mutations go through the batcher, so a read-through cache (updated
//! synchronously on create/update) keeps local callers reading their own
//! writes inside a flush window. Cross-replica readers may lag by up to one
//! flush interval; `session_updated` events are advisory and consumers
//! re-read if they care.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;

use crate::error::ApiError;
use crate::store::batcher::Batcher;
use crate::store::{keys, StoreGateway};

use super::models::{merge_json, Session};

/// How long a locally cached session stays authoritative.
const CACHE_TTL_SECS: f64 = 30.0;

pub struct SessionRegistry {
    store: Arc<dyn StoreGateway>,
    batcher: Arc<Batcher>,
    timeout: Duration,
    gateway_id: String,
    cache: DashMap<String, (Session, f64)>,
    /// Per-session logical locks serializing local read-merge-write updates.
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn StoreGateway>,
        batcher: Arc<Batcher>,
        timeout: Duration,
        gateway_id: String,
    ) -> Self {
        Self {
            store,
            batcher,
            timeout,
            gateway_id,
            cache: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn ttl(&self) -> Option<u64> {
        Some(self.timeout.as_secs())
    }

    /// Create a session for the user. Emits no event.
    pub async fn create(&self, user_id: &str, chat_id: &str) -> Result<Session, ApiError> {
        let session = Session::new(user_id, chat_id);
        self.cache_put(session.clone());
        self.batcher
            .hset(
                &keys::session(&session.session_id),
                session.to_fields(),
                self.ttl(),
            )
            .await?;
        self.batcher
            .sadd(&keys::user_sessions(user_id), session.session_id.clone())
            .await?;
        tracing::info!(session_id = %session.session_id, %user_id, "session created");
        Ok(session)
    }

    /// Fetch a session; expired sessions read as absent and are reaped.
    pub async fn get(&self, sid: &str) -> Result<Option<Session>, ApiError> {
        let now = relay_common::clock::unix_now();

        if let Some(entry) = self.cache.get(sid) {
            let (session, cached_at) = entry.value();
            if now - cached_at < CACHE_TTL_SECS {
                if self.is_expired(session) {
                    let session = session.clone();
                    drop(entry);
                    self.reap(&session).await;
                    return Ok(None);
                }
                return Ok(Some(session.clone()));
            }
        }

        let hash = self.store.hgetall(&keys::session(sid)).await?;
        let Some(session) = Session::from_hash(sid, &hash) else {
            return Ok(None);
        };
        if self.is_expired(&session) {
            self.reap(&session).await;
            return Ok(None);
        }
        self.cache_put(session.clone());
        Ok(Some(session))
    }

    /// Read-merge-write under the session's logical lock: deep-merge the
    /// patch into `data`, optionally switch `chat_id`, bump last-access,
    /// announce on the session topic.
    pub async fn update(
        &self,
        sid: &str,
        patch: &Value,
        chat_id: Option<&str>,
    ) -> Result<Session, ApiError> {
        let lock = self.lock_for(sid);
        let _guard = lock.lock().await;

        let mut session = self
            .get(sid)
            .await?
            .ok_or_else(|| ApiError::not_found("Session not found"))?;

        merge_json(&mut session.data, patch);
        if let Some(chat_id) = chat_id {
            session.chat_id = chat_id.to_string();
        }
        session.last_access = relay_common::clock::unix_now();

        self.cache_put(session.clone());
        self.batcher
            .hset(&keys::session(sid), session.to_fields(), self.ttl())
            .await?;

        let event = serde_json::json!({
            "type": "session_updated",
            "session_id": sid,
            "user_id": session.user_id,
            "chat_id": session.chat_id,
            "updates": patch,
            "origin": self.gateway_id,
        });
        self.batcher
            .publish(&keys::session_topic(sid), &event.to_string())
            .await;

        Ok(session)
    }

    /// Bump last-access only.
    pub async fn touch(&self, sid: &str) -> Result<(), ApiError> {
        let now = relay_common::clock::unix_now();
        if let Some(mut entry) = self.cache.get_mut(sid) {
            entry.value_mut().0.last_access = now;
        }
        self.batcher
            .hset(
                &keys::session(sid),
                vec![("last_access".to_string(), now.to_string())],
                self.ttl(),
            )
            .await?;
        Ok(())
    }

    /// Delete a session, its index entry, and any connection record;
    /// announce `session_closed`.
    pub async fn delete(&self, sid: &str) -> Result<bool, ApiError> {
        let hash = self.store.hgetall(&keys::session(sid)).await?;
        let stored = Session::from_hash(sid, &hash);
        let cached = self.cache.get(sid).map(|e| e.value().0.clone());
        let Some(session) = stored.or(cached) else {
            return Ok(false);
        };

        self.cache.remove(sid);
        self.locks.remove(sid);
        self.batcher.delete(&keys::session(sid)).await?;
        self.batcher
            .srem(&keys::user_sessions(&session.user_id), sid.to_string())
            .await?;
        self.batcher.delete(&keys::connection(sid)).await?;
        self.batcher
            .zrem(keys::CONNECTED_USERS, sid.to_string())
            .await?;

        let event = serde_json::json!({
            "type": "session_closed",
            "session_id": sid,
            "user_id": session.user_id,
            "origin": self.gateway_id,
        });
        self.batcher
            .publish(&keys::session_topic(sid), &event.to_string())
            .await;

        tracing::info!(session_id = %sid, user_id = %session.user_id, "session deleted");
        Ok(true)
    }

    /// All live sessions for a user, via the index.
    pub async fn for_user(&self, user_id: &str) -> Result<Vec<Session>, ApiError> {
        let mut sessions = Vec::new();
        for sid in self.store.smembers(&keys::user_sessions(user_id)).await? {
            if let Some(session) = self.get(&sid).await? {
                sessions.push(session);
            } else {
                // Index entry with no live session: repair it.
                self.batcher
                    .srem(&keys::user_sessions(user_id), sid)
                    .await?;
            }
        }
        sessions.sort_by(|a, b| {
            b.last_access
                .partial_cmp(&a.last_access)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(sessions)
    }

    /// Delete every session a user holds. Returns how many went away.
    pub async fn delete_for_user(&self, user_id: &str) -> Result<usize, ApiError> {
        let mut deleted = 0;
        for sid in self.store.smembers(&keys::user_sessions(user_id)).await? {
            if self.delete(&sid).await? {
                deleted += 1;
            }
        }
        self.batcher.delete(&keys::user_sessions(user_id)).await?;
        Ok(deleted)
    }

    /// Every live session in the store (admin listing).
    pub async fn all(&self) -> Result<Vec<Session>, ApiError> {
        let mut sessions = Vec::new();
        for key in self.store.keys("sessions:*").await? {
            let Some(sid) = key.strip_prefix("sessions:") else {
                continue;
            };
            if let Some(session) = self.get(sid).await? {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    /// Walk the per-user indexes and reap sessions past the timeout.
    /// `get` does the lazy expiry; this just forces the walk.
    pub async fn sweep_expired(&self) -> Result<usize, ApiError> {
        let mut removed = 0;
        for key in self.store.keys("user_sessions:*").await? {
            let Some(user_id) = key.strip_prefix("user_sessions:") else {
                continue;
            };
            for sid in self.store.smembers(&keys::user_sessions(user_id)).await? {
                if self.get(&sid).await?.is_none() {
                    self.batcher
                        .srem(&keys::user_sessions(user_id), sid)
                        .await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Evict cache entries past twice the cache TTL and locks for sessions
    /// that are no longer cached.
    pub fn evict_stale_cache(&self) -> usize {
        let now = relay_common::clock::unix_now();
        let before = self.cache.len();
        self.cache
            .retain(|_, entry| now - entry.1 < CACHE_TTL_SECS * 2.0);
        self.locks
            .retain(|sid, lock| self.cache.contains_key(sid) || Arc::strong_count(lock) > 1);
        before - self.cache.len()
    }

    fn is_expired(&self, session: &Session) -> bool {
        relay_common::clock::age_secs(session.last_access) > self.timeout.as_secs_f64()
    }

    /// Remove an expired session without announcing `session_closed` twice —
    /// expiry is quiet, the sweeper's srem keeps the index honest.
    async fn reap(&self, session: &Session) {
        self.cache.remove(&session.session_id);
        let _ = self
            .batcher
            .delete(&keys::session(&session.session_id))
            .await;
        let _ = self
            .batcher
            .srem(
                &keys::user_sessions(&session.user_id),
                session.session_id.clone(),
            )
            .await;
    }

    fn cache_put(&self, session: Session) {
        let now = relay_common::clock::unix_now();
        self.cache.insert(session.session_id.clone(), (session, now));
    }

    fn lock_for(&self, sid: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(sid.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
