//! Redis store backend: `ConnectionManager` for commands, a dedicated
//! pub/sub connection (driven by the event bus) for subscriptions.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;

use super::{StoreError, StoreGateway, TopicSubscriber};

pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid store url: {e}")))?;
        let conn = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(to_store_err)?;
        Ok(Self { client, conn })
    }
}

fn to_store_err(err: redis::RedisError) -> StoreError {
    // ConnectionManager reconnects behind the scenes; every command error is
    // retryable from the caller's point of view.
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl StoreGateway for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(to_store_err)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        match ttl_secs {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl).await,
            None => conn.set::<_, _, ()>(key, value).await,
        }
        .map_err(to_store_err)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(to_store_err)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(to_store_err)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields)
            .await
            .map_err(to_store_err)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, field).await.map_err(to_store_err)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(to_store_err)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await.map_err(to_store_err)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await.map_err(to_store_err)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(to_store_err)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(to_store_err)
    }

    async fn zrange(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = self.conn.clone();
        conn.zrange_withscores(key, 0, -1).await.map_err(to_store_err)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(key, member).await.map_err(to_store_err)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl_secs as i64)
            .await
            .map_err(to_store_err)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.keys(pattern).await.map_err(to_store_err)
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(topic, payload)
            .await
            .map_err(to_store_err)
    }

    async fn open_subscriber(&self) -> Result<Box<dyn TopicSubscriber>, StoreError> {
        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(to_store_err)?;
        let (sink, stream) = pubsub.split();
        Ok(Box::new(RedisSubscriber { sink, stream }))
    }
}

struct RedisSubscriber {
    sink: redis::aio::PubSubSink,
    stream: redis::aio::PubSubStream,
}

#[async_trait]
impl TopicSubscriber for RedisSubscriber {
    async fn subscribe(&mut self, topic: &str) -> Result<(), StoreError> {
        self.sink.subscribe(topic).await.map_err(to_store_err)
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), StoreError> {
        self.sink.unsubscribe(topic).await.map_err(to_store_err)
    }

    async fn next_event(&mut self) -> Option<(String, String)> {
        loop {
            let msg = self.stream.next().await?;
            let topic = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => return Some((topic, payload)),
                Err(e) => {
                    tracing::warn!(?e, %topic, "non-utf8 pub/sub payload dropped");
                }
            }
        }
    }
}
