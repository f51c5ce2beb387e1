use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::backend::{CacheBackend, PubSubMessage};
use super::CacheError;

/// Redis-backed cache and pub/sub bus.
///
/// Commands run on a shared multiplexed connection manager; each
/// subscription opens its own pub/sub connection, which is what Redis
/// requires anyway.
pub struct RedisCache {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn op_err(e: redis::RedisError) -> CacheError {
    CacheError::Operation(e.to_string())
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.conn().get(key).await.map_err(op_err)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(op_err),
            None => conn.set::<_, _, ()>(key, value).await.map_err(op_err),
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let set: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut self.conn())
            .await
            .map(|v: Option<String>| v.is_some())
            .map_err(op_err)?;
        Ok(set)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.conn().del::<_, ()>(key).await.map_err(op_err)
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.conn().incr(key, 1).await.map_err(op_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.conn()
            .expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(op_err)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let ttl: i64 = self.conn().ttl(key).await.map_err(op_err)?;
        if ttl > 0 {
            Ok(Some(Duration::from_secs(ttl as u64)))
        } else {
            Ok(None)
        }
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), CacheError> {
        self.conn()
            .publish::<_, _, ()>(topic, payload)
            .await
            .map_err(op_err)
    }

    async fn subscribe(
        &self,
        topics: &[&str],
    ) -> Result<BoxStream<'static, PubSubMessage>, CacheError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        for topic in topics {
            pubsub.subscribe(*topic).await.map_err(op_err)?;
        }

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let topic = msg.get_channel_name().to_string();
                msg.get_payload::<String>()
                    .ok()
                    .map(|payload| PubSubMessage { topic, payload })
            })
            .boxed();
        Ok(stream)
    }
}
