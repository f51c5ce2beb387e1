use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use super::CacheError;

/// A message received from the pub/sub bus.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub topic: String,
    pub payload: String,
}

/// Low-level key/value + pub/sub operations.
///
/// The backend is chosen by the `CACHE_URL` scheme: `redis://` talks to a
/// shared Redis, `memory://` keeps everything in-process (single-node
/// deployments and tests). Keys are plain strings partitioned by prefix; no
/// cross-key transaction is ever required.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<(), CacheError>;
    /// Sets only when absent; returns whether the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Atomic increment, creating the key at 1.
    async fn incr(&self, key: &str) -> Result<i64, CacheError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;
    /// Remaining TTL, `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), CacheError>;
    /// Opens a dedicated subscription for the given topics.
    async fn subscribe(
        &self,
        topics: &[&str],
    ) -> Result<BoxStream<'static, PubSubMessage>, CacheError>;
}
