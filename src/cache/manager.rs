use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::config::CacheConfig;
use crate::db::{ChannelBinding, MessageLogEntry, Room, RoomPermissions};
use crate::web::metrics::Metrics;

use super::backend::{CacheBackend, PubSubMessage};
use super::events::{
    ChannelUpdateEvent, Invalidation, NewMessageEvent, RoomUpdateEvent, SystemNotification,
    TOPIC_CHANNEL_UPDATE, TOPIC_INVALIDATE, TOPIC_NEW_MESSAGE, TOPIC_ROOM_UPDATE,
    TOPIC_SYSTEM_NOTIFICATION,
};
use super::{CacheError, MemoryCache, RedisCache};

// TTLs match how often the underlying data actually changes.
const TTL_ROOM: Duration = Duration::from_secs(3600);
const TTL_PERMISSIONS: Duration = Duration::from_secs(1800);
const TTL_CHANNEL: Duration = Duration::from_secs(7200);
const TTL_TOMBSTONE: Duration = Duration::from_secs(300);
const TTL_MESSAGE_SNAPSHOT: Duration = Duration::from_secs(300);
const TTL_LIVE_STATS: Duration = Duration::from_secs(60);
const TTL_NOTICE_GATE: Duration = Duration::from_secs(60);

const TOMBSTONE: &str = "__none__";

/// Result of a channel lookup against the cache.
#[derive(Debug, Clone)]
pub enum ChannelLookup {
    /// Channel is bound to a room; the cached subscription snapshot.
    Bound(ChannelBinding),
    /// Negative-cache hit: known not subscribed.
    Tombstone,
    /// Nothing cached; caller must consult the store.
    Miss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_seconds: u64 },
}

/// High-level cache operations for the relay and admin plane.
///
/// All methods degrade gracefully: a cache fault is logged and treated as a
/// miss so the store remains the source of truth.
pub struct CacheManager {
    backend: Arc<dyn CacheBackend>,
}

impl CacheManager {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub async fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let backend: Arc<dyn CacheBackend> = if config.is_memory() {
            Arc::new(MemoryCache::new())
        } else {
            Arc::new(RedisCache::connect(&config.url).await?)
        };
        Ok(Self::new(backend))
    }

    pub fn backend(&self) -> Arc<dyn CacheBackend> {
        self.backend.clone()
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    Metrics::cache_hit();
                    Some(value)
                }
                Err(err) => {
                    warn!("discarding corrupt cache entry key={key}: {err}");
                    Metrics::cache_miss();
                    None
                }
            },
            Ok(None) => {
                Metrics::cache_miss();
                None
            }
            Err(err) => {
                warn!("cache read failed key={key}: {err}");
                Metrics::cache_miss();
                None
            }
        }
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(raw) => {
                if let Err(err) = self.backend.set(key, &raw, Some(ttl)).await {
                    warn!("cache write failed key={key}: {err}");
                }
            }
            Err(err) => warn!("cache serialize failed key={key}: {err}"),
        }
    }

    async fn delete(&self, key: &str) {
        if let Err(err) = self.backend.delete(key).await {
            warn!("cache delete failed key={key}: {err}");
        }
    }

    // Room snapshots.

    pub async fn get_room(&self, room_id: i64) -> Option<Room> {
        self.get_json(&format!("room:{room_id}")).await
    }

    pub async fn set_room(&self, room: &Room) {
        self.set_json(&format!("room:{}", room.id), room, TTL_ROOM)
            .await;
    }

    pub async fn invalidate_room(&self, room_id: i64) {
        self.delete(&format!("room:{room_id}")).await;
    }

    // Permission snapshots.

    pub async fn get_permissions(&self, room_id: i64) -> Option<RoomPermissions> {
        self.get_json(&format!("perms:{room_id}")).await
    }

    pub async fn set_permissions(&self, permissions: &RoomPermissions) {
        self.set_json(
            &format!("perms:{}", permissions.room_id),
            permissions,
            TTL_PERMISSIONS,
        )
        .await;
    }

    pub async fn invalidate_permissions(&self, room_id: i64) {
        self.delete(&format!("perms:{room_id}")).await;
    }

    // Channel-to-room lookups with negative caching.

    pub async fn lookup_channel(&self, guild_id: &str, channel_id: &str) -> ChannelLookup {
        let key = format!("chan:{guild_id}:{channel_id}");
        match self.backend.get(&key).await {
            Ok(Some(raw)) if raw == TOMBSTONE => {
                Metrics::cache_hit();
                ChannelLookup::Tombstone
            }
            Ok(Some(raw)) => match serde_json::from_str::<ChannelBinding>(&raw) {
                Ok(binding) => {
                    Metrics::cache_hit();
                    ChannelLookup::Bound(binding)
                }
                Err(_) => {
                    warn!("discarding corrupt channel mapping key={key}");
                    Metrics::cache_miss();
                    ChannelLookup::Miss
                }
            },
            Ok(None) => {
                Metrics::cache_miss();
                ChannelLookup::Miss
            }
            Err(err) => {
                warn!("cache read failed key={key}: {err}");
                Metrics::cache_miss();
                ChannelLookup::Miss
            }
        }
    }

    pub async fn set_channel_binding(&self, binding: &ChannelBinding) {
        self.set_json(
            &format!("chan:{}:{}", binding.guild_id, binding.channel_id),
            binding,
            TTL_CHANNEL,
        )
        .await;
    }

    pub async fn set_channel_tombstone(&self, guild_id: &str, channel_id: &str) {
        let key = format!("chan:{guild_id}:{channel_id}");
        if let Err(err) = self.backend.set(&key, TOMBSTONE, Some(TTL_TOMBSTONE)).await {
            warn!("cache write failed key={key}: {err}");
        }
    }

    pub async fn invalidate_channel(&self, guild_id: &str, channel_id: &str) {
        self.delete(&format!("chan:{guild_id}:{channel_id}")).await;
    }

    // Ban markers. A positive marker saves a store read on every message
    // from a banned guild; absence always falls through to the store.

    pub async fn get_ban_marker(&self, guild_id: &str) -> Option<bool> {
        match self.backend.get(&format!("ban:{guild_id}")).await {
            Ok(Some(raw)) => Some(raw == "1"),
            _ => None,
        }
    }

    pub async fn set_ban_marker(&self, guild_id: &str, banned: bool) {
        let key = format!("ban:{guild_id}");
        let value = if banned { "1" } else { "0" };
        if let Err(err) = self.backend.set(&key, value, Some(TTL_TOMBSTONE)).await {
            warn!("cache write failed key={key}: {err}");
        }
    }

    pub async fn invalidate_ban_marker(&self, guild_id: &str) {
        self.delete(&format!("ban:{guild_id}")).await;
    }

    // Sliding-window rate limiting. INCR linearizes concurrent submissions;
    // the first writer arms the expiry.

    pub async fn rate_hit(
        &self,
        room_id: i64,
        user_id: &str,
        window: Duration,
    ) -> Result<RateDecision, CacheError> {
        if window.is_zero() {
            return Ok(RateDecision::Allowed);
        }

        let key = format!("rate:{room_id}:{user_id}");
        let count = self.backend.incr(&key).await?;
        if count == 1 {
            self.backend.expire(&key, window).await?;
            return Ok(RateDecision::Allowed);
        }

        let retry_after_seconds = self
            .backend
            .ttl(&key)
            .await?
            .map(|ttl| ttl.as_secs().max(1))
            .unwrap_or_else(|| window.as_secs());
        Ok(RateDecision::Limited {
            retry_after_seconds,
        })
    }

    // Duplicate suppression: remembers the last message body per author and
    // guild for the duration of the rate window.

    pub async fn is_duplicate(&self, guild_id: &str, user_id: &str, content: &str) -> bool {
        let key = format!("dup:{guild_id}:{user_id}");
        let previous = self.backend.get(&key).await.ok().flatten();
        let duplicate = previous.as_deref() == Some(content);
        if let Err(err) = self
            .backend
            .set(&key, content, Some(TTL_NOTICE_GATE))
            .await
        {
            warn!("cache write failed key={key}: {err}");
        }
        duplicate
    }

    // Recent relayed messages, kept hot for reply resolution.

    pub async fn get_message_snapshot(
        &self,
        room_id: i64,
        message_id: &str,
    ) -> Option<MessageLogEntry> {
        self.get_json(&format!("msg:{room_id}:{message_id}")).await
    }

    pub async fn set_message_snapshot(&self, entry: &MessageLogEntry) {
        self.set_json(
            &format!("msg:{}:{}", entry.room_id, entry.source_message_id),
            entry,
            TTL_MESSAGE_SNAPSHOT,
        )
        .await;
    }

    // Live stats aggregate.

    pub async fn get_live_stats(&self) -> Option<serde_json::Value> {
        self.get_json("live_stats").await
    }

    pub async fn set_live_stats(&self, stats: &serde_json::Value) {
        self.set_json("live_stats", stats, TTL_LIVE_STATS).await;
    }

    // Admin sessions, keyed by token hash so raw tokens never land in the
    // cache.

    pub async fn put_session(&self, token_hash: &str, claims_json: &str, ttl: Duration) {
        let key = format!("session:{token_hash}");
        if let Err(err) = self.backend.set(&key, claims_json, Some(ttl)).await {
            warn!("cache write failed key={key}: {err}");
        }
    }

    pub async fn session_exists(&self, token_hash: &str) -> bool {
        matches!(
            self.backend.get(&format!("session:{token_hash}")).await,
            Ok(Some(_))
        )
    }

    pub async fn drop_session(&self, token_hash: &str) {
        self.delete(&format!("session:{token_hash}")).await;
    }

    // Admin API fixed-window rate limit.

    pub async fn api_rate_hit(
        &self,
        username: &str,
        limit: u32,
        window: Duration,
    ) -> Result<bool, CacheError> {
        let key = format!("api_rate:{username}");
        let count = self.backend.incr(&key).await?;
        if count == 1 {
            self.backend.expire(&key, window).await?;
        }
        Ok(count <= limit as i64)
    }

    /// Gate for ephemeral rejection notices: at most one per user per
    /// failure kind per minute.
    pub async fn notice_gate(&self, user_id: &str, kind: &str) -> bool {
        self.backend
            .set_nx(&format!("notice:{user_id}:{kind}"), "1", TTL_NOTICE_GATE)
            .await
            .unwrap_or(true)
    }

    /// Drops every entry named by an invalidation event. Safe to apply more
    /// than once.
    pub async fn apply_invalidation(&self, invalidation: &Invalidation) {
        match invalidation {
            Invalidation::Room { room_id } => {
                self.invalidate_room(*room_id).await;
                self.invalidate_permissions(*room_id).await;
            }
            Invalidation::Permissions { room_id } => {
                self.invalidate_permissions(*room_id).await;
            }
            Invalidation::Channel {
                guild_id,
                channel_id,
            } => {
                self.invalidate_channel(guild_id, channel_id).await;
            }
            Invalidation::Ban { guild_id } => {
                self.invalidate_ban_marker(guild_id).await;
            }
        }
    }

    // Publishing. All fire-and-forget: a lost event only extends staleness
    // until the TTL catches up.

    async fn publish_json<T: Serialize>(&self, topic: &str, payload: &T) {
        match serde_json::to_string(payload) {
            Ok(raw) => {
                if let Err(err) = self.backend.publish(topic, &raw).await {
                    warn!("publish failed topic={topic}: {err}");
                }
            }
            Err(err) => warn!("publish serialize failed topic={topic}: {err}"),
        }
    }

    pub async fn publish_invalidation(&self, invalidation: &Invalidation) {
        self.apply_invalidation(invalidation).await;
        self.publish_json(TOPIC_INVALIDATE, invalidation).await;
    }

    pub async fn publish_new_message(&self, event: &NewMessageEvent) {
        self.publish_json(TOPIC_NEW_MESSAGE, event).await;
    }

    pub async fn publish_room_update(&self, event: &RoomUpdateEvent) {
        self.publish_json(TOPIC_ROOM_UPDATE, event).await;
    }

    pub async fn publish_channel_update(&self, event: &ChannelUpdateEvent) {
        self.publish_json(TOPIC_CHANNEL_UPDATE, event).await;
    }

    pub async fn publish_system_notification(&self, event: &SystemNotification) {
        self.publish_json(TOPIC_SYSTEM_NOTIFICATION, event).await;
    }

    pub async fn subscribe(
        &self,
        topics: &[&str],
    ) -> Result<BoxStream<'static, PubSubMessage>, CacheError> {
        self.backend.subscribe(topics).await
    }

    /// Connectivity probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend
            .set("health:ping", "1", Some(Duration::from_secs(5)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn memory_manager() -> CacheManager {
        CacheManager::new(Arc::new(MemoryCache::new()))
    }

    fn sample_binding() -> ChannelBinding {
        ChannelBinding {
            id: 1,
            room_id: 42,
            guild_id: "g".to_string(),
            channel_id: "c".to_string(),
            guild_name: "guild".to_string(),
            channel_name: "channel".to_string(),
            registered_by: "admin".to_string(),
            registered_at: chrono::Utc::now(),
            is_active: true,
            last_message_at: None,
        }
    }

    #[tokio::test]
    async fn channel_lookup_distinguishes_tombstone_from_miss() {
        let cache = memory_manager();
        assert!(matches!(
            cache.lookup_channel("g", "c").await,
            ChannelLookup::Miss
        ));

        cache.set_channel_tombstone("g", "c").await;
        assert!(matches!(
            cache.lookup_channel("g", "c").await,
            ChannelLookup::Tombstone
        ));

        cache.set_channel_binding(&sample_binding()).await;
        match cache.lookup_channel("g", "c").await {
            ChannelLookup::Bound(binding) => assert_eq!(binding.room_id, 42),
            other => panic!("expected bound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_hit_allows_first_then_limits() {
        let cache = memory_manager();
        let window = Duration::from_secs(5);

        assert_eq!(
            cache.rate_hit(1, "u", window).await.unwrap(),
            RateDecision::Allowed
        );
        match cache.rate_hit(1, "u", window).await.unwrap() {
            RateDecision::Limited {
                retry_after_seconds,
            } => assert!(retry_after_seconds >= 1 && retry_after_seconds <= 5),
            other => panic!("expected limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_hit_with_zero_window_is_disabled() {
        let cache = memory_manager();
        for _ in 0..3 {
            assert_eq!(
                cache.rate_hit(1, "u", Duration::ZERO).await.unwrap(),
                RateDecision::Allowed
            );
        }
    }

    #[tokio::test]
    async fn notice_gate_throttles_repeat_notices() {
        let cache = memory_manager();
        assert!(cache.notice_gate("u", "rate_limited").await);
        assert!(!cache.notice_gate("u", "rate_limited").await);
        // A different failure kind has its own gate.
        assert!(cache.notice_gate("u", "urls_disallowed").await);
    }

    #[tokio::test]
    async fn duplicate_detection_tracks_last_content() {
        let cache = memory_manager();
        assert!(!cache.is_duplicate("g", "u", "hello").await);
        assert!(cache.is_duplicate("g", "u", "hello").await);
        assert!(!cache.is_duplicate("g", "u", "different").await);
    }

    #[tokio::test]
    async fn invalidation_is_idempotent() {
        let cache = memory_manager();
        cache.set_channel_binding(&sample_binding()).await;

        let event = Invalidation::Channel {
            guild_id: "g".to_string(),
            channel_id: "c".to_string(),
        };
        cache.apply_invalidation(&event).await;
        assert!(matches!(
            cache.lookup_channel("g", "c").await,
            ChannelLookup::Miss
        ));
        // Applying the same event again has no further observable effect.
        cache.apply_invalidation(&event).await;
        assert!(matches!(
            cache.lookup_channel("g", "c").await,
            ChannelLookup::Miss
        ));
    }

    #[tokio::test]
    async fn publish_invalidation_also_reaches_subscribers() {
        let cache = memory_manager();
        let mut stream = cache
            .subscribe(&[super::TOPIC_INVALIDATE])
            .await
            .expect("subscribe");

        cache
            .publish_invalidation(&Invalidation::Room { room_id: 3 })
            .await;

        let message = stream.next().await.expect("event");
        let parsed: Invalidation = serde_json::from_str(&message.payload).expect("json");
        assert_eq!(parsed, Invalidation::Room { room_id: 3 });
    }
}
