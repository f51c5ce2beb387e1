use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheError, CacheManager, RateDecision};

/// Sliding window per (room, author), linearized by the cache's atomic
/// increment. No locks are taken on the relay path.
pub struct RateLimiter {
    cache: Arc<CacheManager>,
}

impl RateLimiter {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self { cache }
    }

    /// `window_seconds == 0` disables limiting for the room.
    pub async fn check(
        &self,
        room_id: i64,
        author_id: &str,
        window_seconds: i32,
    ) -> Result<RateDecision, CacheError> {
        let window = Duration::from_secs(window_seconds.max(0) as u64);
        self.cache.rate_hit(room_id, author_id, window).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(CacheManager::new(Arc::new(MemoryCache::new()))))
    }

    #[tokio::test]
    async fn second_message_within_window_is_limited() {
        let limiter = limiter();
        assert_eq!(
            limiter.check(1, "alice", 5).await.unwrap(),
            RateDecision::Allowed
        );
        assert!(matches!(
            limiter.check(1, "alice", 5).await.unwrap(),
            RateDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn windows_are_scoped_per_room_and_user() {
        let limiter = limiter();
        limiter.check(1, "alice", 5).await.unwrap();
        assert_eq!(
            limiter.check(2, "alice", 5).await.unwrap(),
            RateDecision::Allowed
        );
        assert_eq!(
            limiter.check(1, "bob", 5).await.unwrap(),
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn zero_window_disables_limiting() {
        let limiter = limiter();
        for _ in 0..5 {
            assert_eq!(
                limiter.check(1, "alice", 0).await.unwrap(),
                RateDecision::Allowed
            );
        }
    }
}
