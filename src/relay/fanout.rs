use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, ChannelUpdateEvent, Invalidation};
use crate::db::{ChannelBinding, ChannelStore};
use crate::web::metrics::Metrics;

use super::platform::{ChatPlatform, SendError};

const WORKER_QUEUE_CAPACITY: usize = 256;
const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 8_000;
const RETRY_JITTER_MS: u64 = 250;

struct Delivery {
    room_id: i64,
    guild_id: String,
    channel_id: String,
    content: Arc<String>,
    room_limit: Arc<Semaphore>,
    result_tx: mpsc::Sender<bool>,
}

/// Handle for collecting one event's delivery results.
pub struct FanOutTicket {
    rx: mpsc::Receiver<bool>,
    expected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutOutcome {
    pub delivered: i32,
    pub failed: i32,
}

/// Parallel per-subscription delivery.
///
/// One FIFO queue and worker per target channel preserves arrival order
/// within each target; a per-room semaphore caps concurrent platform sends;
/// across targets no ordering is promised.
pub struct FanOutEngine {
    platform: Arc<dyn ChatPlatform>,
    channels: Arc<dyn ChannelStore>,
    cache: Arc<CacheManager>,
    per_room_concurrency: usize,
    retry_max: u32,
    accepting: AtomicBool,
    workers: Mutex<HashMap<String, mpsc::Sender<Delivery>>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    room_limits: StdMutex<HashMap<i64, Arc<Semaphore>>>,
}

impl FanOutEngine {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        channels: Arc<dyn ChannelStore>,
        cache: Arc<CacheManager>,
        per_room_concurrency: usize,
        retry_max: u32,
    ) -> Self {
        Self {
            platform,
            channels,
            cache,
            per_room_concurrency: per_room_concurrency.max(1),
            retry_max: retry_max.max(1),
            accepting: AtomicBool::new(true),
            workers: Mutex::new(HashMap::new()),
            handles: StdMutex::new(Vec::new()),
            room_limits: StdMutex::new(HashMap::new()),
        }
    }

    fn room_limit(&self, room_id: i64) -> Arc<Semaphore> {
        let mut limits = self
            .room_limits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        limits
            .entry(room_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_room_concurrency)))
            .clone()
    }

    /// Enqueues one delivery per target. Targets must already exclude the
    /// source subscription.
    pub async fn dispatch(
        &self,
        room_id: i64,
        content: String,
        targets: &[ChannelBinding],
    ) -> FanOutTicket {
        let (result_tx, rx) = mpsc::channel(targets.len().max(1));

        if !self.accepting.load(Ordering::SeqCst) {
            debug!("fan-out rejected during shutdown room_id={room_id}");
            return FanOutTicket { rx, expected: 0 };
        }

        let content = Arc::new(content);
        let room_limit = self.room_limit(room_id);
        let mut expected = 0usize;

        for target in targets {
            let delivery = Delivery {
                room_id,
                guild_id: target.guild_id.clone(),
                channel_id: target.channel_id.clone(),
                content: content.clone(),
                room_limit: room_limit.clone(),
                result_tx: result_tx.clone(),
            };
            if self.enqueue(delivery).await {
                expected += 1;
            }
        }

        FanOutTicket { rx, expected }
    }

    async fn enqueue(&self, delivery: Delivery) -> bool {
        let channel_key = delivery.channel_id.clone();
        let mut workers = self.workers.lock().await;
        let sender = match workers.get(&channel_key) {
            Some(sender) if !sender.is_closed() => sender.clone(),
            _ => {
                let (tx, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
                let handle = tokio::spawn(Self::worker_loop(
                    self.platform.clone(),
                    self.channels.clone(),
                    self.cache.clone(),
                    self.retry_max,
                    rx,
                ));
                self.handles
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(handle);
                workers.insert(channel_key.clone(), tx.clone());
                tx
            }
        };
        drop(workers);

        if let Err(err) = sender.send(delivery).await {
            warn!("delivery queue closed channel={channel_key}: {err}");
            return false;
        }
        true
    }

    async fn worker_loop(
        platform: Arc<dyn ChatPlatform>,
        channels: Arc<dyn ChannelStore>,
        cache: Arc<CacheManager>,
        retry_max: u32,
        mut rx: mpsc::Receiver<Delivery>,
    ) {
        while let Some(delivery) = rx.recv().await {
            let _permit = delivery
                .room_limit
                .clone()
                .acquire_owned()
                .await
                .expect("room semaphore is never closed");

            let ok =
                Self::deliver_with_retry(&platform, &channels, &cache, retry_max, &delivery)
                    .await;
            if ok {
                Metrics::delivery_ok();
            } else {
                Metrics::delivery_failed();
            }
            let _ = delivery.result_tx.send(ok).await;
        }
    }

    async fn deliver_with_retry(
        platform: &Arc<dyn ChatPlatform>,
        channels: &Arc<dyn ChannelStore>,
        cache: &Arc<CacheManager>,
        retry_max: u32,
        delivery: &Delivery,
    ) -> bool {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match platform
                .send_message(&delivery.channel_id, &delivery.content)
                .await
            {
                Ok(_) => return true,
                Err(SendError::Transient(reason)) if attempt < retry_max => {
                    Metrics::delivery_retried();
                    let delay = backoff_delay(attempt);
                    debug!(
                        "transient delivery failure channel={} attempt={attempt}: {reason}; retrying in {:?}",
                        delivery.channel_id, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(SendError::Transient(reason)) => {
                    warn!(
                        "delivery exhausted retries channel={} attempts={attempt}: {reason}",
                        delivery.channel_id
                    );
                    return false;
                }
                Err(SendError::Permanent(reason)) => {
                    warn!(
                        "permanent delivery failure channel={}: {reason}; deactivating subscription",
                        delivery.channel_id
                    );
                    Self::deactivate_target(channels, cache, delivery).await;
                    return false;
                }
            }
        }
    }

    async fn deactivate_target(
        channels: &Arc<dyn ChannelStore>,
        cache: &Arc<CacheManager>,
        delivery: &Delivery,
    ) {
        if let Err(err) = channels
            .deactivate_binding(&delivery.guild_id, &delivery.channel_id)
            .await
        {
            warn!(
                "failed to deactivate subscription guild={} channel={}: {err}",
                delivery.guild_id, delivery.channel_id
            );
        }
        cache
            .publish_invalidation(&Invalidation::Channel {
                guild_id: delivery.guild_id.clone(),
                channel_id: delivery.channel_id.clone(),
            })
            .await;
        cache
            .publish_channel_update(&ChannelUpdateEvent {
                action: "deactivated".to_string(),
                room_id: delivery.room_id,
                guild_id: delivery.guild_id.clone(),
                channel_id: delivery.channel_id.clone(),
            })
            .await;
    }

    /// Collects the per-target results for one event.
    pub async fn await_outcome(&self, mut ticket: FanOutTicket) -> FanOutOutcome {
        let mut delivered = 0i32;
        let mut failed = 0i32;
        for _ in 0..ticket.expected {
            match ticket.rx.recv().await {
                Some(true) => delivered += 1,
                Some(false) => failed += 1,
                None => break,
            }
        }
        FanOutOutcome { delivered, failed }
    }

    /// Stops accepting new work and drains the per-target queues up to the
    /// deadline.
    pub async fn shutdown(&self, deadline: Duration) {
        self.accepting.store(false, Ordering::SeqCst);

        let senders: Vec<_> = {
            let mut workers = self.workers.lock().await;
            workers.drain().map(|(_, sender)| sender).collect()
        };
        drop(senders);

        let handles: Vec<_> = {
            let mut handles = self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handles.drain(..).collect()
        };

        let drain = futures_util::future::join_all(handles);
        match tokio::time::timeout(deadline, drain).await {
            Ok(_) => info!("fan-out queues drained"),
            Err(_) => warn!("fan-out drain deadline exceeded, abandoning remaining deliveries"),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY_MS.saturating_mul(1u64 << (attempt.min(6) - 1));
    let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER_MS);
    Duration::from_millis(exp.min(RETRY_MAX_DELAY_MS) + jitter)
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, TOPIC_CHANNEL_UPDATE};
    use crate::config::StoreConfig;
    use crate::db::{DatabaseManager, NewChannelBinding};
    use crate::relay::platform::PlatformMessage;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    #[derive(Default)]
    struct FakePlatform {
        sends: Mutex<Vec<(String, String)>>,
        transient_failures: Mutex<HashMap<String, u32>>,
        permanent_channels: Mutex<Vec<String>>,
    }

    impl FakePlatform {
        fn sent(&self) -> Vec<(String, String)> {
            self.sends.lock().unwrap().clone()
        }

        fn fail_transiently(&self, channel_id: &str, times: u32) {
            self.transient_failures
                .lock()
                .unwrap()
                .insert(channel_id.to_string(), times);
        }

        fn fail_permanently(&self, channel_id: &str) {
            self.permanent_channels
                .lock()
                .unwrap()
                .push(channel_id.to_string());
        }
    }

    #[async_trait]
    impl ChatPlatform for FakePlatform {
        async fn send_message(
            &self,
            channel_id: &str,
            content: &str,
        ) -> Result<String, SendError> {
            if self
                .permanent_channels
                .lock()
                .unwrap()
                .contains(&channel_id.to_string())
            {
                return Err(SendError::Permanent("forbidden".to_string()));
            }

            {
                let mut failures = self.transient_failures.lock().unwrap();
                if let Some(remaining) = failures.get_mut(channel_id) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(SendError::Transient("timeout".to_string()));
                    }
                }
            }

            self.sends
                .lock()
                .unwrap()
                .push((channel_id.to_string(), content.to_string()));
            Ok(format!("sent-{}", self.sends.lock().unwrap().len()))
        }

        async fn fetch_message(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Option<PlatformMessage>, SendError> {
            Ok(None)
        }

        async fn notify_user(&self, _: &str, _: &str) -> Result<(), SendError> {
            Ok(())
        }
    }

    async fn fixture() -> (
        FanOutEngine,
        Arc<FakePlatform>,
        Arc<DatabaseManager>,
        Arc<CacheManager>,
        Vec<ChannelBinding>,
        NamedTempFile,
    ) {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = StoreConfig {
            url: format!("sqlite://{}", file.path().to_string_lossy()),
            pool_size: 1,
            pool_overflow: 0,
        };
        let store = Arc::new(DatabaseManager::new(&config).await.expect("store"));
        store.migrate().await.expect("migrate");
        let room = store
            .room_store()
            .create_room("general", "admin", 10)
            .await
            .expect("room");

        let mut targets = Vec::new();
        for (guild, channel) in [("gB", "cB"), ("gC", "cC")] {
            targets.push(
                store
                    .channel_store()
                    .register_channel(&NewChannelBinding {
                        room_id: room.id,
                        guild_id: guild.to_string(),
                        channel_id: channel.to_string(),
                        guild_name: format!("Guild {guild}"),
                        channel_name: "chat".to_string(),
                        registered_by: "admin".to_string(),
                    })
                    .await
                    .expect("binding"),
            );
        }

        let platform = Arc::new(FakePlatform::default());
        let cache = Arc::new(CacheManager::new(Arc::new(MemoryCache::new())));
        let engine = FanOutEngine::new(
            platform.clone(),
            store.channel_store(),
            cache.clone(),
            32,
            3,
        );
        (engine, platform, store, cache, targets, file)
    }

    #[tokio::test]
    async fn delivers_to_every_target_and_counts() {
        let (engine, platform, _store, _cache, targets, _file) = fixture().await;

        let ticket = engine.dispatch(1, "payload".to_string(), &targets).await;
        let outcome = engine.await_outcome(ticket).await;

        assert_eq!(outcome, FanOutOutcome { delivered: 2, failed: 0 });
        let sent = platform.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().any(|(channel, _)| channel == "cB"));
        assert!(sent.iter().any(|(channel, _)| channel == "cC"));
    }

    #[tokio::test]
    async fn per_target_deliveries_stay_fifo() {
        let (engine, platform, _store, _cache, targets, _file) = fixture().await;
        let single = vec![targets[0].clone()];

        let mut tickets = Vec::new();
        for i in 0..5 {
            tickets.push(engine.dispatch(1, format!("msg-{i}"), &single).await);
        }
        for ticket in tickets {
            engine.await_outcome(ticket).await;
        }

        let contents: Vec<String> = platform
            .sent()
            .into_iter()
            .map(|(_, content)| content)
            .collect();
        assert_eq!(contents, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let (engine, platform, _store, _cache, targets, _file) = fixture().await;
        platform.fail_transiently("cB", 2);

        let ticket = engine.dispatch(1, "payload".to_string(), &targets).await;
        let outcome = engine.await_outcome(ticket).await;

        assert_eq!(outcome, FanOutOutcome { delivered: 2, failed: 0 });
    }

    #[tokio::test]
    async fn exhausted_retries_count_as_failures() {
        let (engine, platform, _store, _cache, targets, _file) = fixture().await;
        platform.fail_transiently("cB", 10);

        let ticket = engine.dispatch(1, "payload".to_string(), &targets).await;
        let outcome = engine.await_outcome(ticket).await;

        assert_eq!(outcome, FanOutOutcome { delivered: 1, failed: 1 });
    }

    #[tokio::test]
    async fn permanent_failure_deactivates_subscription_and_publishes() {
        let (engine, platform, store, cache, targets, _file) = fixture().await;
        platform.fail_permanently("cB");

        let mut updates = cache
            .subscribe(&[TOPIC_CHANNEL_UPDATE])
            .await
            .expect("subscribe");

        let ticket = engine.dispatch(1, "payload".to_string(), &targets).await;
        let outcome = engine.await_outcome(ticket).await;
        assert_eq!(outcome, FanOutOutcome { delivered: 1, failed: 1 });

        assert!(store
            .channel_store()
            .get_active_binding("gB", "cB")
            .await
            .expect("query")
            .is_none());

        let event = updates.next().await.expect("channel update");
        let parsed: ChannelUpdateEvent = serde_json::from_str(&event.payload).expect("json");
        assert_eq!(parsed.channel_id, "cB");
        assert_eq!(parsed.action, "deactivated");
    }

    #[tokio::test]
    async fn shutdown_drains_pending_work() {
        let (engine, platform, _store, _cache, targets, _file) = fixture().await;

        let ticket = engine.dispatch(1, "payload".to_string(), &targets).await;
        engine.await_outcome(ticket).await;
        engine.shutdown(Duration::from_secs(5)).await;

        assert_eq!(platform.sent().len(), 2);

        // After shutdown new dispatches are refused.
        let ticket = engine.dispatch(1, "late".to_string(), &targets).await;
        let outcome = engine.await_outcome(ticket).await;
        assert_eq!(outcome, FanOutOutcome { delivered: 0, failed: 0 });
    }
}
