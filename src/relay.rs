use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{
    CacheManager, Invalidation, NewMessageEvent, RateDecision, SystemNotification,
    TOPIC_INVALIDATE,
};
use crate::db::{DatabaseManager, MessageLogEntry, NewMessageLogEntry};
use crate::utils::preview_text;
use crate::web::metrics::Metrics;

pub mod fanout;
pub mod filter;
pub mod format;
pub mod platform;
pub mod rate_limit;
pub mod reply;
pub mod resolver;

use self::fanout::FanOutEngine;
use self::filter::{ContentFilter, FilterOutcome};
use self::platform::ChatPlatform;
use self::rate_limit::RateLimiter;
use self::reply::ReplyResolver;
use self::resolver::{Resolver, RouteOutcome, RouteSnapshot};

/// One inbound platform event, as handed over by the gateway.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub guild_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub author_id: String,
    pub author_display: String,
    pub author_is_bot: bool,
    pub content: String,
    pub attachments: Vec<String>,
    pub referenced_message_id: Option<String>,
}

/// The expected policy outcomes. None of these are failures: they are
/// dropped (some with an ephemeral notice to the author) and never fanned
/// out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyRejection {
    NotSubscribed,
    GuildBanned,
    RoomInactive,
    RateLimited { retry_after_seconds: u64 },
    TooLong { max_len: usize },
    UrlsDisallowed,
    AttachmentsDisallowed,
    BannedWord,
    DuplicateMessage,
}

impl PolicyRejection {
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyRejection::NotSubscribed => "not_subscribed",
            PolicyRejection::GuildBanned => "guild_banned",
            PolicyRejection::RoomInactive => "room_inactive",
            PolicyRejection::RateLimited { .. } => "rate_limited",
            PolicyRejection::TooLong { .. } => "too_long",
            PolicyRejection::UrlsDisallowed => "urls_disallowed",
            PolicyRejection::AttachmentsDisallowed => "attachments_disallowed",
            PolicyRejection::BannedWord => "banned_word",
            PolicyRejection::DuplicateMessage => "duplicate_message",
        }
    }

    /// The ephemeral notice shown to the author, `None` for silent drops.
    pub fn user_message(&self, room_name: &str) -> Option<String> {
        match self {
            PolicyRejection::NotSubscribed
            | PolicyRejection::GuildBanned
            | PolicyRejection::RoomInactive
            | PolicyRejection::DuplicateMessage => None,
            PolicyRejection::RateLimited {
                retry_after_seconds,
            } => Some(format!(
                "You are sending messages too quickly in **{room_name}**. Try again in {retry_after_seconds}s."
            )),
            PolicyRejection::TooLong { max_len } => Some(format!(
                "Your message exceeds the {max_len} character limit of **{room_name}** and was not relayed."
            )),
            PolicyRejection::UrlsDisallowed => Some(format!(
                "Links are not allowed in **{room_name}**. Your message was not relayed."
            )),
            PolicyRejection::AttachmentsDisallowed => Some(format!(
                "File attachments are not allowed in **{room_name}**. Your message was not relayed."
            )),
            PolicyRejection::BannedWord => Some(format!(
                "Your message contains blocked content and was not relayed to **{room_name}**."
            )),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Bot-authored or otherwise out of scope; nothing happened.
    Ignored,
    Dropped(PolicyRejection),
    Relayed { delivered: i32, failed: i32 },
}

/// Orchestrates the relay pipeline for each inbound event. All per-event
/// state lives on the stack; the only shared mutability is the metric
/// counters and the fan-out queues.
pub struct RelayCoordinator {
    store: Arc<DatabaseManager>,
    cache: Arc<CacheManager>,
    platform: Arc<dyn ChatPlatform>,
    resolver: Resolver,
    filter: ContentFilter,
    rate_limiter: RateLimiter,
    reply_resolver: ReplyResolver,
    fanout: Arc<FanOutEngine>,
}

impl RelayCoordinator {
    pub fn new(
        store: Arc<DatabaseManager>,
        cache: Arc<CacheManager>,
        platform: Arc<dyn ChatPlatform>,
        fanout: Arc<FanOutEngine>,
    ) -> Self {
        Self {
            resolver: Resolver::new(store.clone(), cache.clone()),
            filter: ContentFilter::new(),
            rate_limiter: RateLimiter::new(cache.clone()),
            reply_resolver: ReplyResolver::new(
                cache.clone(),
                store.message_store(),
                platform.clone(),
            ),
            store,
            cache,
            platform,
            fanout,
        }
    }

    /// Entry point for the gateway callback: processes the event on its own
    /// task so the platform dispatch loop is never blocked.
    pub fn handle_event(self: &Arc<Self>, event: InboundEvent) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(err) = coordinator.process(event).await {
                error!("relay pipeline error: {err:#}");
                // Infrastructure faults get surfaced to dashboards, but at
                // most once a minute so an outage cannot storm the bus.
                if coordinator.cache.notice_gate("relay", "pipeline_error").await {
                    coordinator
                        .cache
                        .publish_system_notification(&SystemNotification {
                            level: "error".to_string(),
                            message: format!("relay pipeline error: {err:#}"),
                            component: "relay".to_string(),
                        })
                        .await;
                }
            }
        });
    }

    /// Runs the full pipeline for one event and waits for fan-out and
    /// logging to complete.
    pub async fn process(&self, event: InboundEvent) -> Result<RelayOutcome> {
        if event.author_is_bot {
            return Ok(RelayOutcome::Ignored);
        }
        Metrics::message_received();

        debug!(
            "inbound message guild={} channel={} author={} content_preview={}",
            event.guild_id,
            event.channel_id,
            event.author_id,
            preview_text(&event.content)
        );

        let snapshot = match self.resolver.resolve(&event.guild_id, &event.channel_id).await? {
            RouteOutcome::Routed(snapshot) => *snapshot,
            RouteOutcome::Rejected(rejection) => {
                return Ok(self.reject(&event, None, rejection).await);
            }
        };

        match self
            .rate_limiter
            .check(
                snapshot.room.id,
                &event.author_id,
                snapshot.permissions.rate_limit_seconds,
            )
            .await?
        {
            RateDecision::Allowed => {}
            RateDecision::Limited {
                retry_after_seconds,
            } => {
                let rejection = PolicyRejection::RateLimited {
                    retry_after_seconds,
                };
                return Ok(self.reject(&event, Some(&snapshot), rejection).await);
            }
        }

        if self
            .cache
            .is_duplicate(&event.guild_id, &event.author_id, event.content.trim())
            .await
        {
            return Ok(self
                .reject(&event, Some(&snapshot), PolicyRejection::DuplicateMessage)
                .await);
        }

        let filtered = match self.filter.apply(
            &event.content,
            &event.attachments,
            &snapshot.permissions,
        ) {
            FilterOutcome::Accepted(filtered) => filtered,
            FilterOutcome::Rejected(rejection) => {
                return Ok(self.reject(&event, Some(&snapshot), rejection).await);
            }
        };

        let reply = self.reply_resolver.resolve(&event, snapshot.room.id).await;

        let envelope = format::render(&format::Envelope {
            author_display: event.author_display.clone(),
            body: filtered.text.clone(),
            reply: reply.as_ref().map(|context| format::ReplyHeader {
                author_display: context.author_display.clone(),
                quote: context.quoted_text.clone(),
            }),
            attachments: filtered.attachments.clone(),
            guild_name: snapshot.binding.guild_name.clone(),
            permalink: format::permalink(
                &event.guild_id,
                &event.channel_id,
                &event.message_id,
            ),
        });

        let targets: Vec<_> = self
            .store
            .channel_store()
            .list_room_channels(snapshot.room.id, true)
            .await?
            .into_iter()
            .filter(|target| {
                !(target.guild_id == event.guild_id && target.channel_id == event.channel_id)
            })
            .collect();

        let ticket = self
            .fanout
            .dispatch(snapshot.room.id, envelope, &targets)
            .await;
        let outcome = self.fanout.await_outcome(ticket).await;

        self.finalize(&event, &snapshot, &filtered.text, &filtered.attachments, reply, outcome)
            .await;

        Metrics::message_relayed();
        Ok(RelayOutcome::Relayed {
            delivered: outcome.delivered,
            failed: outcome.failed,
        })
    }

    async fn reject(
        &self,
        event: &InboundEvent,
        snapshot: Option<&RouteSnapshot>,
        rejection: PolicyRejection,
    ) -> RelayOutcome {
        Metrics::message_dropped();
        debug!(
            "message dropped guild={} channel={} author={} reason={}",
            event.guild_id,
            event.channel_id,
            event.author_id,
            rejection.kind()
        );

        let room_name = snapshot.map(|s| s.room.name.as_str()).unwrap_or("the room");
        if let Some(notice) = rejection.user_message(room_name) {
            // At most one notice per user per failure kind per minute.
            if self.cache.notice_gate(&event.author_id, rejection.kind()).await {
                if let Err(err) = self.platform.notify_user(&event.author_id, &notice).await {
                    debug!("author notice failed user={}: {err}", event.author_id);
                }
            }
        }

        RelayOutcome::Dropped(rejection)
    }

    async fn finalize(
        &self,
        event: &InboundEvent,
        snapshot: &RouteSnapshot,
        content: &str,
        attachments: &[String],
        reply: Option<reply::ReplyContext>,
        outcome: fanout::FanOutOutcome,
    ) {
        let now = Utc::now();
        let entry = NewMessageLogEntry {
            room_id: snapshot.room.id,
            source_guild_id: event.guild_id.clone(),
            source_channel_id: event.channel_id.clone(),
            source_message_id: event.message_id.clone(),
            author_id: event.author_id.clone(),
            author_display: event.author_display.clone(),
            guild_name: snapshot.binding.guild_name.clone(),
            content: content.to_string(),
            attachments: attachments.to_vec(),
            reply_to_message_id: event.referenced_message_id.clone(),
            reply_to_username: reply.as_ref().map(|r| r.author_display.clone()),
            reply_to_content: reply.as_ref().map(|r| r.quoted_text.clone()),
            timestamp: now,
            delivered_count: outcome.delivered,
            failed_count: outcome.failed,
        };

        if let Err(err) = self.store.message_store().append(&entry).await {
            warn!("message log append failed: {err}");
        }

        self.cache
            .set_message_snapshot(&MessageLogEntry {
                id: 0,
                room_id: entry.room_id,
                source_guild_id: entry.source_guild_id.clone(),
                source_channel_id: entry.source_channel_id.clone(),
                source_message_id: entry.source_message_id.clone(),
                author_id: entry.author_id.clone(),
                author_display: entry.author_display.clone(),
                guild_name: entry.guild_name.clone(),
                content: entry.content.clone(),
                attachments: entry.attachments.clone(),
                reply_to_message_id: entry.reply_to_message_id.clone(),
                reply_to_username: entry.reply_to_username.clone(),
                reply_to_content: entry.reply_to_content.clone(),
                timestamp: entry.timestamp,
                delivered_count: entry.delivered_count,
                failed_count: entry.failed_count,
            })
            .await;

        if let Err(err) = self
            .store
            .channel_store()
            .touch_last_message(&event.guild_id, &event.channel_id, now)
            .await
        {
            debug!("last_message_at update failed: {err}");
        }

        self.cache
            .publish_new_message(&NewMessageEvent {
                room_id: snapshot.room.id,
                room_name: snapshot.room.name.clone(),
                guild_name: snapshot.binding.guild_name.clone(),
                author_display: event.author_display.clone(),
                content: preview_text(content),
                delivered_count: outcome.delivered,
                failed_count: outcome.failed,
                timestamp: now,
            })
            .await;
    }
}

/// Applies `invalidate` events from the bus to the local cache view.
///
/// The admin plane already drops keys before publishing; replaying the event
/// here is what keeps multi-process deployments coherent, and it is
/// idempotent by construction.
pub fn spawn_invalidation_listener(cache: Arc<CacheManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = match cache.subscribe(&[TOPIC_INVALIDATE]).await {
            Ok(stream) => stream,
            Err(err) => {
                error!("invalidation listener failed to subscribe: {err}");
                return;
            }
        };
        info!("invalidation listener started");

        while let Some(message) = stream.next().await {
            match serde_json::from_str::<Invalidation>(&message.payload) {
                Ok(invalidation) => cache.apply_invalidation(&invalidation).await,
                Err(err) => debug!("ignoring unknown invalidation payload: {err}"),
            }
        }
        info!("invalidation listener stopped");
    })
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::platform::{PlatformMessage, SendError};
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::StoreConfig;
    use crate::db::NewChannelBinding;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// In-memory platform: records sends and notices, serves fetches from
    /// what it previously "sent".
    #[derive(Default)]
    struct FakePlatform {
        sends: Mutex<Vec<PlatformMessage>>,
        notices: Mutex<Vec<(String, String)>>,
    }

    impl FakePlatform {
        fn sent(&self) -> Vec<PlatformMessage> {
            self.sends.lock().unwrap().clone()
        }

        fn sent_to(&self, channel_id: &str) -> Vec<PlatformMessage> {
            self.sent()
                .into_iter()
                .filter(|m| m.channel_id == channel_id)
                .collect()
        }

        fn notices(&self) -> Vec<(String, String)> {
            self.notices.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatPlatform for FakePlatform {
        async fn send_message(
            &self,
            channel_id: &str,
            content: &str,
        ) -> Result<String, SendError> {
            let mut sends = self.sends.lock().unwrap();
            let id = format!("bot-{}", sends.len() + 1);
            sends.push(PlatformMessage {
                id: id.clone(),
                channel_id: channel_id.to_string(),
                author_id: "bot".to_string(),
                author_display: "relay".to_string(),
                from_self: true,
                content: content.to_string(),
                attachments: Vec::new(),
            });
            Ok(id)
        }

        async fn fetch_message(
            &self,
            channel_id: &str,
            message_id: &str,
        ) -> Result<Option<PlatformMessage>, SendError> {
            Ok(self
                .sends
                .lock()
                .unwrap()
                .iter()
                .find(|m| m.id == message_id && m.channel_id == channel_id)
                .cloned())
        }

        async fn notify_user(&self, user_id: &str, content: &str) -> Result<(), SendError> {
            self.notices
                .lock()
                .unwrap()
                .push((user_id.to_string(), content.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        coordinator: RelayCoordinator,
        store: Arc<DatabaseManager>,
        cache: Arc<CacheManager>,
        platform: Arc<FakePlatform>,
        room_id: i64,
        _file: NamedTempFile,
    }

    async fn fixture() -> Fixture {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = StoreConfig {
            url: format!("sqlite://{}", file.path().to_string_lossy()),
            pool_size: 1,
            pool_overflow: 0,
        };
        let store = Arc::new(DatabaseManager::new(&config).await.expect("store"));
        store.migrate().await.expect("migrate");
        let cache = Arc::new(CacheManager::new(Arc::new(MemoryCache::new())));
        let platform = Arc::new(FakePlatform::default());

        let room = store
            .room_store()
            .create_room("general", "admin", 3)
            .await
            .expect("room");
        // Most scenarios exercise a single rule; the rate window is opted
        // into by the tests that need it.
        store
            .room_store()
            .update_permissions(
                room.id,
                &crate::db::PermissionsPatch {
                    rate_limit_seconds: Some(0),
                    ..Default::default()
                },
                "admin",
            )
            .await
            .expect("permissions");
        for (guild, channel, name) in [
            ("gA", "cA", "Guild A"),
            ("gB", "cB", "Guild B"),
            ("gC", "cC", "Guild C"),
        ] {
            store
                .channel_store()
                .register_channel(&NewChannelBinding {
                    room_id: room.id,
                    guild_id: guild.to_string(),
                    channel_id: channel.to_string(),
                    guild_name: name.to_string(),
                    channel_name: "chat".to_string(),
                    registered_by: "admin".to_string(),
                })
                .await
                .expect("binding");
        }

        let fanout = Arc::new(FanOutEngine::new(
            platform.clone(),
            store.channel_store(),
            cache.clone(),
            32,
            3,
        ));
        let coordinator = RelayCoordinator::new(
            store.clone(),
            cache.clone(),
            platform.clone(),
            fanout,
        );

        Fixture {
            coordinator,
            store,
            cache,
            platform,
            room_id: room.id,
            _file: file,
        }
    }

    fn event(guild: &str, channel: &str, message_id: &str, author: &str, content: &str) -> InboundEvent {
        InboundEvent {
            guild_id: guild.to_string(),
            channel_id: channel.to_string(),
            message_id: message_id.to_string(),
            author_id: author.to_string(),
            author_display: format!("{author}-display"),
            author_is_bot: false,
            content: content.to_string(),
            attachments: Vec::new(),
            referenced_message_id: None,
        }
    }

    #[tokio::test]
    async fn message_fans_out_to_all_other_subscriptions() {
        let fx = fixture().await;

        let outcome = fx
            .coordinator
            .process(event("gA", "cA", "m1", "u1", "hi"))
            .await
            .expect("process");
        assert_eq!(outcome, RelayOutcome::Relayed { delivered: 2, failed: 0 });

        // The source channel never receives a copy.
        assert!(fx.platform.sent_to("cA").is_empty());
        assert_eq!(fx.platform.sent_to("cB").len(), 1);
        assert_eq!(fx.platform.sent_to("cC").len(), 1);
        assert!(fx.platform.sent_to("cB")[0].content.contains("hi"));

        let log = fx
            .store
            .message_store()
            .get_by_source_message_id("m1")
            .await
            .expect("query")
            .expect("logged");
        assert_eq!(log.delivered_count, 2);
        assert_eq!(log.failed_count, 0);
        assert_eq!(log.content, "hi");
    }

    #[tokio::test]
    async fn bot_messages_are_ignored() {
        let fx = fixture().await;
        let mut ev = event("gA", "cA", "m1", "u1", "hi");
        ev.author_is_bot = true;
        assert_eq!(
            fx.coordinator.process(ev).await.expect("process"),
            RelayOutcome::Ignored
        );
        assert!(fx.platform.sent().is_empty());
    }

    #[tokio::test]
    async fn unsubscribed_channel_drops_silently() {
        let fx = fixture().await;
        let outcome = fx
            .coordinator
            .process(event("gZ", "cZ", "m1", "u1", "hi"))
            .await
            .expect("process");
        assert_eq!(outcome, RelayOutcome::Dropped(PolicyRejection::NotSubscribed));
        assert!(fx.platform.sent().is_empty());
        assert!(fx.platform.notices().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_allows_one_message_per_window() {
        let fx = fixture().await;
        fx.store
            .room_store()
            .update_permissions(
                fx.room_id,
                &crate::db::PermissionsPatch {
                    rate_limit_seconds: Some(5),
                    ..Default::default()
                },
                "admin",
            )
            .await
            .expect("permissions");

        let first = fx
            .coordinator
            .process(event("gA", "cA", "m1", "u1", "one"))
            .await
            .expect("process");
        assert_eq!(first, RelayOutcome::Relayed { delivered: 2, failed: 0 });

        let second = fx
            .coordinator
            .process(event("gA", "cA", "m2", "u1", "two"))
            .await
            .expect("process");
        assert!(matches!(
            second,
            RelayOutcome::Dropped(PolicyRejection::RateLimited { .. })
        ));

        // No envelope for "two" anywhere, and the author got one notice.
        assert!(fx
            .platform
            .sent()
            .iter()
            .all(|m| !m.content.contains("two")));
        assert_eq!(fx.platform.notices().len(), 1);
        assert!(fx.platform.notices()[0].1.contains("too quickly"));
    }

    #[tokio::test]
    async fn url_rejection_notifies_author_without_fanout() {
        let fx = fixture().await;

        let outcome = fx
            .coordinator
            .process(event("gA", "cA", "m1", "u1", "check https://example.com"))
            .await
            .expect("process");
        assert_eq!(outcome, RelayOutcome::Dropped(PolicyRejection::UrlsDisallowed));

        assert!(fx.platform.sent().is_empty());
        let notices = fx.platform.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, "u1");
        assert!(notices[0].1.contains("general"));
    }

    #[tokio::test]
    async fn notice_storms_are_throttled_per_kind() {
        let fx = fixture().await;

        for i in 0..3 {
            fx.coordinator
                .process(event(
                    "gA",
                    "cA",
                    &format!("m{i}"),
                    "u1",
                    &format!("https://example.com/{i}"),
                ))
                .await
                .expect("process");
        }
        assert_eq!(fx.platform.notices().len(), 1);
    }

    #[tokio::test]
    async fn native_reply_to_relayed_envelope_names_original_author() {
        let fx = fixture().await;

        fx.coordinator
            .process(event("gA", "cA", "m1", "alice", "hi"))
            .await
            .expect("first relay");

        // Someone in guild B replies (platform-native) to the envelope the
        // bot posted in cB.
        let bot_message_id = fx.platform.sent_to("cB")[0].id.clone();
        let mut reply_event = event("gB", "cB", "m2", "bob", "welcome!");
        reply_event.referenced_message_id = Some(bot_message_id);

        let outcome = fx
            .coordinator
            .process(reply_event)
            .await
            .expect("reply relay");
        assert_eq!(outcome, RelayOutcome::Relayed { delivered: 2, failed: 0 });

        let to_a = fx.platform.sent_to("cA");
        assert_eq!(to_a.len(), 1);
        let parsed = format::parse(&to_a[0].content).expect("envelope");
        assert_eq!(parsed.author_display, "bob-display");
        let reply = parsed.reply.expect("reply header");
        assert_eq!(reply.author_display, "alice-display");
        assert!(reply.quote.contains("hi"));
    }

    #[tokio::test]
    async fn banned_guild_is_isolated_until_unban() {
        let fx = fixture().await;

        fx.store
            .ban_store()
            .ban_guild("gB", "Guild B", "spam", "admin")
            .await
            .expect("ban");
        fx.cache
            .publish_invalidation(&Invalidation::Ban {
                guild_id: "gB".to_string(),
            })
            .await;

        let outcome = fx
            .coordinator
            .process(event("gB", "cB", "m1", "u1", "hello"))
            .await
            .expect("process");
        assert_eq!(outcome, RelayOutcome::Dropped(PolicyRejection::GuildBanned));
        assert!(fx.platform.sent().is_empty());

        fx.store
            .ban_store()
            .unban_guild("gB", "admin")
            .await
            .expect("unban");
        fx.cache
            .publish_invalidation(&Invalidation::Ban {
                guild_id: "gB".to_string(),
            })
            .await;

        let outcome = fx
            .coordinator
            .process(event("gB", "cB", "m2", "u1", "hello again"))
            .await
            .expect("process");
        assert_eq!(outcome, RelayOutcome::Relayed { delivered: 2, failed: 0 });
    }

    #[tokio::test]
    async fn deleted_room_stops_relaying_after_invalidation() {
        let fx = fixture().await;

        let bindings = fx
            .store
            .channel_store()
            .list_room_channels(fx.room_id, true)
            .await
            .expect("bindings");
        fx.store
            .room_store()
            .delete_room(fx.room_id)
            .await
            .expect("delete");
        fx.cache
            .publish_invalidation(&Invalidation::Room { room_id: fx.room_id })
            .await;
        for binding in &bindings {
            fx.cache
                .publish_invalidation(&Invalidation::Channel {
                    guild_id: binding.guild_id.clone(),
                    channel_id: binding.channel_id.clone(),
                })
                .await;
        }

        let outcome = fx
            .coordinator
            .process(event("gA", "cA", "m1", "u1", "hi"))
            .await
            .expect("process");
        assert_eq!(outcome, RelayOutcome::Dropped(PolicyRejection::NotSubscribed));
    }

    #[tokio::test]
    async fn duplicate_messages_are_suppressed() {
        let fx = fixture().await;

        fx.coordinator
            .process(event("gA", "cA", "m1", "u1", "same words"))
            .await
            .expect("first");
        let outcome = fx
            .coordinator
            .process(event("gA", "cA", "m2", "u1", "same words"))
            .await
            .expect("second");
        assert_eq!(
            outcome,
            RelayOutcome::Dropped(PolicyRejection::DuplicateMessage)
        );
        assert_eq!(fx.platform.sent().len(), 2);
    }

    #[tokio::test]
    async fn relay_updates_last_message_timestamp() {
        let fx = fixture().await;

        fx.coordinator
            .process(event("gA", "cA", "m1", "u1", "hi"))
            .await
            .expect("process");

        let bindings = fx
            .store
            .channel_store()
            .list_guild_channels("gA")
            .await
            .expect("bindings");
        assert!(bindings[0].last_message_at.is_some());
    }
}
