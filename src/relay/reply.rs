use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::CacheManager;
use crate::db::MessageStore;

use super::format;
use super::platform::ChatPlatform;
use super::InboundEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOrigin {
    /// Reply to an ordinary user message.
    Native,
    /// Reply to one of our own envelopes.
    Relayed,
    /// Reply to an envelope that itself carried a reply header; depth is
    /// capped at one level by quoting only the envelope's own author.
    RelayedNested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    pub author_display: String,
    pub quoted_text: String,
    pub origin: ReplyOrigin,
}

/// Reconstructs reply context across relay boundaries. Reads the cache and
/// the message log, falls back to a platform fetch; never writes the store.
pub struct ReplyResolver {
    cache: Arc<CacheManager>,
    messages: Arc<dyn MessageStore>,
    platform: Arc<dyn ChatPlatform>,
}

impl ReplyResolver {
    pub fn new(
        cache: Arc<CacheManager>,
        messages: Arc<dyn MessageStore>,
        platform: Arc<dyn ChatPlatform>,
    ) -> Self {
        Self {
            cache,
            messages,
            platform,
        }
    }

    pub async fn resolve(&self, event: &InboundEvent, room_id: i64) -> Option<ReplyContext> {
        let reference_id = event.referenced_message_id.as_deref()?;

        // Recently relayed messages sit in the cache; older ones in the log.
        if let Some(snapshot) = self.cache.get_message_snapshot(room_id, reference_id).await {
            return Some(ReplyContext {
                author_display: snapshot.author_display,
                quoted_text: format::truncate_quote(&snapshot.content),
                origin: ReplyOrigin::Relayed,
            });
        }

        match self.messages.get_by_source_message_id(reference_id).await {
            Ok(Some(entry)) => {
                return Some(ReplyContext {
                    author_display: entry.author_display,
                    quoted_text: format::truncate_quote(&entry.content),
                    origin: ReplyOrigin::Relayed,
                });
            }
            Ok(None) => {}
            Err(err) => debug!("reply log lookup failed message_id={reference_id}: {err}"),
        }

        let fetched = match self
            .platform
            .fetch_message(&event.channel_id, reference_id)
            .await
        {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("referenced message not found message_id={reference_id}");
                return None;
            }
            Err(err) => {
                debug!("referenced message fetch failed message_id={reference_id}: {err}");
                return None;
            }
        };

        if fetched.from_self {
            // One of our own envelopes: decode it back to author + content.
            if let Some(parsed) = format::parse(&fetched.content) {
                let origin = if parsed.reply.is_some() {
                    ReplyOrigin::RelayedNested
                } else {
                    ReplyOrigin::Relayed
                };
                return Some(ReplyContext {
                    author_display: parsed.author_display,
                    quoted_text: format::truncate_quote(&parsed.body),
                    origin,
                });
            }
            debug!("own message did not parse as envelope message_id={reference_id}");
        }

        let quoted = if fetched.content.is_empty() {
            if fetched.attachments.is_empty() {
                "[no text content]".to_string()
            } else {
                "[attachment]".to_string()
            }
        } else {
            format::truncate_quote(&fetched.content)
        };

        Some(ReplyContext {
            author_display: fetched.author_display,
            quoted_text: quoted,
            origin: ReplyOrigin::Native,
        })
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::StoreConfig;
    use crate::db::DatabaseManager;
    use crate::relay::platform::{PlatformMessage, SendError};
    use crate::relay::format::{render, Envelope, ReplyHeader};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    struct FakePlatform {
        messages: Mutex<HashMap<String, PlatformMessage>>,
    }

    impl FakePlatform {
        fn new() -> Self {
            Self {
                messages: Mutex::new(HashMap::new()),
            }
        }

        fn insert(&self, message: PlatformMessage) {
            self.messages
                .lock()
                .unwrap()
                .insert(message.id.clone(), message);
        }
    }

    #[async_trait]
    impl ChatPlatform for FakePlatform {
        async fn send_message(&self, _: &str, _: &str) -> Result<String, SendError> {
            Ok("sent".to_string())
        }

        async fn fetch_message(
            &self,
            _: &str,
            message_id: &str,
        ) -> Result<Option<PlatformMessage>, SendError> {
            Ok(self.messages.lock().unwrap().get(message_id).cloned())
        }

        async fn notify_user(&self, _: &str, _: &str) -> Result<(), SendError> {
            Ok(())
        }
    }

    async fn fixture() -> (ReplyResolver, Arc<FakePlatform>, NamedTempFile) {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = StoreConfig {
            url: format!("sqlite://{}", file.path().to_string_lossy()),
            pool_size: 1,
            pool_overflow: 0,
        };
        let store = DatabaseManager::new(&config).await.expect("store");
        store.migrate().await.expect("migrate");
        let platform = Arc::new(FakePlatform::new());
        let resolver = ReplyResolver::new(
            Arc::new(CacheManager::new(Arc::new(MemoryCache::new()))),
            store.message_store(),
            platform.clone(),
        );
        (resolver, platform, file)
    }

    fn reply_event(reference: &str) -> InboundEvent {
        InboundEvent {
            guild_id: "g1".to_string(),
            channel_id: "c1".to_string(),
            message_id: "m2".to_string(),
            author_id: "u2".to_string(),
            author_display: "bob".to_string(),
            author_is_bot: false,
            content: "replying".to_string(),
            attachments: Vec::new(),
            referenced_message_id: Some(reference.to_string()),
        }
    }

    #[tokio::test]
    async fn no_reference_means_no_reply() {
        let (resolver, _platform, _file) = fixture().await;
        let mut event = reply_event("m1");
        event.referenced_message_id = None;
        assert!(resolver.resolve(&event, 1).await.is_none());
    }

    #[tokio::test]
    async fn native_reply_uses_referenced_author_directly() {
        let (resolver, platform, _file) = fixture().await;
        platform.insert(PlatformMessage {
            id: "m1".to_string(),
            channel_id: "c1".to_string(),
            author_id: "u1".to_string(),
            author_display: "alice".to_string(),
            from_self: false,
            content: "original words".to_string(),
            attachments: Vec::new(),
        });

        let context = resolver
            .resolve(&reply_event("m1"), 1)
            .await
            .expect("context");
        assert_eq!(context.author_display, "alice");
        assert_eq!(context.quoted_text, "original words");
        assert_eq!(context.origin, ReplyOrigin::Native);
    }

    #[tokio::test]
    async fn reply_to_own_envelope_recovers_original_author() {
        let (resolver, platform, _file) = fixture().await;
        let envelope = render(&Envelope {
            author_display: "alice".to_string(),
            body: "hi from guild A".to_string(),
            reply: None,
            attachments: Vec::new(),
            guild_name: "Guild A".to_string(),
            permalink: "https://discord.com/channels/1/2/3".to_string(),
        });
        platform.insert(PlatformMessage {
            id: "m1".to_string(),
            channel_id: "c1".to_string(),
            author_id: "bot".to_string(),
            author_display: "relay".to_string(),
            from_self: true,
            content: envelope,
            attachments: Vec::new(),
        });

        let context = resolver
            .resolve(&reply_event("m1"), 1)
            .await
            .expect("context");
        assert_eq!(context.author_display, "alice");
        assert_eq!(context.quoted_text, "hi from guild A");
        assert_eq!(context.origin, ReplyOrigin::Relayed);
    }

    #[tokio::test]
    async fn nested_reply_is_depth_capped_to_innermost_author() {
        let (resolver, platform, _file) = fixture().await;
        let envelope = render(&Envelope {
            author_display: "carol".to_string(),
            body: "the nested answer".to_string(),
            reply: Some(ReplyHeader {
                author_display: "alice".to_string(),
                quote: "hi from guild A".to_string(),
            }),
            attachments: Vec::new(),
            guild_name: "Guild B".to_string(),
            permalink: "https://discord.com/channels/4/5/6".to_string(),
        });
        platform.insert(PlatformMessage {
            id: "m1".to_string(),
            channel_id: "c1".to_string(),
            author_id: "bot".to_string(),
            author_display: "relay".to_string(),
            from_self: true,
            content: envelope,
            attachments: Vec::new(),
        });

        let context = resolver
            .resolve(&reply_event("m1"), 1)
            .await
            .expect("context");
        // Only the envelope's own author surfaces, not the older chain.
        assert_eq!(context.author_display, "carol");
        assert_eq!(context.quoted_text, "the nested answer");
        assert_eq!(context.origin, ReplyOrigin::RelayedNested);
    }

    #[tokio::test]
    async fn missing_reference_degrades_to_none() {
        let (resolver, _platform, _file) = fixture().await;
        assert!(resolver.resolve(&reply_event("gone"), 1).await.is_none());
    }
}
