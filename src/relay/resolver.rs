use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheManager, ChannelLookup};
use crate::db::{ChannelBinding, DatabaseError, DatabaseManager, Room, RoomPermissions};

use super::PolicyRejection;

/// A coherent routing snapshot captured by value. Store mutations after the
/// snapshot do not affect an in-flight relay.
#[derive(Debug, Clone)]
pub struct RouteSnapshot {
    pub room: Room,
    pub permissions: RoomPermissions,
    pub binding: ChannelBinding,
}

#[derive(Debug)]
pub enum RouteOutcome {
    Routed(Box<RouteSnapshot>),
    Rejected(PolicyRejection),
}

/// Maps an inbound channel to its room and permissions, cache first with
/// tombstone negative caching, store on miss.
pub struct Resolver {
    store: Arc<DatabaseManager>,
    cache: Arc<CacheManager>,
}

impl Resolver {
    pub fn new(store: Arc<DatabaseManager>, cache: Arc<CacheManager>) -> Self {
        Self { store, cache }
    }

    pub async fn resolve(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<RouteOutcome, DatabaseError> {
        let binding = match self.cache.lookup_channel(guild_id, channel_id).await {
            ChannelLookup::Tombstone => {
                return Ok(RouteOutcome::Rejected(PolicyRejection::NotSubscribed));
            }
            ChannelLookup::Bound(binding) => binding,
            ChannelLookup::Miss => {
                match self
                    .store
                    .channel_store()
                    .get_active_binding(guild_id, channel_id)
                    .await?
                {
                    Some(binding) => {
                        self.cache.set_channel_binding(&binding).await;
                        binding
                    }
                    None => {
                        self.cache.set_channel_tombstone(guild_id, channel_id).await;
                        return Ok(RouteOutcome::Rejected(PolicyRejection::NotSubscribed));
                    }
                }
            }
        };

        let room = match self.cache.get_room(binding.room_id).await {
            Some(room) => room,
            None => match self.store.room_store().get_room(binding.room_id).await? {
                Some(room) => {
                    self.cache.set_room(&room).await;
                    room
                }
                None => {
                    // Stale mapping pointing at a hard-deleted room.
                    debug!(
                        "dropping stale channel mapping guild={guild_id} channel={channel_id}"
                    );
                    self.cache.invalidate_channel(guild_id, channel_id).await;
                    self.cache.set_channel_tombstone(guild_id, channel_id).await;
                    return Ok(RouteOutcome::Rejected(PolicyRejection::NotSubscribed));
                }
            },
        };

        if !room.is_active {
            return Ok(RouteOutcome::Rejected(PolicyRejection::RoomInactive));
        }

        let permissions = match self.cache.get_permissions(room.id).await {
            Some(permissions) => permissions,
            None => {
                let permissions = self
                    .store
                    .room_store()
                    .get_permissions(room.id)
                    .await?
                    .unwrap_or_else(|| RoomPermissions::defaults(room.id, "system"));
                self.cache.set_permissions(&permissions).await;
                permissions
            }
        };

        let banned = match self.cache.get_ban_marker(guild_id).await {
            Some(banned) => banned,
            None => {
                let banned = self.store.ban_store().is_banned(guild_id).await?;
                self.cache.set_ban_marker(guild_id, banned).await;
                banned
            }
        };
        if banned {
            return Ok(RouteOutcome::Rejected(PolicyRejection::GuildBanned));
        }

        Ok(RouteOutcome::Routed(Box::new(RouteSnapshot {
            room,
            permissions,
            binding,
        })))
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::StoreConfig;
    use crate::db::NewChannelBinding;
    use tempfile::NamedTempFile;

    async fn fixture() -> (Resolver, Arc<DatabaseManager>, Arc<CacheManager>, NamedTempFile)
    {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = StoreConfig {
            url: format!("sqlite://{}", file.path().to_string_lossy()),
            pool_size: 1,
            pool_overflow: 0,
        };
        let store = Arc::new(DatabaseManager::new(&config).await.expect("store"));
        store.migrate().await.expect("migrate");
        let cache = Arc::new(CacheManager::new(Arc::new(MemoryCache::new())));
        let resolver = Resolver::new(store.clone(), cache.clone());
        (resolver, store, cache, file)
    }

    async fn seed_room(store: &DatabaseManager) -> i64 {
        let room = store
            .room_store()
            .create_room("general", "admin", 10)
            .await
            .expect("room");
        store
            .channel_store()
            .register_channel(&NewChannelBinding {
                room_id: room.id,
                guild_id: "g1".to_string(),
                channel_id: "c1".to_string(),
                guild_name: "Guild One".to_string(),
                channel_name: "chat".to_string(),
                registered_by: "admin".to_string(),
            })
            .await
            .expect("binding");
        room.id
    }

    #[tokio::test]
    async fn unknown_channel_resolves_to_not_subscribed_and_tombstones() {
        let (resolver, _store, cache, _file) = fixture().await;

        let outcome = resolver.resolve("g9", "c9").await.expect("resolve");
        assert!(matches!(
            outcome,
            RouteOutcome::Rejected(PolicyRejection::NotSubscribed)
        ));

        // Second probe hits the tombstone, not the store.
        assert!(matches!(
            cache.lookup_channel("g9", "c9").await,
            crate::cache::ChannelLookup::Tombstone
        ));
    }

    #[tokio::test]
    async fn subscribed_channel_resolves_with_snapshot() {
        let (resolver, store, _cache, _file) = fixture().await;
        let room_id = seed_room(&store).await;

        match resolver.resolve("g1", "c1").await.expect("resolve") {
            RouteOutcome::Routed(snapshot) => {
                assert_eq!(snapshot.room.id, room_id);
                assert_eq!(snapshot.binding.guild_name, "Guild One");
                assert_eq!(snapshot.permissions.room_id, room_id);
            }
            other => panic!("expected route, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inactive_room_is_rejected() {
        let (resolver, store, _cache, _file) = fixture().await;
        let room_id = seed_room(&store).await;
        store
            .room_store()
            .update_room(
                room_id,
                &crate::db::RoomPatch {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .expect("deactivate");

        assert!(matches!(
            resolver.resolve("g1", "c1").await.expect("resolve"),
            RouteOutcome::Rejected(PolicyRejection::RoomInactive)
        ));
    }

    #[tokio::test]
    async fn banned_guild_is_rejected_until_marker_invalidated() {
        let (resolver, store, cache, _file) = fixture().await;
        seed_room(&store).await;

        store
            .ban_store()
            .ban_guild("g1", "Guild One", "spam", "admin")
            .await
            .expect("ban");

        assert!(matches!(
            resolver.resolve("g1", "c1").await.expect("resolve"),
            RouteOutcome::Rejected(PolicyRejection::GuildBanned)
        ));

        store
            .ban_store()
            .unban_guild("g1", "admin")
            .await
            .expect("unban");
        cache.invalidate_ban_marker("g1").await;

        assert!(matches!(
            resolver.resolve("g1", "c1").await.expect("resolve"),
            RouteOutcome::Routed(_)
        ));
    }
}
