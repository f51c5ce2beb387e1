use crate::config::{StoreConfig, StoreType as ConfigStoreType};
use crate::db::{BanStore, ChannelStore, DatabaseError, MessageStore, RoomStore};
use std::sync::Arc;

#[cfg(feature = "postgres")]
use crate::db::postgres::{
    PostgresBanStore, PostgresChannelStore, PostgresMessageStore, PostgresRoomStore,
};
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};
#[cfg(feature = "postgres")]
use diesel::RunQueryDsl;

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{
    SqliteBanStore, SqliteChannelStore, SqliteMessageStore, SqliteRoomStore,
};
#[cfg(feature = "sqlite")]
use diesel::sqlite::SqliteConnection;
#[cfg(feature = "sqlite")]
use diesel::Connection;
#[cfg(feature = "sqlite")]
use diesel::RunQueryDsl as _;

/// Owns the store backends and hands out trait objects for each concern.
///
/// The backend is chosen by the `STORE_URL` scheme: `postgres://` runs on an
/// r2d2 pool, `sqlite://` opens a dedicated connection per call.
#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    room_store: Arc<dyn RoomStore>,
    channel_store: Arc<dyn ChannelStore>,
    ban_store: Arc<dyn BanStore>,
    message_store: Arc<dyn MessageStore>,
    store_type: StoreType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreType {
    Postgres,
    Sqlite,
}

impl From<ConfigStoreType> for StoreType {
    fn from(value: ConfigStoreType) -> Self {
        match value {
            ConfigStoreType::Postgres => StoreType::Postgres,
            ConfigStoreType::Sqlite => StoreType::Sqlite,
        }
    }
}

impl DatabaseManager {
    pub async fn new(config: &StoreConfig) -> Result<Self, DatabaseError> {
        let store_type = StoreType::from(config.store_type());

        match store_type {
            #[cfg(feature = "postgres")]
            StoreType::Postgres => {
                let manager = ConnectionManager::<PgConnection>::new(config.url.clone());
                let pool = r2d2::Pool::builder()
                    .max_size(config.max_connections())
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                let room_store = Arc::new(PostgresRoomStore::new(pool.clone()));
                let channel_store = Arc::new(PostgresChannelStore::new(pool.clone()));
                let ban_store = Arc::new(PostgresBanStore::new(pool.clone()));
                let message_store = Arc::new(PostgresMessageStore::new(pool.clone()));

                Ok(Self {
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    room_store,
                    channel_store,
                    ban_store,
                    message_store,
                    store_type,
                })
            }
            #[cfg(feature = "sqlite")]
            StoreType::Sqlite => {
                let path = config
                    .sqlite_path()
                    .ok_or_else(|| DatabaseError::Connection("invalid sqlite url".to_string()))?;
                let path_arc = Arc::new(path.clone());

                let room_store = Arc::new(SqliteRoomStore::new(path_arc.clone()));
                let channel_store = Arc::new(SqliteChannelStore::new(path_arc.clone()));
                let ban_store = Arc::new(SqliteBanStore::new(path_arc.clone()));
                let message_store = Arc::new(SqliteMessageStore::new(path_arc));

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    sqlite_path: Some(path),
                    room_store,
                    channel_store,
                    ban_store,
                    message_store,
                    store_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            StoreType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            StoreType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    /// Applies the forward-only boot migration.
    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match self.store_type {
            #[cfg(feature = "postgres")]
            StoreType::Postgres => {
                let pool = self.postgres_pool.as_ref().ok_or_else(|| {
                    DatabaseError::Migration("postgres pool not initialized".to_string())
                })?;
                Self::migrate_postgres(pool).await
            }
            #[cfg(feature = "sqlite")]
            StoreType::Sqlite => {
                let path = self.sqlite_path.as_ref().ok_or_else(|| {
                    DatabaseError::Migration("sqlite path not initialized".to_string())
                })?;
                Self::migrate_sqlite(path).await
            }
            #[cfg(not(feature = "postgres"))]
            StoreType::Postgres => Err(DatabaseError::Migration(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            StoreType::Sqlite => Err(DatabaseError::Migration(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    #[cfg(feature = "postgres")]
    async fn migrate_postgres(pool: &Pool) -> Result<(), DatabaseError> {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS chat_rooms (
                    id BIGSERIAL PRIMARY KEY,
                    name TEXT NOT NULL,
                    created_by TEXT NOT NULL,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    max_servers INTEGER NOT NULL DEFAULT 50,
                    is_active BOOLEAN NOT NULL DEFAULT TRUE
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS room_permissions (
                    id BIGSERIAL PRIMARY KEY,
                    room_id BIGINT NOT NULL UNIQUE,
                    allow_urls BOOLEAN NOT NULL DEFAULT FALSE,
                    allow_files BOOLEAN NOT NULL DEFAULT FALSE,
                    allow_mentions BOOLEAN NOT NULL DEFAULT TRUE,
                    allow_emojis BOOLEAN NOT NULL DEFAULT TRUE,
                    enable_bad_word_filter BOOLEAN NOT NULL DEFAULT TRUE,
                    max_message_length INTEGER NOT NULL DEFAULT 2000,
                    rate_limit_seconds INTEGER NOT NULL DEFAULT 3,
                    updated_by TEXT NOT NULL,
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS chat_channels (
                    id BIGSERIAL PRIMARY KEY,
                    room_id BIGINT NOT NULL,
                    guild_id TEXT NOT NULL,
                    channel_id TEXT NOT NULL,
                    guild_name TEXT NOT NULL,
                    channel_name TEXT NOT NULL,
                    registered_by TEXT NOT NULL,
                    registered_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    last_message_at TIMESTAMP WITH TIME ZONE
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS guild_bans (
                    id BIGSERIAL PRIMARY KEY,
                    guild_id TEXT NOT NULL UNIQUE,
                    guild_name TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    banned_by TEXT NOT NULL,
                    banned_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    unbanned_at TIMESTAMP WITH TIME ZONE,
                    unbanned_by TEXT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS chat_messages (
                    id BIGSERIAL PRIMARY KEY,
                    room_id BIGINT NOT NULL,
                    source_guild_id TEXT NOT NULL,
                    source_channel_id TEXT NOT NULL,
                    source_message_id TEXT NOT NULL,
                    author_id TEXT NOT NULL,
                    author_display TEXT NOT NULL,
                    guild_name TEXT NOT NULL,
                    content TEXT NOT NULL,
                    attachments TEXT NOT NULL DEFAULT '[]',
                    reply_to_message_id TEXT,
                    reply_to_username TEXT,
                    reply_to_content TEXT,
                    timestamp TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    delivered_count INTEGER NOT NULL DEFAULT 0,
                    failed_count INTEGER NOT NULL DEFAULT 0
                )
                "#,
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_rooms_active_name ON chat_rooms (LOWER(name)) WHERE is_active",
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_channels_guild_channel_active ON chat_channels (guild_id, channel_id) WHERE is_active",
                "CREATE INDEX IF NOT EXISTS idx_channels_room_active ON chat_channels (room_id, is_active)",
                "CREATE INDEX IF NOT EXISTS idx_bans_guild_active ON guild_bans (guild_id, is_active)",
                "CREATE INDEX IF NOT EXISTS idx_messages_room_timestamp ON chat_messages (room_id, timestamp)",
                "CREATE INDEX IF NOT EXISTS idx_messages_guild_timestamp ON chat_messages (source_guild_id, timestamp)",
                "CREATE INDEX IF NOT EXISTS idx_messages_source_id ON chat_messages (source_message_id)",
                "CREATE INDEX IF NOT EXISTS idx_messages_author_timestamp ON chat_messages (author_id, timestamp)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    #[cfg(feature = "sqlite")]
    async fn migrate_sqlite(path: &str) -> Result<(), DatabaseError> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = SqliteConnection::establish(&path)
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS chat_rooms (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    created_by TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    max_servers INTEGER NOT NULL DEFAULT 50,
                    is_active BOOLEAN NOT NULL DEFAULT 1
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS room_permissions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    room_id INTEGER NOT NULL UNIQUE,
                    allow_urls BOOLEAN NOT NULL DEFAULT 0,
                    allow_files BOOLEAN NOT NULL DEFAULT 0,
                    allow_mentions BOOLEAN NOT NULL DEFAULT 1,
                    allow_emojis BOOLEAN NOT NULL DEFAULT 1,
                    enable_bad_word_filter BOOLEAN NOT NULL DEFAULT 1,
                    max_message_length INTEGER NOT NULL DEFAULT 2000,
                    rate_limit_seconds INTEGER NOT NULL DEFAULT 3,
                    updated_by TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS chat_channels (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    room_id INTEGER NOT NULL,
                    guild_id TEXT NOT NULL,
                    channel_id TEXT NOT NULL,
                    guild_name TEXT NOT NULL,
                    channel_name TEXT NOT NULL,
                    registered_by TEXT NOT NULL,
                    registered_at TEXT NOT NULL DEFAULT (datetime('now')),
                    is_active BOOLEAN NOT NULL DEFAULT 1,
                    last_message_at TEXT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS guild_bans (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    guild_id TEXT NOT NULL UNIQUE,
                    guild_name TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    banned_by TEXT NOT NULL,
                    banned_at TEXT NOT NULL DEFAULT (datetime('now')),
                    is_active BOOLEAN NOT NULL DEFAULT 1,
                    unbanned_at TEXT,
                    unbanned_by TEXT
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS chat_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    room_id INTEGER NOT NULL,
                    source_guild_id TEXT NOT NULL,
                    source_channel_id TEXT NOT NULL,
                    source_message_id TEXT NOT NULL,
                    author_id TEXT NOT NULL,
                    author_display TEXT NOT NULL,
                    guild_name TEXT NOT NULL,
                    content TEXT NOT NULL,
                    attachments TEXT NOT NULL DEFAULT '[]',
                    reply_to_message_id TEXT,
                    reply_to_username TEXT,
                    reply_to_content TEXT,
                    timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                    delivered_count INTEGER NOT NULL DEFAULT 0,
                    failed_count INTEGER NOT NULL DEFAULT 0
                )
                "#,
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_rooms_active_name ON chat_rooms (LOWER(name)) WHERE is_active = 1",
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_channels_guild_channel_active ON chat_channels (guild_id, channel_id) WHERE is_active = 1",
                "CREATE INDEX IF NOT EXISTS idx_channels_room_active ON chat_channels (room_id, is_active)",
                "CREATE INDEX IF NOT EXISTS idx_bans_guild_active ON guild_bans (guild_id, is_active)",
                "CREATE INDEX IF NOT EXISTS idx_messages_room_timestamp ON chat_messages (room_id, timestamp)",
                "CREATE INDEX IF NOT EXISTS idx_messages_guild_timestamp ON chat_messages (source_guild_id, timestamp)",
                "CREATE INDEX IF NOT EXISTS idx_messages_source_id ON chat_messages (source_message_id)",
                "CREATE INDEX IF NOT EXISTS idx_messages_author_timestamp ON chat_messages (author_id, timestamp)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn room_store(&self) -> Arc<dyn RoomStore> {
        self.room_store.clone()
    }

    pub fn channel_store(&self) -> Arc<dyn ChannelStore> {
        self.channel_store.clone()
    }

    pub fn ban_store(&self) -> Arc<dyn BanStore> {
        self.ban_store.clone()
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        self.message_store.clone()
    }

    /// Connectivity probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), DatabaseError> {
        self.message_store().live_stats().await.map(|_| ())
    }

    pub fn store_type(&self) -> StoreType {
        self.store_type
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use chrono::Utc;
    use tempfile::NamedTempFile;

    use super::DatabaseManager;
    use crate::config::StoreConfig;
    use crate::db::{MessageFilter, NewChannelBinding, NewMessageLogEntry, RoomPatch};
    use crate::db::DatabaseError;

    async fn test_manager() -> (DatabaseManager, NamedTempFile) {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = StoreConfig {
            url: format!("sqlite://{}", file.path().to_string_lossy()),
            pool_size: 1,
            pool_overflow: 0,
        };
        let manager = DatabaseManager::new(&config).await.expect("db manager");
        manager.migrate().await.expect("migrate");
        (manager, file)
    }

    fn binding(room_id: i64, guild: &str, channel: &str) -> NewChannelBinding {
        NewChannelBinding {
            room_id,
            guild_id: guild.to_string(),
            channel_id: channel.to_string(),
            guild_name: format!("guild {guild}"),
            channel_name: format!("channel {channel}"),
            registered_by: "admin".to_string(),
        }
    }

    #[tokio::test]
    async fn room_name_uniqueness_is_scoped_to_active_rooms() {
        let (manager, _file) = test_manager().await;
        let rooms = manager.room_store();

        let room = rooms.create_room("general", "admin", 3).await.expect("create");
        assert!(matches!(
            rooms.create_room("General", "admin", 3).await,
            Err(DatabaseError::NameTaken)
        ));

        rooms.delete_room(room.id).await.expect("delete");
        rooms
            .create_room("general", "admin", 3)
            .await
            .expect("name reusable after hard delete");
    }

    #[tokio::test]
    async fn create_room_installs_default_permissions() {
        let (manager, _file) = test_manager().await;
        let room = manager
            .room_store()
            .create_room("general", "admin", 3)
            .await
            .expect("create");

        let perms = manager
            .room_store()
            .get_permissions(room.id)
            .await
            .expect("query")
            .expect("permissions exist");
        assert_eq!(perms.max_message_length, 2000);
        assert!(!perms.allow_urls);
    }

    #[tokio::test]
    async fn register_channel_enforces_binding_and_guild_limits() {
        let (manager, _file) = test_manager().await;
        let room = manager
            .room_store()
            .create_room("general", "admin", 2)
            .await
            .expect("create");
        let channels = manager.channel_store();

        channels
            .register_channel(&binding(room.id, "g1", "c1"))
            .await
            .expect("first binding");

        assert!(matches!(
            channels.register_channel(&binding(room.id, "g1", "c1")).await,
            Err(DatabaseError::AlreadyBound)
        ));

        channels
            .register_channel(&binding(room.id, "g2", "c2"))
            .await
            .expect("second guild");

        // A second channel from an existing guild does not consume a slot.
        channels
            .register_channel(&binding(room.id, "g2", "c3"))
            .await
            .expect("same guild extra channel");

        assert!(matches!(
            channels.register_channel(&binding(room.id, "g3", "c4")).await,
            Err(DatabaseError::RoomFull)
        ));
    }

    #[tokio::test]
    async fn register_channel_rejects_banned_and_inactive() {
        let (manager, _file) = test_manager().await;
        let room = manager
            .room_store()
            .create_room("general", "admin", 5)
            .await
            .expect("create");

        manager
            .ban_store()
            .ban_guild("g1", "guild g1", "spam", "admin")
            .await
            .expect("ban");
        assert!(matches!(
            manager
                .channel_store()
                .register_channel(&binding(room.id, "g1", "c1"))
                .await,
            Err(DatabaseError::GuildBanned)
        ));

        manager
            .room_store()
            .update_room(
                room.id,
                &RoomPatch {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .expect("deactivate");
        assert!(matches!(
            manager
                .channel_store()
                .register_channel(&binding(room.id, "g2", "c2"))
                .await,
            Err(DatabaseError::RoomInactive)
        ));
    }

    #[tokio::test]
    async fn delete_room_cascades_but_keeps_log() {
        let (manager, _file) = test_manager().await;
        let room = manager
            .room_store()
            .create_room("general", "admin", 5)
            .await
            .expect("create");
        manager
            .channel_store()
            .register_channel(&binding(room.id, "g1", "c1"))
            .await
            .expect("bind");
        manager
            .message_store()
            .append(&NewMessageLogEntry {
                room_id: room.id,
                source_guild_id: "g1".to_string(),
                source_channel_id: "c1".to_string(),
                source_message_id: "m1".to_string(),
                author_id: "u1".to_string(),
                author_display: "alice".to_string(),
                guild_name: "guild g1".to_string(),
                content: "hi".to_string(),
                attachments: Vec::new(),
                reply_to_message_id: None,
                reply_to_username: None,
                reply_to_content: None,
                timestamp: Utc::now(),
                delivered_count: 2,
                failed_count: 0,
            })
            .await
            .expect("log");

        manager.room_store().delete_room(room.id).await.expect("delete");

        assert!(manager
            .room_store()
            .get_permissions(room.id)
            .await
            .expect("query")
            .is_none());
        assert!(manager
            .channel_store()
            .get_active_binding("g1", "c1")
            .await
            .expect("query")
            .is_none());

        let exported = manager
            .message_store()
            .export(&MessageFilter {
                room_id: Some(room.id),
                limit: 10,
                ..Default::default()
            })
            .await
            .expect("export");
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].delivered_count, 2);
    }

    #[tokio::test]
    async fn ban_unban_roundtrip_keeps_audit_row() {
        let (manager, _file) = test_manager().await;
        let bans = manager.ban_store();

        bans.ban_guild("g1", "guild g1", "spam", "admin")
            .await
            .expect("ban");
        assert!(bans.is_banned("g1").await.expect("check"));

        let unbanned = bans.unban_guild("g1", "admin").await.expect("unban");
        assert!(!unbanned.is_active);
        assert!(unbanned.unbanned_at.is_some());
        assert!(!bans.is_banned("g1").await.expect("check"));

        let all = bans.list_bans(true).await.expect("list");
        assert_eq!(all.len(), 1);

        // Re-banning reactivates the same audit row.
        bans.ban_guild("g1", "guild g1", "again", "admin")
            .await
            .expect("re-ban");
        let all = bans.list_bans(false).await.expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].reason, "again");
    }

    #[tokio::test]
    async fn message_log_supports_reply_lookup_and_stats() {
        let (manager, _file) = test_manager().await;
        let room = manager
            .room_store()
            .create_room("general", "admin", 5)
            .await
            .expect("create");

        for i in 0..3 {
            manager
                .message_store()
                .append(&NewMessageLogEntry {
                    room_id: room.id,
                    source_guild_id: "g1".to_string(),
                    source_channel_id: "c1".to_string(),
                    source_message_id: format!("m{i}"),
                    author_id: "u1".to_string(),
                    author_display: "alice".to_string(),
                    guild_name: "guild g1".to_string(),
                    content: format!("message {i}"),
                    attachments: Vec::new(),
                    reply_to_message_id: None,
                    reply_to_username: None,
                    reply_to_content: None,
                    timestamp: Utc::now(),
                    delivered_count: 1,
                    failed_count: 0,
                })
                .await
                .expect("append");
        }

        let found = manager
            .message_store()
            .get_by_source_message_id("m1")
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(found.content, "message 1");

        let stats = manager
            .message_store()
            .room_stats(room.id, 7)
            .await
            .expect("stats");
        assert_eq!(stats.message_count, 3);
        assert_eq!(stats.unique_users, 1);

        let live = manager.message_store().live_stats().await.expect("live");
        assert_eq!(live.total_messages, 3);
        assert_eq!(live.active_rooms, 1);
    }
}
