pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{
    ChannelBinding, DailyCount, GuildActivityBucket, GuildBan, GuildStats, GuildSummary,
    LiveStats, MessageFilter, MessageLogEntry, NewChannelBinding, NewMessageLogEntry,
    PermissionsPatch, Room, RoomPatch, RoomPermissions, RoomStats, RoomWithChannelCount,
};
pub use self::stores::{BanStore, ChannelStore, MessageStore, RoomStore};

pub mod error;
pub mod manager;
pub mod models;
pub mod stores;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "postgres")]
pub mod schema;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub mod schema_sqlite;
