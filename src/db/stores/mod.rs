use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{
    ChannelBinding, DailyCount, GuildActivityBucket, GuildBan, GuildStats, GuildSummary,
    LiveStats, MessageFilter, MessageLogEntry, NewChannelBinding, NewMessageLogEntry,
    PermissionsPatch, Room, RoomPatch, RoomPermissions, RoomStats, RoomWithChannelCount,
};
use super::DatabaseError;

#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Creates a room and its default permission row.
    ///
    /// Fails with `NameTaken` when an active room already uses the name
    /// (case-insensitive) and `LimitInvalid` for a non-positive server limit.
    async fn create_room(
        &self,
        name: &str,
        created_by: &str,
        max_servers: i32,
    ) -> Result<Room, DatabaseError>;

    async fn get_room(&self, id: i64) -> Result<Option<Room>, DatabaseError>;
    async fn get_room_by_name(&self, name: &str) -> Result<Option<Room>, DatabaseError>;
    async fn list_rooms(
        &self,
        include_inactive: bool,
    ) -> Result<Vec<RoomWithChannelCount>, DatabaseError>;
    async fn update_room(&self, id: i64, patch: &RoomPatch) -> Result<Room, DatabaseError>;

    /// Hard-deletes the room and its permissions; subscriptions are
    /// deactivated in place and the message log is left untouched.
    async fn delete_room(&self, id: i64) -> Result<(), DatabaseError>;

    async fn get_permissions(&self, room_id: i64)
        -> Result<Option<RoomPermissions>, DatabaseError>;
    async fn update_permissions(
        &self,
        room_id: i64,
        patch: &PermissionsPatch,
        updated_by: &str,
    ) -> Result<RoomPermissions, DatabaseError>;
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Binds a channel to a room, enforcing the ban list, room activity,
    /// the one-room-per-channel rule and the room's distinct-guild limit
    /// inside a single transaction.
    async fn register_channel(
        &self,
        binding: &NewChannelBinding,
    ) -> Result<ChannelBinding, DatabaseError>;

    async fn unregister_channel(
        &self,
        room_id: i64,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<(), DatabaseError>;

    async fn get_active_binding(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelBinding>, DatabaseError>;

    async fn list_room_channels(
        &self,
        room_id: i64,
        active_only: bool,
    ) -> Result<Vec<ChannelBinding>, DatabaseError>;

    async fn list_guild_channels(
        &self,
        guild_id: &str,
    ) -> Result<Vec<ChannelBinding>, DatabaseError>;

    async fn list_guilds(&self, active_only: bool) -> Result<Vec<GuildSummary>, DatabaseError>;

    async fn deactivate_binding(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<(), DatabaseError>;

    async fn touch_last_message(
        &self,
        guild_id: &str,
        channel_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait BanStore: Send + Sync {
    /// Bans a guild; re-banning an unbanned guild reactivates the row.
    async fn ban_guild(
        &self,
        guild_id: &str,
        guild_name: &str,
        reason: &str,
        banned_by: &str,
    ) -> Result<GuildBan, DatabaseError>;

    async fn unban_guild(&self, guild_id: &str, unbanned_by: &str)
        -> Result<GuildBan, DatabaseError>;
    async fn list_bans(&self, include_inactive: bool) -> Result<Vec<GuildBan>, DatabaseError>;
    async fn is_banned(&self, guild_id: &str) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append-only log write; entries are immutable after insert.
    async fn append(&self, entry: &NewMessageLogEntry) -> Result<(), DatabaseError>;

    async fn get_by_source_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageLogEntry>, DatabaseError>;

    async fn list_room_messages(
        &self,
        room_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageLogEntry>, DatabaseError>;

    async fn live_stats(&self) -> Result<LiveStats, DatabaseError>;
    async fn daily_counts(&self, days: i64) -> Result<Vec<DailyCount>, DatabaseError>;
    async fn room_stats(&self, room_id: i64, days: i64) -> Result<RoomStats, DatabaseError>;
    async fn guild_stats(&self, guild_id: &str, days: i64) -> Result<GuildStats, DatabaseError>;
    async fn guild_activity(
        &self,
        guild_id: &str,
        hours: i64,
    ) -> Result<Vec<GuildActivityBucket>, DatabaseError>;
    async fn export(&self, filter: &MessageFilter)
        -> Result<Vec<MessageLogEntry>, DatabaseError>;
}
