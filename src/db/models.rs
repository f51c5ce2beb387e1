use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named relay group. Channels subscribe to rooms; messages posted in one
/// subscription are delivered to every other active subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: i64,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub max_servers: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomWithChannelCount {
    #[serde(flatten)]
    pub room: Room,
    pub channel_count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub max_servers: Option<i32>,
    pub is_active: Option<bool>,
}

/// Per-room relay policy. Created with defaults alongside the room and
/// removed when the room is deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPermissions {
    pub room_id: i64,
    pub allow_urls: bool,
    pub allow_files: bool,
    pub allow_mentions: bool,
    pub allow_emojis: bool,
    pub enable_bad_word_filter: bool,
    pub max_message_length: i32,
    pub rate_limit_seconds: i32,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl RoomPermissions {
    pub fn defaults(room_id: i64, updated_by: &str) -> Self {
        Self {
            room_id,
            allow_urls: false,
            allow_files: false,
            allow_mentions: true,
            allow_emojis: true,
            enable_bad_word_filter: true,
            max_message_length: 2000,
            rate_limit_seconds: 3,
            updated_by: updated_by.to_string(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsPatch {
    pub allow_urls: Option<bool>,
    pub allow_files: Option<bool>,
    pub allow_mentions: Option<bool>,
    pub allow_emojis: Option<bool>,
    pub enable_bad_word_filter: Option<bool>,
    pub max_message_length: Option<i32>,
    pub rate_limit_seconds: Option<i32>,
}

/// The binding of one guild channel to one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub id: i64,
    pub room_id: i64,
    pub guild_id: String,
    pub channel_id: String,
    pub guild_name: String,
    pub channel_name: String,
    pub registered_by: String,
    pub registered_at: DateTime<Utc>,
    pub is_active: bool,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewChannelBinding {
    pub room_id: i64,
    pub guild_id: String,
    pub channel_id: String,
    pub guild_name: String,
    pub channel_name: String,
    pub registered_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildBan {
    pub id: i64,
    pub guild_id: String,
    pub guild_name: String,
    pub reason: String,
    pub banned_by: String,
    pub banned_at: DateTime<Utc>,
    pub is_active: bool,
    pub unbanned_at: Option<DateTime<Utc>>,
    pub unbanned_by: Option<String>,
}

/// One relayed message, recorded after fan-out for telemetry and replies.
/// Rows are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub id: i64,
    pub room_id: i64,
    pub source_guild_id: String,
    pub source_channel_id: String,
    pub source_message_id: String,
    pub author_id: String,
    pub author_display: String,
    pub guild_name: String,
    pub content: String,
    pub attachments: Vec<String>,
    pub reply_to_message_id: Option<String>,
    pub reply_to_username: Option<String>,
    pub reply_to_content: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub delivered_count: i32,
    pub failed_count: i32,
}

#[derive(Debug, Clone)]
pub struct NewMessageLogEntry {
    pub room_id: i64,
    pub source_guild_id: String,
    pub source_channel_id: String,
    pub source_message_id: String,
    pub author_id: String,
    pub author_display: String,
    pub guild_name: String,
    pub content: String,
    pub attachments: Vec<String>,
    pub reply_to_message_id: Option<String>,
    pub reply_to_username: Option<String>,
    pub reply_to_content: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub delivered_count: i32,
    pub failed_count: i32,
}

/// A guild as observed through its subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildSummary {
    pub guild_id: String,
    pub guild_name: String,
    pub channel_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStats {
    pub total_messages: i64,
    pub messages_today: i64,
    pub messages_last_hour: i64,
    pub active_rooms: i64,
    pub active_channels: i64,
    pub active_guilds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyCount {
    pub day: String,
    pub message_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomStats {
    pub room_id: i64,
    pub message_count: i64,
    pub unique_users: i64,
    pub unique_guilds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildStats {
    pub guild_id: String,
    pub message_count: i64,
    pub unique_users: i64,
    pub rooms_used: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildActivityBucket {
    pub hour: String,
    pub message_count: i64,
}

/// Filters for the message-log export query.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub room_id: Option<i64>,
    pub guild_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

pub(crate) fn attachments_to_json(attachments: &[String]) -> String {
    serde_json::to_string(attachments).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn attachments_from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_defaults_match_policy() {
        let perms = RoomPermissions::defaults(7, "admin");
        assert!(!perms.allow_urls);
        assert!(!perms.allow_files);
        assert!(perms.allow_mentions);
        assert!(perms.enable_bad_word_filter);
        assert_eq!(perms.max_message_length, 2000);
        assert_eq!(perms.rate_limit_seconds, 3);
    }

    #[test]
    fn attachments_roundtrip_through_json() {
        let urls = vec!["https://cdn.example/a.png".to_string()];
        assert_eq!(attachments_from_json(&attachments_to_json(&urls)), urls);
        assert!(attachments_from_json("not json").is_empty());
    }
}
