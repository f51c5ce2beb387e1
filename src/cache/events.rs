use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TOPIC_INVALIDATE: &str = "invalidate";
pub const TOPIC_NEW_MESSAGE: &str = "new_message";
pub const TOPIC_SYSTEM_NOTIFICATION: &str = "system_notification";
pub const TOPIC_ROOM_UPDATE: &str = "room_update";
pub const TOPIC_CHANNEL_UPDATE: &str = "channel_update";

/// Identifies a cache entry to drop. Receivers act idempotently: deleting an
/// absent key is a no-op, so duplicate delivery is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum Invalidation {
    Room { room_id: i64 },
    Permissions { room_id: i64 },
    Channel { guild_id: String, channel_id: String },
    Ban { guild_id: String },
}

/// Published after a message has been relayed and logged; consumed by the
/// live push hub, scoped by `room_id` so dashboards can filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessageEvent {
    pub room_id: i64,
    pub room_name: String,
    pub guild_name: String,
    pub author_display: String,
    pub content: String,
    pub delivered_count: i32,
    pub failed_count: i32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomUpdateEvent {
    pub action: String,
    pub room_id: i64,
    pub room_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelUpdateEvent {
    pub action: String,
    pub room_id: i64,
    pub guild_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemNotification {
    pub level: String,
    pub message: String,
    pub component: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidation_roundtrips_through_json() {
        let event = Invalidation::Channel {
            guild_id: "g1".to_string(),
            channel_id: "c1".to_string(),
        };
        let raw = serde_json::to_string(&event).expect("serialize");
        let parsed: Invalidation = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(parsed, event);
    }

    #[test]
    fn unknown_payload_shapes_are_rejected_not_panicked() {
        let parsed: Result<Invalidation, _> = serde_json::from_str(r#"{"entity":"widget"}"#);
        assert!(parsed.is_err());
    }
}
