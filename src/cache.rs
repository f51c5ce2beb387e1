pub use self::backend::{CacheBackend, PubSubMessage};
pub use self::error::CacheError;
pub use self::events::{
    ChannelUpdateEvent, Invalidation, NewMessageEvent, RoomUpdateEvent, SystemNotification,
    TOPIC_CHANNEL_UPDATE, TOPIC_INVALIDATE, TOPIC_NEW_MESSAGE, TOPIC_ROOM_UPDATE,
    TOPIC_SYSTEM_NOTIFICATION,
};
pub use self::manager::{CacheManager, ChannelLookup, RateDecision};
pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

pub mod backend;
pub mod error;
pub mod events;
pub mod manager;
pub mod memory;
pub mod redis;
