use async_trait::async_trait;
use thiserror::Error;

/// Platform API failures, pre-classified for the retry policy.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// Timeouts, 5xx responses and platform rate limits. Worth retrying.
    #[error("transient platform failure: {0}")]
    Transient(String),
    /// Deleted channels, revoked permissions, expelled bot. Never retried;
    /// the subscription gets deactivated instead.
    #[error("permanent platform failure: {0}")]
    Permanent(String),
}

/// A message fetched back from the platform.
#[derive(Debug, Clone)]
pub struct PlatformMessage {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_display: String,
    /// True when the message was sent by this relay's own bot identity.
    pub from_self: bool,
    pub content: String,
    pub attachments: Vec<String>,
}

/// The narrow seam to the chat platform. The relay pipeline only ever talks
/// to this trait, which keeps fan-out and reply resolution testable against
/// an in-memory fake.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Sends a message, returning the platform-assigned message id.
    async fn send_message(&self, channel_id: &str, content: &str) -> Result<String, SendError>;

    /// Fetches a single message, `None` when the platform reports it gone.
    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<PlatformMessage>, SendError>;

    /// Delivers an ephemeral notice to a user (direct message).
    async fn notify_user(&self, user_id: &str, content: &str) -> Result<(), SendError>;
}
