use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{debug, error, info};

use serenity::all::{
    ChannelId, Client as SerenityClient, Context as SerenityContext, CreateMessage,
    EventHandler as SerenityEventHandler, GatewayIntents, Http, Message as SerenityMessage,
    MessageId, Ready, UserId,
};
use tokio::sync::{oneshot, RwLock};

use crate::config::Config;
use crate::relay::platform::{ChatPlatform, PlatformMessage, SendError};
use crate::relay::{InboundEvent, RelayCoordinator};

const INITIAL_LOGIN_RETRY_SECONDS: u64 = 2;
const MAX_LOGIN_RETRY_SECONDS: u64 = 300;
const READY_TIMEOUT_SECONDS: u64 = 30;

/// Gateway + HTTP client for the chat platform.
///
/// The gateway feeds inbound events to the relay coordinator; the HTTP side
/// implements [`ChatPlatform`] for fan-out sends, reply fetches and author
/// notices.
pub struct DiscordClient {
    config: Arc<Config>,
    http: Arc<Http>,
    bot_user_id: Arc<RwLock<Option<String>>>,
    relay: Arc<RwLock<Option<Arc<RelayCoordinator>>>>,
    login_state: tokio::sync::Mutex<LoginState>,
}

#[derive(Default)]
struct LoginState {
    is_logged_in: bool,
    gateway_task: Option<tokio::task::JoinHandle<()>>,
}

struct RelayEventHandler {
    ready_sender: tokio::sync::Mutex<Option<oneshot::Sender<()>>>,
    bot_user_id: Arc<RwLock<Option<String>>>,
    relay: Arc<RwLock<Option<Arc<RelayCoordinator>>>>,
}

#[serenity::async_trait]
impl SerenityEventHandler for RelayEventHandler {
    async fn ready(&self, _ctx: SerenityContext, ready: Ready) {
        info!(
            "discord gateway ready as {} ({})",
            ready.user.name, ready.user.id
        );
        *self.bot_user_id.write().await = Some(ready.user.id.to_string());
        if let Some(sender) = self.ready_sender.lock().await.take() {
            let _ = sender.send(());
        }
    }

    async fn message(&self, _ctx: SerenityContext, msg: SerenityMessage) {
        if msg.author.bot {
            return;
        }
        let Some(guild_id) = msg.guild_id else {
            return;
        };

        let relay = self.relay.read().await.clone();
        let Some(relay) = relay else {
            debug!("ignoring discord message before relay binding");
            return;
        };

        let referenced_message_id = msg
            .message_reference
            .as_ref()
            .and_then(|reference| reference.message_id)
            .map(|id| id.to_string());
        let attachments = msg.attachments.iter().map(|a| a.url.clone()).collect();
        let author_display = msg
            .author
            .global_name
            .clone()
            .unwrap_or_else(|| msg.author.name.clone());

        relay.handle_event(InboundEvent {
            guild_id: guild_id.to_string(),
            channel_id: msg.channel_id.to_string(),
            message_id: msg.id.to_string(),
            author_id: msg.author.id.to_string(),
            author_display,
            author_is_bot: msg.author.bot,
            content: msg.content.clone(),
            attachments,
            referenced_message_id,
        });
    }
}

impl DiscordClient {
    pub fn new(config: Arc<Config>) -> Self {
        let http = Arc::new(Http::new(&config.platform.token));
        Self {
            config,
            http,
            bot_user_id: Arc::new(RwLock::new(None)),
            relay: Arc::new(RwLock::new(None)),
            login_state: tokio::sync::Mutex::new(LoginState::default()),
        }
    }

    pub async fn set_relay(&self, relay: Arc<RelayCoordinator>) {
        *self.relay.write().await = Some(relay);
    }

    async fn login(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if state.is_logged_in {
            return Ok(());
        }

        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let (ready_tx, ready_rx) = oneshot::channel();
        let event_handler = RelayEventHandler {
            ready_sender: tokio::sync::Mutex::new(Some(ready_tx)),
            bot_user_id: self.bot_user_id.clone(),
            relay: self.relay.clone(),
        };

        let mut gateway_client =
            SerenityClient::builder(&self.config.platform.token, intents)
                .event_handler(event_handler)
                .await
                .map_err(|err| anyhow!("failed to build discord gateway client: {err}"))?;

        let gateway_task = tokio::spawn(async move {
            if let Err(err) = gateway_client.start_autosharded().await {
                error!("discord gateway stopped: {err}");
            }
        });

        match tokio::time::timeout(Duration::from_secs(READY_TIMEOUT_SECONDS), ready_rx).await
        {
            Ok(Ok(())) => {
                state.is_logged_in = true;
                state.gateway_task = Some(gateway_task);
                info!("discord login succeeded and gateway is connected");
                Ok(())
            }
            Ok(Err(_)) => {
                gateway_task.abort();
                Err(anyhow!("discord gateway exited before the Ready event"))
            }
            Err(_) => {
                gateway_task.abort();
                Err(anyhow!("timed out waiting for discord Ready event"))
            }
        }
    }

    /// Connects with exponential backoff until the gateway is up.
    pub async fn start(&self) -> Result<()> {
        let mut retry_seconds = INITIAL_LOGIN_RETRY_SECONDS;
        loop {
            match self.login().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    error!(
                        "failed to start discord client: {err}. retrying in {retry_seconds} seconds"
                    );
                    tokio::time::sleep(Duration::from_secs(retry_seconds)).await;
                    retry_seconds = (retry_seconds * 2).min(MAX_LOGIN_RETRY_SECONDS);
                }
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if !state.is_logged_in {
            return Ok(());
        }

        if let Some(gateway_task) = state.gateway_task.take() {
            gateway_task.abort();
            match gateway_task.await {
                Ok(()) => info!("discord gateway task exited"),
                Err(join_err) if join_err.is_cancelled() => {
                    info!("discord gateway task aborted")
                }
                Err(join_err) => error!("discord gateway task join error: {join_err}"),
            }
        }

        state.is_logged_in = false;
        info!("discord client stopped");
        Ok(())
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.platform.call_timeout_secs)
    }

    async fn bot_id(&self) -> Option<String> {
        self.bot_user_id.read().await.clone()
    }
}

fn parse_id(value: &str, what: &str) -> Result<u64, SendError> {
    value
        .parse::<u64>()
        .map_err(|_| SendError::Permanent(format!("invalid {what} id: {value}")))
}

fn classify(err: serenity::Error) -> SendError {
    if let serenity::Error::Http(serenity::http::HttpError::UnsuccessfulRequest(response)) =
        &err
    {
        let status = response.status_code.as_u16();
        return match status {
            429 => SendError::Transient(format!("platform rate limit ({status})")),
            500..=599 => SendError::Transient(format!("platform server error ({status})")),
            401 | 403 | 404 | 410 => {
                SendError::Permanent(format!("platform refused request ({status})"))
            }
            _ => SendError::Permanent(format!("platform error ({status})")),
        };
    }
    // Connection resets, DNS hiccups and the like are worth retrying.
    SendError::Transient(err.to_string())
}

#[async_trait]
impl ChatPlatform for DiscordClient {
    async fn send_message(&self, channel_id: &str, content: &str) -> Result<String, SendError> {
        let channel = ChannelId::new(parse_id(channel_id, "channel")?);
        let send = channel.send_message(&*self.http, CreateMessage::new().content(content));
        match tokio::time::timeout(self.call_timeout(), send).await {
            Ok(Ok(message)) => Ok(message.id.to_string()),
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(SendError::Transient("platform send timed out".to_string())),
        }
    }

    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<PlatformMessage>, SendError> {
        let channel = ChannelId::new(parse_id(channel_id, "channel")?);
        let message = MessageId::new(parse_id(message_id, "message")?);

        let fetch = channel.message(&*self.http, message);
        let message = match tokio::time::timeout(self.call_timeout(), fetch).await {
            Ok(Ok(message)) => message,
            Ok(Err(err)) => {
                return match classify(err) {
                    SendError::Permanent(_) => Ok(None),
                    transient => Err(transient),
                };
            }
            Err(_) => {
                return Err(SendError::Transient(
                    "platform fetch timed out".to_string(),
                ))
            }
        };

        let bot_id = self.bot_id().await;
        let author_id = message.author.id.to_string();
        Ok(Some(PlatformMessage {
            id: message.id.to_string(),
            channel_id: message.channel_id.to_string(),
            from_self: bot_id.as_deref() == Some(author_id.as_str()),
            author_display: message
                .author
                .global_name
                .clone()
                .unwrap_or_else(|| message.author.name.clone()),
            author_id,
            content: message.content.clone(),
            attachments: message.attachments.iter().map(|a| a.url.clone()).collect(),
        }))
    }

    async fn notify_user(&self, user_id: &str, content: &str) -> Result<(), SendError> {
        let user = UserId::new(parse_id(user_id, "user")?);
        let notify = async {
            let dm = user.create_dm_channel(&*self.http).await?;
            dm.id
                .send_message(&*self.http, CreateMessage::new().content(content))
                .await?;
            Ok::<_, serenity::Error>(())
        };
        match tokio::time::timeout(self.call_timeout(), notify).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(SendError::Transient(
                "platform notify timed out".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_id;
    use crate::relay::platform::SendError;

    #[test]
    fn parse_id_accepts_snowflakes() {
        assert_eq!(parse_id("123456789012345678", "channel").unwrap(), 123456789012345678);
    }

    #[test]
    fn parse_id_rejects_garbage_permanently() {
        match parse_id("not-a-number", "channel") {
            Err(SendError::Permanent(reason)) => assert!(reason.contains("channel")),
            other => panic!("expected permanent error, got {other:?}"),
        }
    }
}
