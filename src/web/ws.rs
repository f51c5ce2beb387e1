//! Live push hub for dashboards.
//!
//! Clients connect to `/ws`, authenticate with their admin token in the
//! first frame, and then receive pushed `live_stats`, `new_message`,
//! `room_update`, `channel_update` and `system_notification` frames.
//! Missed frames are not replayed; dashboards reconcile over REST after a
//! reconnect.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use salvo::prelude::*;
use salvo::websocket::{Message, WebSocket, WebSocketUpgrade};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{
    CacheManager, TOPIC_CHANNEL_UPDATE, TOPIC_NEW_MESSAGE, TOPIC_ROOM_UPDATE,
    TOPIC_SYSTEM_NOTIFICATION,
};
use crate::db::DatabaseManager;
use crate::web::metrics::Metrics;
use crate::web::{token, web_state};

const HUB_CAPACITY: usize = 512;
const STATS_INTERVAL: Duration = Duration::from_secs(5);
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// Fan-out point for server-initiated frames. Each connection holds a
/// broadcast receiver; slow consumers lag and simply miss frames.
pub struct LiveHub {
    tx: broadcast::Sender<String>,
}

impl LiveHub {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn push(&self, frame_type: &str, data: serde_json::Value) {
        let frame = json!({
            "type": frame_type,
            "data": data,
            "timestamp": Utc::now(),
        });
        // No subscribers is the common idle case.
        let _ = self.tx.send(frame.to_string());
    }

    /// Pushes aggregate counters every few seconds while dashboards are
    /// connected.
    pub fn spawn_stats_loop(
        self: &Arc<Self>,
        store: Arc<DatabaseManager>,
        cache: Arc<CacheManager>,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            loop {
                ticker.tick().await;
                if hub.connection_count() == 0 {
                    continue;
                }

                match store.message_store().live_stats().await {
                    Ok(stats) => {
                        let data = json!({
                            "total_messages": stats.total_messages,
                            "messages_today": stats.messages_today,
                            "messages_last_hour": stats.messages_last_hour,
                            "active_rooms": stats.active_rooms,
                            "active_channels": stats.active_channels,
                            "active_guilds": stats.active_guilds,
                            "ws_connections": Metrics::ws_connection_count(),
                        });
                        cache.set_live_stats(&data).await;
                        hub.push("live_stats", data);
                    }
                    Err(err) => warn!("live stats query failed: {err}"),
                }
            }
        })
    }

    /// Forwards relay and admin events from the cache bus to connected
    /// dashboards.
    pub fn spawn_pubsub_bridge(self: &Arc<Self>, cache: Arc<CacheManager>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let topics = [
                TOPIC_NEW_MESSAGE,
                TOPIC_ROOM_UPDATE,
                TOPIC_CHANNEL_UPDATE,
                TOPIC_SYSTEM_NOTIFICATION,
            ];
            let mut stream = match cache.subscribe(&topics).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("live hub failed to subscribe to event bus: {err}");
                    return;
                }
            };
            info!("live hub bridged to event bus");

            while let Some(message) = stream.next().await {
                match serde_json::from_str::<serde_json::Value>(&message.payload) {
                    Ok(data) => hub.push(&message.topic, data),
                    Err(err) => debug!("ignoring malformed bus payload: {err}"),
                }
            }
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Authenticate { token: String },
    Ping { ts: Option<serde_json::Value> },
}

#[handler]
pub async fn live_push(req: &mut Request, res: &mut Response) -> Result<(), StatusError> {
    WebSocketUpgrade::new()
        .upgrade(req, res, handle_connection)
        .await
}

async fn handle_connection(mut ws: WebSocket) {
    let state = web_state();

    // Post-connect handshake: the first frame must carry a valid token.
    let authenticated = match tokio::time::timeout(AUTH_DEADLINE, ws.recv()).await {
        Ok(Some(Ok(frame))) => match parse_frame(&frame) {
            Some(ClientFrame::Authenticate { token }) => authenticate(&token).await,
            _ => false,
        },
        _ => false,
    };

    if !authenticated {
        let reply = json!({
            "type": "authentication_error",
            "data": { "message": "authentication required" },
            "timestamp": Utc::now(),
        });
        let _ = ws.send(Message::text(reply.to_string())).await;
        let _ = ws.send(Message::close()).await;
        return;
    }

    let reply = json!({
        "type": "authentication_success",
        "data": { "connections": state.hub.connection_count() + 1 },
        "timestamp": Utc::now(),
    });
    if ws.send(Message::text(reply.to_string())).await.is_err() {
        return;
    }

    Metrics::ws_connected();
    info!("live push client connected");

    let mut hub_rx = state.hub.subscribe();
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            pushed = hub_rx.recv() => match pushed {
                Ok(frame) => {
                    if sink.send(Message::text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Not replayed; the dashboard reconciles over REST.
                    debug!("live push client lagged, dropped {missed} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            received = source.next() => match received {
                Some(Ok(frame)) => {
                    if frame.is_close() {
                        break;
                    }
                    if let Some(ClientFrame::Ping { ts }) = parse_frame(&frame) {
                        let pong = json!({
                            "type": "pong",
                            "ts": ts,
                            "timestamp": Utc::now(),
                        });
                        if sink.send(Message::text(pong.to_string())).await.is_err() {
                            break;
                        }
                    }
                    // Unknown frame types are ignored by contract.
                }
                Some(Err(err)) => {
                    debug!("live push receive error: {err}");
                    break;
                }
                None => break,
            },
        }
    }

    Metrics::ws_disconnected();
    info!("live push client disconnected");
}

fn parse_frame(message: &Message) -> Option<ClientFrame> {
    let text = message.as_str().ok()?;
    serde_json::from_str(text).ok()
}

async fn authenticate(raw_token: &str) -> bool {
    let state = web_state();
    match state.signer.verify(raw_token) {
        Ok(_) => {
            state
                .cache
                .session_exists(&token::token_hash(raw_token))
                .await
        }
        Err(err) => {
            debug!("live push authentication failed: {err}");
            false
        }
    }
}
