#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

mod cache;
mod config;
mod db;
mod discord;
mod relay;
mod utils;
mod web;

use config::Config;
use relay::platform::ChatPlatform;
use web::metrics::Metrics;
use web::ws::LiveHub;
use web::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init_tracing();
    Metrics::init();

    let config = Arc::new(Config::load()?);
    info!("globalchat relay starting up");

    let store = Arc::new(db::DatabaseManager::new(&config.store).await?);
    store.migrate().await?;
    info!("store migrated and ready");

    let cache = Arc::new(cache::CacheManager::from_config(&config.cache).await?);
    let invalidation_listener = relay::spawn_invalidation_listener(cache.clone());

    let discord = Arc::new(discord::DiscordClient::new(config.clone()));
    let platform: Arc<dyn ChatPlatform> = discord.clone();

    let fanout = Arc::new(relay::fanout::FanOutEngine::new(
        platform.clone(),
        store.channel_store(),
        cache.clone(),
        config.fanout.per_room_concurrency,
        config.fanout.retry_max,
    ));

    let coordinator = Arc::new(relay::RelayCoordinator::new(
        store.clone(),
        cache.clone(),
        platform,
        fanout.clone(),
    ));
    discord.set_relay(coordinator).await;

    let hub = LiveHub::new();
    let stats_loop = hub.spawn_stats_loop(store.clone(), cache.clone());
    let pubsub_bridge = hub.spawn_pubsub_bridge(cache.clone());

    let web_server = WebServer::new(config.clone(), store.clone(), cache.clone(), hub);

    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!("web server error: {}", e);
        }
    });

    let gateway_client = discord.clone();
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway_client.start().await {
            error!("discord client error: {}", e);
        }
    });

    tokio::pin!(web_handle);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, beginning shutdown");
        },
        _ = &mut web_handle => {
            info!("web server task exited, beginning shutdown");
        },
    }

    // Stop taking gateway events, then drain in-flight deliveries.
    gateway_handle.abort();
    if let Err(err) = discord.stop().await {
        error!("discord shutdown error: {}", err);
    }
    fanout
        .shutdown(Duration::from_secs(config.fanout.drain_deadline_secs))
        .await;

    web_handle.abort();
    stats_loop.abort();
    pubsub_bridge.abort();
    invalidation_listener.abort();

    info!("globalchat relay shut down");
    Ok(())
}
