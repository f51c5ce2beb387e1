use salvo::prelude::*;
use serde::Deserialize;
use serde_json::json;

use crate::cache::{Invalidation, SystemNotification};
use crate::web::middleware::auth::current_claims;
use crate::web::{render_db_error, render_error, web_state};

fn actor(depot: &Depot) -> String {
    current_claims(depot)
        .map(|claims| claims.sub.clone())
        .unwrap_or_else(|| "admin".to_string())
}

#[handler]
pub async fn list_servers(req: &mut Request, res: &mut Response) {
    let active_only = req.query::<bool>("active_only").unwrap_or(true);
    match web_state()
        .store
        .channel_store()
        .list_guilds(active_only)
        .await
    {
        Ok(guilds) => res.render(Json(json!({ "servers": guilds, "count": guilds.len() }))),
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn get_server(req: &mut Request, res: &mut Response) {
    let Some(guild_id) = req.param::<String>("guild_id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid guild id");
        return;
    };

    let state = web_state();
    let channels = match state.store.channel_store().list_guild_channels(&guild_id).await {
        Ok(channels) => channels,
        Err(err) => {
            render_db_error(res, err);
            return;
        }
    };
    if channels.is_empty() {
        render_error(res, StatusCode::NOT_FOUND, "server not known to the relay");
        return;
    }

    let banned = state
        .store
        .ban_store()
        .is_banned(&guild_id)
        .await
        .unwrap_or(false);
    let guild_name = channels
        .last()
        .map(|c| c.guild_name.clone())
        .unwrap_or_default();
    let active_count = channels.iter().filter(|c| c.is_active).count();

    res.render(Json(json!({
        "guild_id": guild_id,
        "guild_name": guild_name,
        "channel_count": channels.len(),
        "active_channel_count": active_count,
        "is_banned": banned,
    })));
}

#[handler]
pub async fn server_channels(req: &mut Request, res: &mut Response) {
    let Some(guild_id) = req.param::<String>("guild_id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid guild id");
        return;
    };

    match web_state()
        .store
        .channel_store()
        .list_guild_channels(&guild_id)
        .await
    {
        Ok(channels) => {
            res.render(Json(json!({ "channels": channels, "count": channels.len() })))
        }
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn server_stats(req: &mut Request, res: &mut Response) {
    let Some(guild_id) = req.param::<String>("guild_id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid guild id");
        return;
    };
    let days = req.query::<i64>("days").unwrap_or(7).clamp(1, 365);

    match web_state()
        .store
        .message_store()
        .guild_stats(&guild_id, days)
        .await
    {
        Ok(stats) => res.render(Json(json!({ "stats": stats, "days": days }))),
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn server_activity(req: &mut Request, res: &mut Response) {
    let Some(guild_id) = req.param::<String>("guild_id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid guild id");
        return;
    };
    let hours = req.query::<i64>("hours").unwrap_or(24).clamp(1, 720);

    match web_state()
        .store
        .message_store()
        .guild_activity(&guild_id, hours)
        .await
    {
        Ok(buckets) => res.render(Json(json!({ "activity": buckets, "hours": hours }))),
        Err(err) => render_db_error(res, err),
    }
}

/// Re-primes the cache from the store: every active room, its permissions
/// and every active binding.
#[handler]
pub async fn refresh_cache(res: &mut Response) {
    let state = web_state();

    let rooms = match state.store.room_store().list_rooms(false).await {
        Ok(rooms) => rooms,
        Err(err) => {
            render_db_error(res, err);
            return;
        }
    };

    let mut warmed_rooms = 0usize;
    let mut warmed_channels = 0usize;
    for entry in &rooms {
        state.cache.set_room(&entry.room).await;
        if let Ok(Some(permissions)) =
            state.store.room_store().get_permissions(entry.room.id).await
        {
            state.cache.set_permissions(&permissions).await;
        }
        warmed_rooms += 1;

        if let Ok(channels) = state
            .store
            .channel_store()
            .list_room_channels(entry.room.id, true)
            .await
        {
            for binding in &channels {
                state.cache.set_channel_binding(binding).await;
                warmed_channels += 1;
            }
        }
    }

    res.render(Json(json!({
        "ok": true,
        "rooms_warmed": warmed_rooms,
        "channels_warmed": warmed_channels,
    })));
}

#[derive(Debug, Deserialize)]
struct BanRequest {
    guild_id: String,
    guild_name: String,
    reason: String,
}

#[handler]
pub async fn create_ban(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let body = match req.parse_json::<BanRequest>().await {
        Ok(body) => body,
        Err(_) => {
            render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid ban body");
            return;
        }
    };
    if body.guild_id.is_empty() {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "guild_id is required");
        return;
    }

    let state = web_state();
    match state
        .store
        .ban_store()
        .ban_guild(&body.guild_id, &body.guild_name, &body.reason, &actor(depot))
        .await
    {
        Ok(ban) => {
            state
                .cache
                .publish_invalidation(&Invalidation::Ban {
                    guild_id: ban.guild_id.clone(),
                })
                .await;
            state
                .cache
                .publish_system_notification(&SystemNotification {
                    level: "warning".to_string(),
                    message: format!("guild {} banned: {}", ban.guild_name, ban.reason),
                    component: "admin".to_string(),
                })
                .await;
            res.status_code(StatusCode::CREATED);
            res.render(Json(json!({ "ban": ban })));
        }
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn delete_ban(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let Some(guild_id) = req.param::<String>("guild_id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid guild id");
        return;
    };

    let state = web_state();
    match state
        .store
        .ban_store()
        .unban_guild(&guild_id, &actor(depot))
        .await
    {
        Ok(ban) => {
            state
                .cache
                .publish_invalidation(&Invalidation::Ban {
                    guild_id: ban.guild_id.clone(),
                })
                .await;
            res.render(Json(json!({ "ban": ban })));
        }
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn list_bans(req: &mut Request, res: &mut Response) {
    let include_inactive = req.query::<bool>("include_inactive").unwrap_or(false);
    match web_state()
        .store
        .ban_store()
        .list_bans(include_inactive)
        .await
    {
        Ok(bans) => res.render(Json(json!({ "bans": bans, "count": bans.len() }))),
        Err(err) => render_db_error(res, err),
    }
}
