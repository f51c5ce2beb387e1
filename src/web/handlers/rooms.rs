use salvo::prelude::*;
use serde::Deserialize;
use serde_json::json;

use crate::cache::{ChannelUpdateEvent, Invalidation, RoomUpdateEvent};
use crate::db::{NewChannelBinding, PermissionsPatch, RoomPatch};
use crate::web::middleware::auth::current_claims;
use crate::web::{render_db_error, render_error, web_state};

fn actor(depot: &Depot) -> String {
    current_claims(depot)
        .map(|claims| claims.sub.clone())
        .unwrap_or_else(|| "admin".to_string())
}

fn room_name_valid(name: &str) -> bool {
    let visible = name.trim().chars().count();
    (1..=50).contains(&visible)
}

#[handler]
pub async fn list_rooms(req: &mut Request, res: &mut Response) {
    let include_inactive = req.query::<bool>("include_inactive").unwrap_or(false);
    match web_state()
        .store
        .room_store()
        .list_rooms(include_inactive)
        .await
    {
        Ok(rooms) => res.render(Json(json!({ "rooms": rooms, "count": rooms.len() }))),
        Err(err) => render_db_error(res, err),
    }
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
    name: String,
    #[serde(default = "default_max_servers")]
    max_servers: i32,
}

fn default_max_servers() -> i32 {
    50
}

#[handler]
pub async fn create_room(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let body = match req.parse_json::<CreateRoomRequest>().await {
        Ok(body) => body,
        Err(_) => {
            render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid room body");
            return;
        }
    };

    let name = body.name.trim().to_string();
    if !room_name_valid(&name) {
        render_error(
            res,
            StatusCode::UNPROCESSABLE_ENTITY,
            "room name must be 1-50 visible characters",
        );
        return;
    }
    if !(1..=200).contains(&body.max_servers) {
        render_error(
            res,
            StatusCode::UNPROCESSABLE_ENTITY,
            "max_servers must be between 1 and 200",
        );
        return;
    }

    let state = web_state();
    let room = match state
        .store
        .room_store()
        .create_room(&name, &actor(depot), body.max_servers)
        .await
    {
        Ok(room) => room,
        Err(err) => {
            render_db_error(res, err);
            return;
        }
    };

    // Warm the cache so the relay sees the new room immediately.
    state.cache.set_room(&room).await;
    if let Ok(Some(permissions)) = state.store.room_store().get_permissions(room.id).await {
        state.cache.set_permissions(&permissions).await;
    }
    state
        .cache
        .publish_room_update(&RoomUpdateEvent {
            action: "created".to_string(),
            room_id: room.id,
            room_name: room.name.clone(),
        })
        .await;

    res.status_code(StatusCode::CREATED);
    res.render(Json(json!({ "room": room })));
}

#[handler]
pub async fn get_room(req: &mut Request, res: &mut Response) {
    let Some(room_id) = req.param::<i64>("id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid room id");
        return;
    };

    let state = web_state();
    let room = match state.cache.get_room(room_id).await {
        Some(room) => room,
        None => match state.store.room_store().get_room(room_id).await {
            Ok(Some(room)) => {
                state.cache.set_room(&room).await;
                room
            }
            Ok(None) => {
                render_error(res, StatusCode::NOT_FOUND, "room not found");
                return;
            }
            Err(err) => {
                render_db_error(res, err);
                return;
            }
        },
    };

    let channel_count = state
        .store
        .channel_store()
        .list_room_channels(room_id, true)
        .await
        .map(|channels| channels.len())
        .unwrap_or(0);

    res.render(Json(json!({ "room": room, "channel_count": channel_count })));
}

#[handler]
pub async fn update_room(req: &mut Request, res: &mut Response) {
    let Some(room_id) = req.param::<i64>("id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid room id");
        return;
    };
    let patch = match req.parse_json::<RoomPatch>().await {
        Ok(patch) => patch,
        Err(_) => {
            render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid patch body");
            return;
        }
    };

    if let Some(name) = &patch.name {
        if !room_name_valid(name) {
            render_error(
                res,
                StatusCode::UNPROCESSABLE_ENTITY,
                "room name must be 1-50 visible characters",
            );
            return;
        }
    }

    let state = web_state();
    match state.store.room_store().update_room(room_id, &patch).await {
        Ok(room) => {
            state
                .cache
                .publish_invalidation(&Invalidation::Room { room_id })
                .await;
            state.cache.set_room(&room).await;
            state
                .cache
                .publish_room_update(&RoomUpdateEvent {
                    action: "updated".to_string(),
                    room_id: room.id,
                    room_name: room.name.clone(),
                })
                .await;
            res.render(Json(json!({ "room": room })));
        }
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn delete_room(req: &mut Request, res: &mut Response) {
    let Some(room_id) = req.param::<i64>("id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid room id");
        return;
    };

    let state = web_state();
    let room_name = match state.store.room_store().get_room(room_id).await {
        Ok(Some(room)) => room.name,
        Ok(None) => {
            render_error(res, StatusCode::NOT_FOUND, "room not found");
            return;
        }
        Err(err) => {
            render_db_error(res, err);
            return;
        }
    };

    // Snapshot the bindings before the delete deactivates them, so their
    // cache entries can be dropped afterwards.
    let bindings = state
        .store
        .channel_store()
        .list_room_channels(room_id, false)
        .await
        .unwrap_or_default();

    if let Err(err) = state.store.room_store().delete_room(room_id).await {
        render_db_error(res, err);
        return;
    }

    state
        .cache
        .publish_invalidation(&Invalidation::Room { room_id })
        .await;
    for binding in &bindings {
        state
            .cache
            .publish_invalidation(&Invalidation::Channel {
                guild_id: binding.guild_id.clone(),
                channel_id: binding.channel_id.clone(),
            })
            .await;
    }
    state
        .cache
        .publish_room_update(&RoomUpdateEvent {
            action: "deleted".to_string(),
            room_id,
            room_name,
        })
        .await;

    res.render(Json(json!({ "ok": true, "id": room_id })));
}

#[handler]
pub async fn get_permissions(req: &mut Request, res: &mut Response) {
    let Some(room_id) = req.param::<i64>("id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid room id");
        return;
    };

    let state = web_state();
    if let Some(permissions) = state.cache.get_permissions(room_id).await {
        res.render(Json(json!({ "permissions": permissions })));
        return;
    }

    match state.store.room_store().get_permissions(room_id).await {
        Ok(Some(permissions)) => {
            state.cache.set_permissions(&permissions).await;
            res.render(Json(json!({ "permissions": permissions })));
        }
        Ok(None) => render_error(res, StatusCode::NOT_FOUND, "room permissions not found"),
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn update_permissions(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let Some(room_id) = req.param::<i64>("id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid room id");
        return;
    };
    let patch = match req.parse_json::<PermissionsPatch>().await {
        Ok(patch) => patch,
        Err(_) => {
            render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid patch body");
            return;
        }
    };

    if let Some(len) = patch.max_message_length {
        if !(1..=4000).contains(&len) {
            render_error(
                res,
                StatusCode::UNPROCESSABLE_ENTITY,
                "max_message_length must be between 1 and 4000",
            );
            return;
        }
    }
    if let Some(window) = patch.rate_limit_seconds {
        if !(0..=60).contains(&window) {
            render_error(
                res,
                StatusCode::UNPROCESSABLE_ENTITY,
                "rate_limit_seconds must be between 0 and 60",
            );
            return;
        }
    }

    let state = web_state();
    match state
        .store
        .room_store()
        .update_permissions(room_id, &patch, &actor(depot))
        .await
    {
        Ok(permissions) => {
            state
                .cache
                .publish_invalidation(&Invalidation::Permissions { room_id })
                .await;
            state.cache.set_permissions(&permissions).await;
            res.render(Json(json!({ "permissions": permissions })));
        }
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn list_channels(req: &mut Request, res: &mut Response) {
    let Some(room_id) = req.param::<i64>("id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid room id");
        return;
    };
    let include_inactive = req.query::<bool>("include_inactive").unwrap_or(false);

    match web_state()
        .store
        .channel_store()
        .list_room_channels(room_id, !include_inactive)
        .await
    {
        Ok(channels) => {
            res.render(Json(json!({ "channels": channels, "count": channels.len() })))
        }
        Err(err) => render_db_error(res, err),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterChannelRequest {
    guild_id: String,
    channel_id: String,
    guild_name: String,
    channel_name: String,
}

#[handler]
pub async fn register_channel(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let Some(room_id) = req.param::<i64>("id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid room id");
        return;
    };
    let body = match req.parse_json::<RegisterChannelRequest>().await {
        Ok(body) => body,
        Err(_) => {
            render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid channel body");
            return;
        }
    };
    if body.guild_id.is_empty() || body.channel_id.is_empty() {
        render_error(
            res,
            StatusCode::UNPROCESSABLE_ENTITY,
            "guild_id and channel_id are required",
        );
        return;
    }

    let state = web_state();
    let binding = NewChannelBinding {
        room_id,
        guild_id: body.guild_id,
        channel_id: body.channel_id,
        guild_name: body.guild_name,
        channel_name: body.channel_name,
        registered_by: actor(depot),
    };

    match state.store.channel_store().register_channel(&binding).await {
        Ok(created) => {
            state
                .cache
                .publish_invalidation(&Invalidation::Channel {
                    guild_id: created.guild_id.clone(),
                    channel_id: created.channel_id.clone(),
                })
                .await;
            state.cache.set_channel_binding(&created).await;
            state
                .cache
                .publish_channel_update(&ChannelUpdateEvent {
                    action: "registered".to_string(),
                    room_id,
                    guild_id: created.guild_id.clone(),
                    channel_id: created.channel_id.clone(),
                })
                .await;
            res.status_code(StatusCode::CREATED);
            res.render(Json(json!({ "channel": created })));
        }
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn unregister_channel(req: &mut Request, res: &mut Response) {
    let Some(room_id) = req.param::<i64>("id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid room id");
        return;
    };
    let (Some(guild_id), Some(channel_id)) = (
        req.param::<String>("guild_id"),
        req.param::<String>("channel_id"),
    ) else {
        render_error(
            res,
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid guild or channel id",
        );
        return;
    };

    let state = web_state();
    match state
        .store
        .channel_store()
        .unregister_channel(room_id, &guild_id, &channel_id)
        .await
    {
        Ok(()) => {
            state
                .cache
                .publish_invalidation(&Invalidation::Channel {
                    guild_id: guild_id.clone(),
                    channel_id: channel_id.clone(),
                })
                .await;
            state
                .cache
                .publish_channel_update(&ChannelUpdateEvent {
                    action: "unregistered".to_string(),
                    room_id,
                    guild_id,
                    channel_id,
                })
                .await;
            res.render(Json(json!({ "ok": true })));
        }
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn room_messages(req: &mut Request, res: &mut Response) {
    let Some(room_id) = req.param::<i64>("id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid room id");
        return;
    };
    let limit = req.query::<i64>("limit").unwrap_or(50).clamp(1, 500);
    let offset = req.query::<i64>("offset").unwrap_or(0).max(0);

    match web_state()
        .store
        .message_store()
        .list_room_messages(room_id, limit, offset)
        .await
    {
        Ok(messages) => res.render(Json(json!({
            "messages": messages,
            "count": messages.len(),
            "limit": limit,
            "offset": offset,
        }))),
        Err(err) => render_db_error(res, err),
    }
}
