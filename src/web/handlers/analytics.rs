use chrono::{Duration as ChronoDuration, Utc};
use salvo::prelude::*;
use serde_json::json;

use crate::db::MessageFilter;
use crate::web::metrics::Metrics;
use crate::web::{render_db_error, render_error, web_state};

#[handler]
pub async fn live(res: &mut Response) {
    let state = web_state();

    if let Some(cached) = state.cache.get_live_stats().await {
        res.render(Json(json!({ "stats": cached, "cached": true })));
        return;
    }

    match state.store.message_store().live_stats().await {
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
            state.cache.set_live_stats(&data).await;
            res.render(Json(json!({ "stats": data, "cached": false })));
        }
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn messages(req: &mut Request, res: &mut Response) {
    let days = req.query::<i64>("days").unwrap_or(7).clamp(1, 365);
    match web_state().store.message_store().daily_counts(days).await {
        Ok(counts) => {
            let total: i64 = counts.iter().map(|c| c.message_count).sum();
            res.render(Json(json!({ "days": days, "total": total, "daily": counts })));
        }
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn room_stats(req: &mut Request, res: &mut Response) {
    let Some(room_id) = req.param::<i64>("id") else {
        render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid room id");
        return;
    };
    let days = req.query::<i64>("days").unwrap_or(7).clamp(1, 365);

    match web_state()
        .store
        .message_store()
        .room_stats(room_id, days)
        .await
    {
        Ok(stats) => res.render(Json(json!({ "stats": stats, "days": days }))),
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn health(res: &mut Response) {
    let state = web_state();

    let store_ok = state.store.ping().await.is_ok();
    let cache_ok = state.cache.ping().await.is_ok();
    let healthy = store_ok && cache_ok;

    if !healthy {
        res.status_code(StatusCode::SERVICE_UNAVAILABLE);
    }
    res.render(Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "store": if store_ok { "up" } else { "down" },
        "cache": if cache_ok { "up" } else { "down" },
        "uptime_seconds": Metrics::uptime_seconds(),
    })));
}

#[handler]
pub async fn trends(req: &mut Request, res: &mut Response) {
    let period = req
        .query::<String>("period")
        .unwrap_or_else(|| "week".to_string());
    let days = match period.as_str() {
        "day" => 1,
        "week" => 7,
        "month" => 30,
        _ => {
            render_error(
                res,
                StatusCode::UNPROCESSABLE_ENTITY,
                "period must be day, week or month",
            );
            return;
        }
    };

    // One query covers the current and the previous period.
    match web_state()
        .store
        .message_store()
        .daily_counts(days * 2)
        .await
    {
        Ok(counts) => {
            let boundary = (Utc::now() - ChronoDuration::days(days))
                .format("%Y-%m-%d")
                .to_string();
            let current: i64 = counts
                .iter()
                .filter(|c| c.day.as_str() >= boundary.as_str())
                .map(|c| c.message_count)
                .sum();
            let previous: i64 = counts
                .iter()
                .filter(|c| c.day.as_str() < boundary.as_str())
                .map(|c| c.message_count)
                .sum();
            let change_percent = if previous > 0 {
                ((current - previous) as f64 / previous as f64) * 100.0
            } else {
                0.0
            };

            res.render(Json(json!({
                "period": period,
                "current": current,
                "previous": previous,
                "change_percent": change_percent,
                "daily": counts,
            })));
        }
        Err(err) => render_db_error(res, err),
    }
}

#[handler]
pub async fn export_messages(req: &mut Request, res: &mut Response) {
    let days = req.query::<i64>("days").unwrap_or(30).clamp(1, 365);
    let filter = MessageFilter {
        room_id: req.query::<i64>("room_id"),
        guild_id: req.query::<String>("guild_id"),
        since: Some(Utc::now() - ChronoDuration::days(days)),
        until: None,
        limit: req.query::<i64>("limit").unwrap_or(1000).clamp(1, 10_000),
        offset: req.query::<i64>("offset").unwrap_or(0).max(0),
    };

    match web_state().store.message_store().export(&filter).await {
        Ok(exported) => res.render(Json(json!({
            "messages": exported,
            "count": exported.len(),
            "days": days,
        }))),
        Err(err) => render_db_error(res, err),
    }
}
