use salvo::prelude::*;
use serde_json::json;

use crate::web::metrics::Metrics;
use crate::web::web_state;

/// Public liveness probe.
#[handler]
pub async fn status(res: &mut Response) {
    res.render(Json(json!({
        "status": "ok",
        "service": "globalchat-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": Metrics::uptime_seconds(),
    })));
}

/// Authenticated deployment summary; secrets never appear here.
#[handler]
pub async fn info(res: &mut Response) {
    let state = web_state();
    res.render(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "store_type": format!("{:?}", state.store.store_type()),
        "ws_connections": Metrics::ws_connection_count(),
        "fanout": {
            "per_room_concurrency": state.config.fanout.per_room_concurrency,
            "retry_max": state.config.fanout.retry_max,
        },
        "rate_limit": {
            "requests": state.config.security.rate_limit_requests,
            "window_seconds": state.config.security.rate_limit_window_secs,
        },
        "uptime_seconds": Metrics::uptime_seconds(),
    })));
}
