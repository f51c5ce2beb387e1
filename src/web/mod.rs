use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::cors::{AllowOrigin, Cors};
use salvo::http::Method;
use salvo::prelude::*;
use tracing::info;

use crate::cache::CacheManager;
use crate::config::Config;
use crate::db::{DatabaseError, DatabaseManager};

pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod token;
pub mod ws;

use self::token::TokenSigner;
use self::ws::LiveHub;

#[derive(Clone)]
pub struct WebState {
    pub config: Arc<Config>,
    pub store: Arc<DatabaseManager>,
    pub cache: Arc<CacheManager>,
    pub signer: TokenSigner,
    pub hub: Arc<LiveHub>,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

pub fn web_state() -> &'static WebState {
    WEB_STATE
        .get()
        .expect("web state is not initialized before handler execution")
}

pub struct WebServer {
    config: Arc<Config>,
}

impl WebServer {
    pub fn new(
        config: Arc<Config>,
        store: Arc<DatabaseManager>,
        cache: Arc<CacheManager>,
        hub: Arc<LiveHub>,
    ) -> Self {
        let signer = TokenSigner::new(
            &config.security.secret_key,
            Duration::from_secs(config.security.token_expire_minutes * 60),
        );
        let _ = WEB_STATE.set(WebState {
            config: config.clone(),
            store,
            cache,
            signer,
            hub,
            started_at: Instant::now(),
        });

        Self { config }
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.web.bind_address, self.config.web.port);
        info!("starting admin api on {}", bind_addr);

        let cors = if self.config.web.allowed_origins.is_empty() {
            Cors::new().allow_origin(AllowOrigin::any())
        } else {
            Cors::new().allow_origin(AllowOrigin::list(
                self.config
                    .web
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse::<salvo::http::HeaderValue>().ok()),
            ))
        }
        .allow_methods(vec![
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(vec!["authorization", "content-type"])
        .into_handler();

        let service = Service::new(create_router()).hoop(cors);
        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(service).await;
        Ok(())
    }
}

pub fn create_router() -> Router {
    let public_api = Router::new()
        .push(Router::with_path("status").get(handlers::health::status))
        .push(Router::with_path("auth/login").post(handlers::auth::login));

    let authed_api = Router::new()
        .hoop(middleware::auth::require_auth)
        .hoop(middleware::rate_limit::per_user_rate_limit)
        .push(Router::with_path("auth/logout").post(handlers::auth::logout))
        .push(Router::with_path("auth/refresh").post(handlers::auth::refresh))
        .push(Router::with_path("auth/me").get(handlers::auth::me))
        .push(Router::with_path("info").get(handlers::health::info))
        .push(
            Router::with_path("rooms")
                .get(handlers::rooms::list_rooms)
                .post(handlers::rooms::create_room)
                .push(
                    Router::with_path("{id}")
                        .get(handlers::rooms::get_room)
                        .put(handlers::rooms::update_room)
                        .delete(handlers::rooms::delete_room)
                        .push(
                            Router::with_path("permissions")
                                .get(handlers::rooms::get_permissions)
                                .put(handlers::rooms::update_permissions),
                        )
                        .push(
                            Router::with_path("channels")
                                .get(handlers::rooms::list_channels)
                                .post(handlers::rooms::register_channel)
                                .push(
                                    Router::with_path("{guild_id}/{channel_id}")
                                        .delete(handlers::rooms::unregister_channel),
                                ),
                        )
                        .push(
                            Router::with_path("messages")
                                .get(handlers::rooms::room_messages),
                        ),
                ),
        )
        .push(
            Router::with_path("servers")
                .get(handlers::servers::list_servers)
                .push(
                    Router::with_path("bulk/refresh-cache")
                        .post(handlers::servers::refresh_cache),
                )
                .push(
                    Router::with_path("bans")
                        .get(handlers::servers::list_bans)
                        .post(handlers::servers::create_ban)
                        .push(
                            Router::with_path("{guild_id}")
                                .delete(handlers::servers::delete_ban),
                        ),
                )
                .push(
                    Router::with_path("{guild_id}")
                        .get(handlers::servers::get_server)
                        .push(
                            Router::with_path("channels")
                                .get(handlers::servers::server_channels),
                        )
                        .push(Router::with_path("stats").get(handlers::servers::server_stats))
                        .push(
                            Router::with_path("activity")
                                .get(handlers::servers::server_activity),
                        ),
                ),
        )
        .push(
            Router::with_path("analytics")
                .push(Router::with_path("live").get(handlers::analytics::live))
                .push(Router::with_path("messages").get(handlers::analytics::messages))
                .push(
                    Router::with_path("rooms/{id}/stats")
                        .get(handlers::analytics::room_stats),
                )
                .push(Router::with_path("health").get(handlers::analytics::health))
                .push(Router::with_path("trends").get(handlers::analytics::trends))
                .push(
                    Router::with_path("export/messages")
                        .get(handlers::analytics::export_messages),
                ),
        );

    Router::new()
        .push(Router::with_path("metrics").get(metrics::metrics_endpoint))
        .push(Router::with_path("ws").goal(ws::live_push))
        .push(Router::with_path("api").push(public_api).push(authed_api))
}

pub(crate) fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(serde_json::json!({ "error": message })));
}

/// Maps store outcomes onto the HTTP taxonomy.
pub(crate) fn render_db_error(res: &mut Response, err: DatabaseError) {
    let (status, message) = match &err {
        DatabaseError::NotFound => (StatusCode::NOT_FOUND, err.to_string()),
        DatabaseError::NameTaken | DatabaseError::AlreadyBound => {
            (StatusCode::CONFLICT, err.to_string())
        }
        DatabaseError::LimitInvalid
        | DatabaseError::RoomFull
        | DatabaseError::RoomInactive
        | DatabaseError::GuildBanned => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        DatabaseError::Connection(_) | DatabaseError::Query(_) | DatabaseError::Migration(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("database error: {err}"),
        ),
    };
    render_error(res, status, &message);
}

#[cfg(test)]
mod tests {
    use super::create_router;

    #[test]
    fn router_assembles_all_route_groups() {
        // Routing is declarative; building it exercises every path literal.
        let router = create_router();
        let rendered = format!("{router:?}");
        assert!(rendered.contains("rooms"));
        assert!(rendered.contains("servers"));
        assert!(rendered.contains("analytics"));
        assert!(rendered.contains("ws"));
        assert!(rendered.contains("metrics"));
    }
}
