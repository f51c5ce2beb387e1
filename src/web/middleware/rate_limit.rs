use std::time::Duration;

use salvo::prelude::*;
use tracing::warn;

use crate::web::middleware::auth::current_claims;
use crate::web::{render_error, web_state};

/// Fixed-window request limit per authenticated user. Runs after
/// `require_auth`, so an anonymous request never reaches it.
#[handler]
pub async fn per_user_rate_limit(depot: &mut Depot, res: &mut Response, ctrl: &mut FlowCtrl) {
    let Some(claims) = current_claims(depot) else {
        return;
    };

    let state = web_state();
    let limit = state.config.security.rate_limit_requests;
    let window = Duration::from_secs(state.config.security.rate_limit_window_secs);

    match state.cache.api_rate_hit(&claims.sub, limit, window).await {
        Ok(true) => {}
        Ok(false) => {
            render_error(
                res,
                StatusCode::TOO_MANY_REQUESTS,
                "rate limit exceeded, slow down",
            );
            ctrl.skip_rest();
        }
        Err(err) => {
            // Fail open: losing the limiter should not take down the API.
            warn!("api rate limit check failed: {err}");
        }
    }
}
