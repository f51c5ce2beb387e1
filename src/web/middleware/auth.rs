use salvo::http::header::AUTHORIZATION;
use salvo::prelude::*;

use crate::web::token::{token_hash, AuthClaims};
use crate::web::{render_error, web_state};

pub const CLAIMS_KEY: &str = "auth_claims";

/// Bearer-token gate for every non-public route.
///
/// A token must carry a valid signature, be unexpired, and still have a
/// live session record in the cache (logout revokes the record).
#[handler]
pub async fn require_auth(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
    ctrl: &mut FlowCtrl,
) {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let token = match header {
        Some(header) if header.starts_with("Bearer ") => &header[7..],
        _ => {
            render_error(res, StatusCode::UNAUTHORIZED, "missing bearer token");
            ctrl.skip_rest();
            return;
        }
    };

    let state = web_state();
    let claims = match state.signer.verify(token) {
        Ok(claims) => claims,
        Err(_) => {
            render_error(res, StatusCode::UNAUTHORIZED, "invalid authentication token");
            ctrl.skip_rest();
            return;
        }
    };

    if !state.cache.session_exists(&token_hash(token)).await {
        render_error(res, StatusCode::UNAUTHORIZED, "session revoked or expired");
        ctrl.skip_rest();
        return;
    }

    depot.insert(CLAIMS_KEY, claims);
}

/// The verified claims stashed by [`require_auth`].
pub fn current_claims(depot: &Depot) -> Option<&AuthClaims> {
    depot.get::<AuthClaims>(CLAIMS_KEY).ok()
}

/// Extracts the raw bearer token (for logout/refresh revocation).
pub fn bearer_token(req: &Request) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(|token| token.to_string())
}
