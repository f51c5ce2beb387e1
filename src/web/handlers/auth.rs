use salvo::prelude::*;
use serde::Deserialize;
use serde_json::json;

use crate::web::middleware::auth::{bearer_token, current_claims};
use crate::web::token::{credentials_match, token_hash};
use crate::web::{render_error, web_state};

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[handler]
pub async fn login(req: &mut Request, res: &mut Response) {
    let body = match req.parse_json::<LoginRequest>().await {
        Ok(body) => body,
        Err(_) => {
            render_error(res, StatusCode::UNPROCESSABLE_ENTITY, "invalid login body");
            return;
        }
    };

    let state = web_state();
    let username_ok = credentials_match(&body.username, &state.config.security.admin_username);
    let password_ok = credentials_match(&body.password, &state.config.security.admin_password);
    if !(username_ok && password_ok) {
        render_error(res, StatusCode::UNAUTHORIZED, "invalid credentials");
        return;
    }

    let (token, claims) = match state.signer.issue(&body.username, 1, true) {
        Ok(issued) => issued,
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("token issue failed: {err}"),
            );
            return;
        }
    };

    let claims_json = serde_json::to_string(&claims).unwrap_or_default();
    state
        .cache
        .put_session(&token_hash(&token), &claims_json, state.signer.lifetime())
        .await;

    res.render(Json(json!({
        "access_token": token,
        "token_type": "bearer",
        "expires_in": state.signer.lifetime().as_secs(),
        "user_info": {
            "id": claims.user_id,
            "username": claims.sub,
            "is_superuser": claims.is_superuser,
        },
    })));
}

#[handler]
pub async fn logout(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = web_state();
    if let Some(token) = bearer_token(req) {
        state.cache.drop_session(&token_hash(&token)).await;
    }

    let username = current_claims(depot)
        .map(|claims| claims.sub.clone())
        .unwrap_or_default();
    res.render(Json(json!({
        "message": "successfully logged out",
        "username": username,
    })));
}

#[handler]
pub async fn refresh(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = web_state();
    let Some(claims) = current_claims(depot).cloned() else {
        render_error(res, StatusCode::UNAUTHORIZED, "no active session");
        return;
    };

    let (token, new_claims) =
        match state
            .signer
            .issue(&claims.sub, claims.user_id, claims.is_superuser)
        {
            Ok(issued) => issued,
            Err(err) => {
                render_error(
                    res,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("token refresh failed: {err}"),
                );
                return;
            }
        };

    // The old token is revoked; only the fresh one stays valid.
    if let Some(old_token) = bearer_token(req) {
        state.cache.drop_session(&token_hash(&old_token)).await;
    }
    let claims_json = serde_json::to_string(&new_claims).unwrap_or_default();
    state
        .cache
        .put_session(&token_hash(&token), &claims_json, state.signer.lifetime())
        .await;

    res.render(Json(json!({
        "access_token": token,
        "token_type": "bearer",
        "expires_in": state.signer.lifetime().as_secs(),
    })));
}

#[handler]
pub async fn me(depot: &mut Depot, res: &mut Response) {
    let Some(claims) = current_claims(depot) else {
        render_error(res, StatusCode::UNAUTHORIZED, "no active session");
        return;
    };

    res.render(Json(json!({
        "user_id": claims.user_id,
        "username": claims.sub,
        "is_superuser": claims.is_superuser,
        "authenticated_at": claims.iat,
        "token_valid": true,
    })));
}
