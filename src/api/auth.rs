//! Caller authentication.
//!
//! - With `DEV_MODE=false`, every protected endpoint requires
//!   `Authorization: Bearer <jwt>` signed with `JWT_SECRET` (HS256). The
//!   token's `sub` becomes the user id and its `role` claim the role.
//! - With `DEV_MODE=true`, the `x-user-id` and `x-user-role` headers are
//!   trusted as-is.
//!
//! Either way the middleware inserts a [`Caller`] into the request
//! extensions; handlers take it with `Extension<Caller>`.
//!
//! Tokens are issued by the identity provider in front of this service.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use std::sync::Arc;

use super::routes::AppState;
use crate::identity::{Caller, Role, UserId};

const USER_HEADER: &str = "x-user-id";
const ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Claims {
    /// Stable user id
    sub: String,
    /// `researcher` or `annotator`
    role: String,
    /// Issued-at unix seconds
    iat: i64,
    /// Expiration unix seconds
    exp: i64,
}

/// Sign a token for `caller`. Used by tooling and tests.
pub fn issue_jwt(secret: &str, caller: &Caller, ttl_days: i64) -> anyhow::Result<(String, i64)> {
    let now = Utc::now();
    let exp = now + Duration::days(ttl_days.max(1));
    let claims = Claims {
        sub: caller.user_id.to_string(),
        role: caller.role.to_string(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };
    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, claims.exp))
}

fn verify_jwt(token: &str, secret: &str) -> anyhow::Result<Caller> {
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    let claims = token_data.claims;
    if claims.sub.trim().is_empty() {
        anyhow::bail!("token has an empty subject");
    }
    let role: Role = claims.role.parse().map_err(anyhow::Error::msg)?;
    Ok(Caller {
        user_id: UserId::from(claims.sub),
        role,
    })
}

fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, &'static str> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let user_id = header(USER_HEADER).ok_or("Missing x-user-id header")?;
    let role = header(ROLE_HEADER)
        .ok_or("Missing x-user-role header")?
        .parse::<Role>()
        .map_err(|_| "x-user-role must be researcher or annotator")?;
    Ok(Caller {
        user_id: UserId::from(user_id),
        role,
    })
}

fn bearer_token(headers: &HeaderMap) -> &str {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .unwrap_or("")
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let caller = if state.config.dev_mode {
        match caller_from_headers(req.headers()) {
            Ok(caller) => caller,
            Err(message) => return (StatusCode::UNAUTHORIZED, message).into_response(),
        }
    } else {
        // Fail closed if auth isn't configured
        let secret = match state.config.jwt_secret.as_deref() {
            Some(s) => s,
            None => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "JWT_SECRET not configured",
                )
                    .into_response();
            }
        };

        let token = bearer_token(req.headers());
        if token.is_empty() {
            return (StatusCode::UNAUTHORIZED, "Missing Authorization header").into_response();
        }
        match verify_jwt(token, secret) {
            Ok(caller) => caller,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected bearer token");
                return (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response();
            }
        }
    };

    req.extensions_mut().insert(caller);
    next.run(req).await
}
