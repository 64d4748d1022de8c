//! Basic-auth middleware and role-level checks.
//!
//! Every request carries `Authorization: Basic …`; the middleware verifies
//! the credentials against the user table and attaches the caller's
//! identity to the request. Handlers then assert their minimum level.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use arca_core::models::User;
use arca_protocol::AuthLevel;

use crate::error::ApiError;
use crate::state::ServerState;

/// The authenticated caller, available to handlers as a request extension.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
    pub level: AuthLevel,
}

/// Assert the caller meets an endpoint's minimum level.
pub fn require(user: &AuthUser, minimum: AuthLevel) -> Result<(), ApiError> {
    if user.level >= minimum {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "requires {minimum} authorisation, caller '{}' has {}",
            user.username, user.level
        )))
    }
}

fn decode_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

pub async fn auth_middleware(
    State(state): State<ServerState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let Some((username, password)) = decode_basic(header) else {
        return ApiError::Unauthorized("missing or malformed Authorization header".into())
            .into_response();
    };

    let verified = state
        .ctx
        .with_db(|conn| User::authenticate(conn, &username, &password));

    match verified {
        Ok(Some(user)) => {
            req.extensions_mut().insert(AuthUser {
                username: user.username,
                level: user.auth_level,
            });
            next.run(req).await
        }
        Ok(None) => ApiError::Unauthorized("invalid username or password".into()).into_response(),
        Err(e) => ApiError::Internal(format!("authentication lookup failed: {e}")).into_response(),
    }
}
