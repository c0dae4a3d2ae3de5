//! API handlers and the helpers they share.
//!
//! Every request resolves a scope first: the instance comes from
//! [`INSTANCE_HEADER`] and the audience from [`AUDIENCE_HEADER`], each falling
//! back to the configured default. Authenticated endpoints read a PASETO access
//! token from `Authorization: Bearer`.

pub mod health;
pub mod invite;
pub mod recover;
pub mod signup;
mod state;
pub mod token;
pub(crate) mod types;
pub mod user;
pub mod verify;

pub use state::{AuthConfig, AuthState};

use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use chrono::Utc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    credentials::{SessionClaims, TokenType},
    verification::Error,
};

pub const INSTANCE_HEADER: &str = "x-keyward-instance";
pub const AUDIENCE_HEADER: &str = "x-jwt-aud";

/// Instance and audience a request operates in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scope {
    pub instance_id: Uuid,
    pub audience: String,
}

/// Resolve the request scope from headers, falling back to the configured defaults.
pub fn resolve_scope(headers: &HeaderMap, config: &AuthConfig) -> Result<Scope, (StatusCode, String)> {
    let instance_id = match headers.get(INSTANCE_HEADER) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .ok_or_else(|| (StatusCode::BAD_REQUEST, "Invalid instance id".to_string()))?,
        None => config.instance_id(),
    };
    let audience = headers
        .get(AUDIENCE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| config.audience())
        .to_string();
    Ok(Scope {
        instance_id,
        audience,
    })
}

/// Map an engine error to the status and message returned to the client.
///
/// Backend and fatal errors are logged here; their details never reach the caller.
pub fn error_response(err: &Error) -> (StatusCode, String) {
    match err {
        Error::NotFound => (StatusCode::NOT_FOUND, "User not found".to_string()),
        Error::InvalidToken => (StatusCode::BAD_REQUEST, "Invalid token".to_string()),
        Error::ExpiredToken => (StatusCode::GONE, "Token expired".to_string()),
        Error::Conflict => (
            StatusCode::CONFLICT,
            "Concurrent update, try again".to_string(),
        ),
        Error::EmailTaken => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "Email address already registered".to_string(),
        ),
        Error::InvalidCredentials => (
            StatusCode::BAD_REQUEST,
            "Invalid email or password".to_string(),
        ),
        Error::NotConfirmed => (StatusCode::FORBIDDEN, "Email not confirmed".to_string()),
        Error::Fatal(source) => {
            error!("Fatal error: {source:#}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
            )
        }
        Error::Store(source) => {
            error!("Store error: {source:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

/// Extract the raw bearer token from the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Verify the bearer access token and return its claims, or 401.
pub fn require_bearer(
    headers: &HeaderMap,
    state: &AuthState,
) -> Result<SessionClaims, (StatusCode, String)> {
    let unauthorized = || (StatusCode::UNAUTHORIZED, "Unauthorized".to_string());
    let token = bearer_token(headers).ok_or_else(unauthorized)?;
    state
        .issuer()
        .verify(token, TokenType::Access, Utc::now())
        .map_err(|err| {
            debug!("Rejected bearer token: {err}");
            unauthorized()
        })
}
