//! Session grants: password and refresh token.

use axum::{
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error};

use super::{
    error_response, resolve_scope,
    types::{GrantType, TokenQuery, TokenRequest, TokenResponse, UserResponse},
    AuthState,
};
use crate::{
    credentials::TokenType,
    users::User,
    verification::Error,
};

/// Exchange credentials or a refresh token for a new session.
///
/// Unconfirmed accounts may only sign in when autoconfirm is on.
#[utoipa::path(
    post,
    path = "/v1/token",
    request_body = TokenRequest,
    params(
        TokenQuery,
        ("X-Keyward-Instance" = Option<String>, Header, description = "Instance id (uuid)"),
        ("X-JWT-AUD" = Option<String>, Header, description = "Audience")
    ),
    responses(
        (status = 200, description = "Session issued", body = TokenResponse),
        (status = 400, description = "Invalid credentials or refresh token", body = String),
        (status = 403, description = "Email not confirmed", body = String)
    ),
    tag = "auth"
)]
pub async fn token(
    headers: HeaderMap,
    state: Extension<Arc<AuthState>>,
    Query(query): Query<TokenQuery>,
    payload: Option<Json<TokenRequest>>,
) -> impl IntoResponse {
    let request: TokenRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let user = match query.grant_type {
        GrantType::Password => password_grant(&headers, &state, request).await,
        GrantType::RefreshToken => refresh_grant(&state, request).await,
    };
    let user = match user {
        Ok(user) => user,
        Err(rejection) => return rejection.into_response(),
    };

    match state.issuer().issue(&user) {
        Ok(session) => (
            StatusCode::OK,
            Json(TokenResponse {
                session,
                user: UserResponse::from(&user),
            }),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to issue session: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to issue session".to_string(),
            )
                .into_response()
        }
    }
}

async fn password_grant(
    headers: &HeaderMap,
    state: &AuthState,
    request: TokenRequest,
) -> Result<User, (StatusCode, String)> {
    let scope = resolve_scope(headers, state.config())?;
    let (Some(email), Some(password)) = (request.email, request.password) else {
        return Err((
            StatusCode::BAD_REQUEST,
            "Missing email or password".to_string(),
        ));
    };
    let require_confirmed = !state.config().autoconfirm();
    state
        .engine()
        .authenticate(
            scope.instance_id,
            &scope.audience,
            &email,
            &password,
            require_confirmed,
            Utc::now(),
        )
        .await
        .map_err(|err| error_response(&err))
}

/// Refresh tokens are stateless; the account must still exist.
async fn refresh_grant(
    state: &AuthState,
    request: TokenRequest,
) -> Result<User, (StatusCode, String)> {
    let invalid = || (StatusCode::BAD_REQUEST, "Invalid refresh token".to_string());
    let token = request.refresh_token.ok_or_else(invalid)?;
    let claims = state
        .issuer()
        .verify(&token, TokenType::Refresh, Utc::now())
        .map_err(|err| {
            debug!("Rejected refresh token: {err}");
            invalid()
        })?;
    match state
        .engine()
        .find_user(claims.instance_id, &claims.aud, claims.sub)
        .await
    {
        Ok(user) => Ok(user),
        Err(Error::NotFound) => Err(invalid()),
        Err(err) => Err(error_response(&err)),
    }
}
