//! Admin invitations.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

use super::{
    error_response, require_bearer, resolve_scope,
    types::{InviteRequest, UserResponse},
    AuthState,
};
use crate::{
    users::{normalize_email, valid_email},
    verification::TokenKind,
};

/// Create a passwordless account and mail it an invite link.
#[utoipa::path(
    post,
    path = "/v1/invite",
    request_body = InviteRequest,
    params(
        ("Authorization" = String, Header, description = "Bearer access token of an admin"),
        ("X-Keyward-Instance" = Option<String>, Header, description = "Instance id (uuid)"),
        ("X-JWT-AUD" = Option<String>, Header, description = "Audience")
    ),
    responses(
        (status = 200, description = "Invite sent", body = UserResponse),
        (status = 401, description = "Missing or invalid bearer token", body = String),
        (status = 403, description = "Caller is not an admin of this instance", body = String),
        (status = 422, description = "Invalid email or email already registered", body = String)
    ),
    tag = "admin"
)]
pub async fn invite(
    headers: HeaderMap,
    state: Extension<Arc<AuthState>>,
    payload: Option<Json<InviteRequest>>,
) -> impl IntoResponse {
    let claims = match require_bearer(&headers, &state) {
        Ok(claims) => claims,
        Err(rejection) => return rejection.into_response(),
    };
    let scope = match resolve_scope(&headers, state.config()) {
        Ok(scope) => scope,
        Err(rejection) => return rejection.into_response(),
    };
    if claims.role != state.config().admin_role() || claims.instance_id != scope.instance_id {
        warn!(user_id = %claims.sub, "Invite rejected: caller is not an admin here");
        return (StatusCode::FORBIDDEN, "Forbidden".to_string()).into_response();
    }

    let request: InviteRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };
    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return (StatusCode::UNPROCESSABLE_ENTITY, "Invalid email".to_string()).into_response();
    }

    match state
        .engine()
        .invite(
            scope.instance_id,
            &scope.audience,
            &email,
            request.data,
            Utc::now(),
        )
        .await
    {
        Ok(issued) => {
            state
                .delivery()
                .deliver(&issued.user.email, TokenKind::Invite, &issued.token);
            (StatusCode::OK, Json(UserResponse::from(&issued.user))).into_response()
        }
        Err(err) => error_response(&err).into_response(),
    }
}
