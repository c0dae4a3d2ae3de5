//! Password signup.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::error;

use super::{
    error_response, resolve_scope,
    types::{AccountResponse, SignupRequest, UserResponse},
    AuthState,
};
use crate::{
    users::{normalize_email, valid_email, valid_password},
    verification::{self, TokenKind},
};

/// Create an account. Unless autoconfirm is on, a confirmation link is mailed
/// and no session is returned.
#[utoipa::path(
    post,
    path = "/v1/signup",
    request_body = SignupRequest,
    params(
        ("X-Keyward-Instance" = Option<String>, Header, description = "Instance id (uuid)"),
        ("X-JWT-AUD" = Option<String>, Header, description = "Audience")
    ),
    responses(
        (status = 200, description = "Account created", body = AccountResponse),
        (status = 400, description = "Missing payload or invalid instance", body = String),
        (status = 422, description = "Invalid email or password, or email already registered", body = String)
    ),
    tag = "auth"
)]
pub async fn signup(
    headers: HeaderMap,
    state: Extension<Arc<AuthState>>,
    payload: Option<Json<SignupRequest>>,
) -> impl IntoResponse {
    let request: SignupRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };
    let scope = match resolve_scope(&headers, state.config()) {
        Ok(scope) => scope,
        Err(rejection) => return rejection.into_response(),
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return (StatusCode::UNPROCESSABLE_ENTITY, "Invalid email".to_string()).into_response();
    }
    if !valid_password(&request.password) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            "Password too short".to_string(),
        )
            .into_response();
    }

    let autoconfirm = state.config().autoconfirm();
    let registered = match state
        .engine()
        .signup(
            scope.instance_id,
            &scope.audience,
            verification::SignupRequest {
                email: &email,
                password: &request.password,
                metadata: request.data,
                autoconfirm,
            },
            Utc::now(),
        )
        .await
    {
        Ok(registered) => registered,
        Err(err) => return error_response(&err).into_response(),
    };

    if let Some(issued) = &registered.token {
        state
            .delivery()
            .deliver(&issued.user.email, TokenKind::Confirmation, &issued.token);
    }

    let session = if autoconfirm {
        match state.issuer().issue(&registered.user) {
            Ok(session) => Some(session),
            Err(err) => {
                error!("Failed to issue session: {err}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to issue session".to_string(),
                )
                    .into_response();
            }
        }
    } else {
        None
    };

    (
        StatusCode::OK,
        Json(AccountResponse {
            user: UserResponse::from(&registered.user),
            session,
        }),
    )
        .into_response()
}
