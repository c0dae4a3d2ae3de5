//! Token consumption for all four kinds.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error};

use super::{
    error_response, resolve_scope,
    types::{AccountResponse, UserResponse, Verification, VerifyRequest},
    AuthState,
};
use crate::users::valid_password;

/// Consume a one-time token. Every kind confirms the account; recovery and
/// invite may also set a password. By default a session is returned.
#[utoipa::path(
    post,
    path = "/v1/verify",
    request_body = VerifyRequest,
    params(
        ("X-Keyward-Instance" = Option<String>, Header, description = "Instance id (uuid)")
    ),
    responses(
        (status = 200, description = "Token consumed", body = AccountResponse),
        (status = 400, description = "Missing payload or invalid token", body = String),
        (status = 409, description = "Concurrent update", body = String),
        (status = 410, description = "Token expired", body = String),
        (status = 422, description = "Invalid password, or the new email is taken", body = String)
    ),
    tag = "auth"
)]
pub async fn verify(
    headers: HeaderMap,
    state: Extension<Arc<AuthState>>,
    payload: Option<Json<VerifyRequest>>,
) -> impl IntoResponse {
    let request: VerifyRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };
    let scope = match resolve_scope(&headers, state.config()) {
        Ok(scope) => scope,
        Err(rejection) => return rejection.into_response(),
    };

    let password = match &request.verification {
        Verification::Recovery {
            password: Some(password),
            ..
        }
        | Verification::Invite { password, .. } => Some(password.as_str()),
        _ => None,
    };
    if password.is_some_and(|password| !valid_password(password)) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            "Password too short".to_string(),
        )
            .into_response();
    }

    let kind = request.verification.kind();
    let engine = state.engine();
    let instance_id = scope.instance_id;
    let now = Utc::now();
    let result = match &request.verification {
        Verification::Confirmation { token } => engine.confirm_user(instance_id, token, now).await,
        Verification::Recovery {
            token,
            password: Some(password),
        } => {
            engine
                .recover_password(instance_id, token, password, now)
                .await
        }
        Verification::Recovery {
            token,
            password: None,
        } => engine.verify(instance_id, kind, token, now).await,
        Verification::Invite { token, password } => {
            engine.accept_invite(instance_id, token, password, now).await
        }
        Verification::EmailChange { token } => {
            engine.confirm_email_change(instance_id, token, now).await
        }
    };
    let user = match result {
        Ok(user) => user,
        Err(err) => {
            debug!(%kind, "Verification rejected: {err}");
            return error_response(&err).into_response();
        }
    };

    let session = if request.sign_in.unwrap_or(true) {
        match state.issuer().issue(&user) {
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
            user: UserResponse::from(&user),
            session,
        }),
    )
        .into_response()
}
