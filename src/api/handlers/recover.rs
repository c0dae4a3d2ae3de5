//! Recovery and resend. Both answer 200 `{}` no matter what happened so the
//! endpoints cannot reveal which addresses have accounts.

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
    resolve_scope,
    types::{Accepted, RecoverRequest, ResendRequest},
    AuthState, Scope,
};
use crate::{
    users::{normalize_email, valid_email},
    verification::{Error, Identifier, TokenKind},
};

/// Mail a password recovery link.
#[utoipa::path(
    post,
    path = "/v1/recover",
    request_body = RecoverRequest,
    params(
        ("X-Keyward-Instance" = Option<String>, Header, description = "Instance id (uuid)"),
        ("X-JWT-AUD" = Option<String>, Header, description = "Audience")
    ),
    responses(
        (status = 200, description = "Request accepted", body = Accepted),
        (status = 400, description = "Missing payload or invalid instance", body = String)
    ),
    tag = "auth"
)]
pub async fn recover(
    headers: HeaderMap,
    state: Extension<Arc<AuthState>>,
    payload: Option<Json<RecoverRequest>>,
) -> impl IntoResponse {
    let request: RecoverRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };
    let scope = match resolve_scope(&headers, state.config()) {
        Ok(scope) => scope,
        Err(rejection) => return rejection.into_response(),
    };

    issue_and_deliver(&state, &scope, TokenKind::Recovery, &request.email).await;
    (StatusCode::OK, Json(Accepted {})).into_response()
}

/// Mail a fresh token of the given kind, voiding the previous one.
#[utoipa::path(
    post,
    path = "/v1/resend",
    request_body = ResendRequest,
    params(
        ("X-Keyward-Instance" = Option<String>, Header, description = "Instance id (uuid)"),
        ("X-JWT-AUD" = Option<String>, Header, description = "Audience")
    ),
    responses(
        (status = 200, description = "Request accepted", body = Accepted),
        (status = 400, description = "Missing payload or invalid instance", body = String)
    ),
    tag = "auth"
)]
pub async fn resend(
    headers: HeaderMap,
    state: Extension<Arc<AuthState>>,
    payload: Option<Json<ResendRequest>>,
) -> impl IntoResponse {
    let request: ResendRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };
    let scope = match resolve_scope(&headers, state.config()) {
        Ok(scope) => scope,
        Err(rejection) => return rejection.into_response(),
    };

    issue_and_deliver(&state, &scope, request.kind, &request.email).await;
    (StatusCode::OK, Json(Accepted {})).into_response()
}

/// Issue a token and queue its link. Failures are logged, never returned.
async fn issue_and_deliver(state: &AuthState, scope: &Scope, kind: TokenKind, email: &str) {
    let email = normalize_email(email);
    if !valid_email(&email) {
        return;
    }

    let issued = state
        .engine()
        .issue(
            scope.instance_id,
            &scope.audience,
            kind,
            Identifier::Email(&email),
            Utc::now(),
        )
        .await;
    match issued {
        Ok(issued) => {
            // Email change links go to the address being confirmed.
            let to_email = match (kind, issued.user.email_change_to.as_deref()) {
                (TokenKind::EmailChange, Some(pending)) => pending,
                _ => issued.user.email.as_str(),
            };
            state.delivery().deliver(to_email, kind, &issued.token);
        }
        Err(Error::NotFound) => debug!(%kind, "No eligible account, nothing sent"),
        Err(err) => error!(%kind, "Failed to issue token: {err}"),
    }
}
