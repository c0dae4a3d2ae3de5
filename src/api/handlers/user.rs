//! The authenticated user's own account.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use super::{
    error_response, require_bearer,
    types::{UpdateUserRequest, UserResponse},
    AuthState,
};
use crate::{
    users::{normalize_email, valid_email, valid_password},
    verification::TokenKind,
};

#[utoipa::path(
    get,
    path = "/v1/user",
    params(
        ("Authorization" = String, Header, description = "Bearer access token")
    ),
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Missing or invalid bearer token", body = String),
        (status = 404, description = "User no longer exists", body = String)
    ),
    tag = "user"
)]
pub async fn get_user(headers: HeaderMap, state: Extension<Arc<AuthState>>) -> impl IntoResponse {
    let claims = match require_bearer(&headers, &state) {
        Ok(claims) => claims,
        Err(rejection) => return rejection.into_response(),
    };
    match state
        .engine()
        .find_user(claims.instance_id, &claims.aud, claims.sub)
        .await
    {
        Ok(user) => (StatusCode::OK, Json(UserResponse::from(&user))).into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

/// Update metadata, password and email. A new email only becomes active once
/// the email change link sent to it is verified.
#[utoipa::path(
    put,
    path = "/v1/user",
    request_body = UpdateUserRequest,
    params(
        ("Authorization" = String, Header, description = "Bearer access token")
    ),
    responses(
        (status = 200, description = "Updated user", body = UserResponse),
        (status = 401, description = "Missing or invalid bearer token", body = String),
        (status = 404, description = "User no longer exists", body = String),
        (status = 422, description = "Invalid email or password, or email already registered", body = String)
    ),
    tag = "user"
)]
pub async fn update_user(
    headers: HeaderMap,
    state: Extension<Arc<AuthState>>,
    payload: Option<Json<UpdateUserRequest>>,
) -> impl IntoResponse {
    let claims = match require_bearer(&headers, &state) {
        Ok(claims) => claims,
        Err(rejection) => return rejection.into_response(),
    };
    let request: UpdateUserRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    // Validate everything up front so a bad field never leaves a half-applied update.
    let email = request.email.as_deref().map(normalize_email);
    if email.as_deref().is_some_and(|email| !valid_email(email)) {
        return (StatusCode::UNPROCESSABLE_ENTITY, "Invalid email".to_string()).into_response();
    }
    if request
        .password
        .as_deref()
        .is_some_and(|password| !valid_password(password))
    {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            "Password too short".to_string(),
        )
            .into_response();
    }

    let engine = state.engine();
    let (instance_id, audience, user_id) = (claims.instance_id, claims.aud.as_str(), claims.sub);
    let now = Utc::now();

    let mut user = match engine.find_user(instance_id, audience, user_id).await {
        Ok(user) => user,
        Err(err) => return error_response(&err).into_response(),
    };
    if let Some(data) = request.data {
        user = match engine
            .update_metadata(instance_id, audience, user_id, data, now)
            .await
        {
            Ok(user) => user,
            Err(err) => return error_response(&err).into_response(),
        };
    }
    if let Some(password) = request.password.as_deref() {
        user = match engine
            .change_password(instance_id, audience, user_id, password, now)
            .await
        {
            Ok(user) => user,
            Err(err) => return error_response(&err).into_response(),
        };
    }
    if let Some(email) = email.filter(|email| *email != user.email) {
        let issued = match engine
            .request_email_change(instance_id, audience, user_id, &email, now)
            .await
        {
            Ok(issued) => issued,
            Err(err) => return error_response(&err).into_response(),
        };
        state
            .delivery()
            .deliver(&email, TokenKind::EmailChange, &issued.token);
        user = issued.user;
    }

    (StatusCode::OK, Json(UserResponse::from(&user))).into_response()
}
