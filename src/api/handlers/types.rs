//! Request/response types for the API.
//!
//! Request types carrying passwords or tokens deliberately do not derive `Debug`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::{credentials::SessionCredential, users::User, verification::TokenKind};

#[derive(ToSchema, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    /// Initial user metadata.
    #[schema(value_type = Option<Object>)]
    pub data: Option<Value>,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct InviteRequest {
    pub email: String,
    #[schema(value_type = Option<Object>)]
    pub data: Option<Value>,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct RecoverRequest {
    pub email: String,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct ResendRequest {
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub email: String,
}

/// The token being consumed, tagged by kind. Fields required by a kind are
/// required by the variant.
#[derive(ToSchema, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Verification {
    #[serde(alias = "signup")]
    Confirmation { token: String },
    /// Without a password the token is only consumed.
    Recovery {
        token: String,
        password: Option<String>,
    },
    Invite { token: String, password: String },
    EmailChange { token: String },
}

impl Verification {
    pub fn kind(&self) -> TokenKind {
        match self {
            Self::Confirmation { .. } => TokenKind::Confirmation,
            Self::Recovery { .. } => TokenKind::Recovery,
            Self::Invite { .. } => TokenKind::Invite,
            Self::EmailChange { .. } => TokenKind::EmailChange,
        }
    }
}

#[derive(ToSchema, Deserialize)]
pub struct VerifyRequest {
    #[serde(flatten)]
    pub verification: Verification,
    /// Return a session for the verified user; defaults to true.
    pub sign_in: Option<bool>,
}

#[derive(ToSchema, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    Password,
    RefreshToken,
}

#[derive(IntoParams, Deserialize, Debug)]
#[into_params(parameter_in = Query)]
pub struct TokenQuery {
    pub grant_type: GrantType,
}

#[derive(ToSchema, Deserialize, Default)]
pub struct TokenRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(ToSchema, Deserialize, Default)]
pub struct UpdateUserRequest {
    /// New address; the change takes effect once its email change token is verified.
    pub email: Option<String>,
    pub password: Option<String>,
    /// Merged into user metadata; `null` values remove keys.
    #[schema(value_type = Option<Object>)]
    pub data: Option<Value>,
}

/// Public view of an account. Pending tokens and the password hash are never exposed.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserResponse {
    pub id: Uuid,
    pub aud: String,
    pub role: String,
    pub email: String,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmation_sent_at: Option<DateTime<Utc>>,
    pub recovery_sent_at: Option<DateTime<Utc>>,
    pub invited_at: Option<DateTime<Utc>>,
    /// Address awaiting confirmation of an email change.
    pub new_email: Option<String>,
    pub email_change_sent_at: Option<DateTime<Utc>>,
    pub last_sign_in_at: Option<DateTime<Utc>>,
    #[schema(value_type = Object)]
    pub app_metadata: Value,
    #[schema(value_type = Object)]
    pub user_metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            aud: user.aud.clone(),
            role: user.role.clone(),
            email: user.email.clone(),
            confirmed_at: user.confirmed_at,
            confirmation_sent_at: user.confirmation.as_ref().map(|p| p.issued_at),
            recovery_sent_at: user.recovery.as_ref().map(|p| p.issued_at),
            invited_at: user.invite.as_ref().map(|p| p.issued_at),
            new_email: user.email_change_to.clone(),
            email_change_sent_at: user.email_change.as_ref().map(|p| p.issued_at),
            last_sign_in_at: user.last_sign_in_at,
            app_metadata: user.app_metadata.clone(),
            user_metadata: user.user_metadata.clone(),
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// Empty acknowledgement, serialized as `{}`.
#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct Accepted {}

/// An account and, when the caller was signed in, its session.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct AccountResponse {
    pub user: UserResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionCredential>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    #[serde(flatten)]
    pub session: SessionCredential,
    pub user: UserResponse,
}
