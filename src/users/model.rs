use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

use crate::verification::TokenKind;

/// Role assigned to every account unless an operator changes it.
pub const DEFAULT_ROLE: &str = "authenticated";

/// An unconsumed one-time token and the moment it was issued.
#[derive(Clone, PartialEq, Eq)]
pub struct PendingToken {
    pub value: String,
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for PendingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingToken")
            .field("value", &"***")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// A user account scoped to one instance and audience.
#[derive(Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub aud: String,
    pub email: String,
    pub role: String,
    /// PHC string (argon2id); `None` for invited accounts that never set one.
    pub encrypted_password: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmation: Option<PendingToken>,
    pub recovery: Option<PendingToken>,
    pub invite: Option<PendingToken>,
    pub email_change: Option<PendingToken>,
    /// Address the account moves to once the email change token is consumed.
    pub email_change_to: Option<String>,
    pub last_sign_in_at: Option<DateTime<Utc>>,
    pub app_metadata: Value,
    pub user_metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Blank, unconfirmed account. `email` must already be normalized.
    pub fn new(instance_id: Uuid, aud: &str, email: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            aud: aud.to_string(),
            email: email.to_string(),
            role: DEFAULT_ROLE.to_string(),
            encrypted_password: None,
            confirmed_at: None,
            confirmation: None,
            recovery: None,
            invite: None,
            email_change: None,
            email_change_to: None,
            last_sign_in_at: None,
            app_metadata: json!({}),
            user_metadata: json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }

    /// Mark the account confirmed. Never moves an existing `confirmed_at`.
    pub fn confirm(&mut self, now: DateTime<Utc>) {
        if self.confirmed_at.is_none() {
            self.confirmed_at = Some(now);
        }
    }

    pub fn pending(&self, kind: TokenKind) -> Option<&PendingToken> {
        match kind {
            TokenKind::Confirmation => self.confirmation.as_ref(),
            TokenKind::Recovery => self.recovery.as_ref(),
            TokenKind::Invite => self.invite.as_ref(),
            TokenKind::EmailChange => self.email_change.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: TokenKind) -> &mut Option<PendingToken> {
        match kind {
            TokenKind::Confirmation => &mut self.confirmation,
            TokenKind::Recovery => &mut self.recovery,
            TokenKind::Invite => &mut self.invite,
            TokenKind::EmailChange => &mut self.email_change,
        }
    }

    /// Store a fresh token of `kind`, voiding whatever was pending before.
    pub fn set_pending(&mut self, kind: TokenKind, value: String, now: DateTime<Utc>) {
        *self.slot_mut(kind) = Some(PendingToken {
            value,
            issued_at: now,
        });
    }

    pub fn take_pending(&mut self, kind: TokenKind) -> Option<PendingToken> {
        self.slot_mut(kind).take()
    }

    /// True when `token` is the pending value of `kind`.
    pub fn holds(&self, kind: TokenKind, token: &str) -> bool {
        self.pending(kind).is_some_and(|pending| pending.value == token)
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("aud", &self.aud)
            .field("email", &self.email)
            .field("role", &self.role)
            .field(
                "encrypted_password",
                &self.encrypted_password.as_ref().map(|_| "***"),
            )
            .field("confirmed_at", &self.confirmed_at)
            .field("confirmation", &self.confirmation)
            .field("recovery", &self.recovery)
            .field("invite", &self.invite)
            .field("email_change", &self.email_change)
            .field("email_change_to", &self.email_change_to)
            .field("last_sign_in_at", &self.last_sign_in_at)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user() -> User {
        User::new(Uuid::new_v4(), "web", "alice@example.com", Utc::now())
    }

    #[test]
    fn confirm_never_moves_timestamp() {
        let mut user = user();
        let first = Utc::now();
        user.confirm(first);
        user.confirm(first + Duration::hours(1));
        assert_eq!(user.confirmed_at, Some(first));
    }

    #[test]
    fn set_pending_replaces_previous_value() {
        let mut user = user();
        let now = Utc::now();
        user.set_pending(TokenKind::Recovery, "first".into(), now);
        user.set_pending(TokenKind::Recovery, "second".into(), now);
        assert!(!user.holds(TokenKind::Recovery, "first"));
        assert!(user.holds(TokenKind::Recovery, "second"));
        assert!(!user.holds(TokenKind::Confirmation, "second"));
    }

    #[test]
    fn take_pending_clears_slot() {
        let mut user = user();
        user.set_pending(TokenKind::Invite, "abc".into(), Utc::now());
        assert!(user.take_pending(TokenKind::Invite).is_some());
        assert!(user.pending(TokenKind::Invite).is_none());
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut user = user();
        user.encrypted_password = Some("$argon2id$secret".into());
        user.set_pending(TokenKind::Recovery, "super-secret-token".into(), Utc::now());
        let rendered = format!("{user:?}");
        assert!(!rendered.contains("super-secret-token"));
        assert!(!rendered.contains("$argon2id$secret"));
    }
}
