use chrono::{DateTime, Duration, Utc};

use super::TokenKind;

const DEFAULT_RECOVERY_TTL_SECONDS: u64 = 24 * 60 * 60;
const DEFAULT_EMAIL_CHANGE_TTL_SECONDS: u64 = 24 * 60 * 60;

/// Per-kind token lifetimes. `None` means the token never expires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenPolicy {
    confirmation: Option<Duration>,
    recovery: Option<Duration>,
    invite: Option<Duration>,
    email_change: Option<Duration>,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            confirmation: None,
            recovery: ttl(DEFAULT_RECOVERY_TTL_SECONDS),
            invite: None,
            email_change: ttl(DEFAULT_EMAIL_CHANGE_TTL_SECONDS),
        }
    }
}

/// `0` disables expiry.
fn ttl(seconds: u64) -> Option<Duration> {
    if seconds == 0 {
        return None;
    }
    i64::try_from(seconds).ok().and_then(Duration::try_seconds)
}

impl TokenPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_confirmation_ttl_seconds(mut self, seconds: u64) -> Self {
        self.confirmation = ttl(seconds);
        self
    }

    #[must_use]
    pub fn with_recovery_ttl_seconds(mut self, seconds: u64) -> Self {
        self.recovery = ttl(seconds);
        self
    }

    #[must_use]
    pub fn with_invite_ttl_seconds(mut self, seconds: u64) -> Self {
        self.invite = ttl(seconds);
        self
    }

    #[must_use]
    pub fn with_email_change_ttl_seconds(mut self, seconds: u64) -> Self {
        self.email_change = ttl(seconds);
        self
    }

    pub fn ttl(&self, kind: TokenKind) -> Option<Duration> {
        match kind {
            TokenKind::Confirmation => self.confirmation,
            TokenKind::Recovery => self.recovery,
            TokenKind::Invite => self.invite,
            TokenKind::EmailChange => self.email_change,
        }
    }

    /// A token is still valid at exactly `issued_at + ttl`.
    pub fn is_expired(&self, kind: TokenKind, issued_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.ttl(kind).is_some_and(|ttl| now - issued_at > ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let policy = TokenPolicy::default();
        assert_eq!(policy.ttl(TokenKind::Confirmation), None);
        assert_eq!(policy.ttl(TokenKind::Invite), None);
        assert_eq!(policy.ttl(TokenKind::Recovery), Some(Duration::hours(24)));
        assert_eq!(policy.ttl(TokenKind::EmailChange), Some(Duration::hours(24)));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let policy = TokenPolicy::new().with_recovery_ttl_seconds(60);
        let issued = Utc::now();
        assert!(!policy.is_expired(TokenKind::Recovery, issued, issued + Duration::seconds(60)));
        assert!(policy.is_expired(TokenKind::Recovery, issued, issued + Duration::seconds(61)));
    }

    #[test]
    fn zero_means_unlimited() {
        let policy = TokenPolicy::new().with_recovery_ttl_seconds(0);
        let issued = Utc::now() - Duration::days(3650);
        assert!(!policy.is_expired(TokenKind::Recovery, issued, Utc::now()));
    }
}
