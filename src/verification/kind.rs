use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// The four kinds of one-time tokens a user record can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    #[serde(alias = "signup")]
    Confirmation,
    Recovery,
    Invite,
    EmailChange,
}

impl TokenKind {
    pub const ALL: [Self; 4] = [
        Self::Confirmation,
        Self::Recovery,
        Self::Invite,
        Self::EmailChange,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmation => "confirmation",
            Self::Recovery => "recovery",
            Self::Invite => "invite",
            Self::EmailChange => "email_change",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
