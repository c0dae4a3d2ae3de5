use thiserror::Error;

use crate::users::StoreError;

/// Failures of the verification engine. Handlers map each variant to a status.
#[derive(Debug, Error)]
pub enum Error {
    /// No user in the requested instance and audience.
    #[error("user not found")]
    NotFound,
    /// Token never issued, already consumed, superseded or of another kind.
    #[error("invalid token")]
    InvalidToken,
    /// Token matched but outlived its TTL. Nothing was consumed.
    #[error("token expired")]
    ExpiredToken,
    /// The store kept reporting concurrent writers after one retry.
    #[error("concurrent update conflict")]
    Conflict,
    #[error("email already registered")]
    EmailTaken,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("email not confirmed")]
    NotConfirmed,
    /// Entropy or hashing failed; no safe result can be produced.
    #[error("service unavailable")]
    Fatal(#[source] anyhow::Error),
    #[error("user store failure")]
    Store(#[source] anyhow::Error),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict => Self::Conflict,
            StoreError::Duplicate => Self::EmailTaken,
            StoreError::Backend(err) => Self::Store(err),
        }
    }
}
