use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::Error;

/// Access tokens authorize requests; refresh tokens only mint new sessions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub iss: String,
    pub aud: String,
    /// User id.
    pub sub: Uuid,
    pub instance_id: Uuid,
    pub email: String,
    pub role: String,
    pub confirmed: bool,
    pub typ: TokenType,
    pub iat: String,
    pub exp: String,
    pub jti: String,
}

pub(super) fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(super) fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Issuer, type and time window checks; the signature is verified before this.
pub(super) fn validate_claims(
    claims: &SessionClaims,
    expected_issuer: &str,
    expected_type: TokenType,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    if claims.iss != expected_issuer {
        return Err(Error::InvalidIssuer);
    }
    if claims.typ != expected_type {
        return Err(Error::InvalidType);
    }

    let iat = parse_rfc3339(&claims.iat).ok_or(Error::InvalidIat)?;
    let exp = parse_rfc3339(&claims.exp).ok_or(Error::InvalidExp)?;

    if iat > now {
        return Err(Error::InvalidIat);
    }
    if exp <= now {
        return Err(Error::Expired);
    }
    if exp <= iat {
        return Err(Error::InvalidTtl);
    }
    Ok(())
}
