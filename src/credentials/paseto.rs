//! PASETO `v4.public` signing and verification through `pasetors`.
//!
//! The footer is JSON `{"kid": "k4.pid..."}`. Verification reads the key id
//! from the untrusted footer first so tokens from a rotated key fail with
//! [`Error::UnknownKid`] instead of a bare signature error.

use pasetors::keys::{AsymmetricPublicKey, AsymmetricSecretKey};
use pasetors::paserk::{FormatAsPaserk, Id};
use pasetors::token::UntrustedToken;
use pasetors::version4::{PublicToken, V4};
use pasetors::Public;
use serde::{Deserialize, Serialize};

use super::{Error, SessionClaims};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(super) struct SessionFooter {
    pub kid: String,
}

pub(super) fn sign(
    claims: &SessionClaims,
    footer: &SessionFooter,
    secret_key: &AsymmetricSecretKey<V4>,
) -> Result<String, Error> {
    let payload = serde_json::to_vec(claims)?;
    let footer = serde_json::to_vec(footer)?;
    Ok(PublicToken::sign(
        secret_key,
        &payload,
        Some(footer.as_slice()),
        None,
    )?)
}

pub(super) fn verify(
    token: &str,
    kid: &str,
    public_key: &AsymmetricPublicKey<V4>,
) -> Result<SessionClaims, Error> {
    let untrusted = UntrustedToken::<Public, V4>::try_from(token)?;
    if untrusted.untrusted_footer().is_empty() {
        return Err(Error::MissingFooter);
    }
    let footer: SessionFooter =
        serde_json::from_slice(untrusted.untrusted_footer()).map_err(|_| Error::InvalidFooter)?;
    if footer.kid != kid {
        return Err(Error::UnknownKid(footer.kid));
    }

    let trusted = PublicToken::verify(public_key, &untrusted, None, None)?;
    Ok(serde_json::from_str(trusted.payload())?)
}

/// PASERK `k4.pid` of a public key.
pub(super) fn format_kid(key: &AsymmetricPublicKey<V4>) -> Result<String, Error> {
    let mut kid = String::new();
    Id::from(key)
        .fmt(&mut kid)
        .map_err(|_| Error::InvalidPaserkId)?;
    Ok(kid)
}
