//! Signed session credentials (PASETO `v4.public`, Ed25519).
//!
//! An [`Issuer`] is built once at startup from a 32-byte seed. Access and
//! refresh tokens carry the same claims and differ only in `typ` and lifetime.

mod claims;
mod error;
mod paseto;

pub use claims::{SessionClaims, TokenType};
pub use error::Error;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::SigningKey;
use pasetors::{
    keys::{AsymmetricPublicKey, AsymmetricSecretKey},
    version4::V4,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;
use utoipa::ToSchema;

use crate::users::User;
use claims::{rfc3339, validate_claims};
use paseto::SessionFooter;

const DEFAULT_ACCESS_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_REFRESH_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_ISSUER: &str = "keyward";

#[derive(Clone, Debug)]
pub struct SessionConfig {
    issuer: String,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }
}

/// What the client receives after signing in.
#[derive(Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionCredential {
    pub access_token: String,
    pub token_type: String,
    /// Seconds until the access token expires.
    pub expires_in: i64,
    /// Unix timestamp of access token expiry.
    pub expires_at: i64,
    pub refresh_token: String,
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("access_token", &"***")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .field("refresh_token", &"***")
            .finish()
    }
}

pub struct Issuer {
    config: SessionConfig,
    secret_key: AsymmetricSecretKey<V4>,
    public_key: AsymmetricPublicKey<V4>,
    kid: String,
}

impl fmt::Debug for Issuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Issuer")
            .field("config", &self.config)
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl Issuer {
    /// # Errors
    /// Returns an error if the derived public key cannot be used for PASETO.
    pub fn from_seed(seed: &[u8; 32], config: SessionConfig) -> Result<Self, Error> {
        let signing_key = SigningKey::from_bytes(seed);
        let secret_key = AsymmetricSecretKey::<V4>::from(signing_key.to_keypair_bytes().as_slice())
            .map_err(|_| Error::InvalidKeyType)?;
        let public_key =
            AsymmetricPublicKey::<V4>::from(signing_key.verifying_key().as_bytes().as_slice())
                .map_err(|_| Error::InvalidKeyType)?;
        let kid = paseto::format_kid(&public_key)?;
        Ok(Self {
            config,
            secret_key,
            public_key,
            kid,
        })
    }

    /// Build from a standard base64 encoded 32-byte seed.
    ///
    /// # Errors
    /// Returns an error if the value is not base64 or not 32 bytes long.
    pub fn from_base64_seed(seed: &SecretString, config: SessionConfig) -> Result<Self, Error> {
        let raw = Base64::decode_vec(seed.expose_secret().trim()).map_err(|_| Error::Base64)?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidKeyLength)?;
        Self::from_seed(&bytes, config)
    }

    /// PASERK `k4.pid` placed in every token footer.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// # Errors
    /// Returns an error if signing fails.
    pub fn issue(&self, user: &User) -> Result<SessionCredential, Error> {
        self.issue_at(user, Utc::now())
    }

    /// # Errors
    /// Returns an error if signing fails or a configured TTL does not fit a
    /// timestamp.
    pub fn issue_at(&self, user: &User, now: DateTime<Utc>) -> Result<SessionCredential, Error> {
        let access_exp = expiry(now, self.config.access_ttl_seconds)?;
        let refresh_exp = expiry(now, self.config.refresh_ttl_seconds)?;
        let access_token = self.sign(user, TokenType::Access, now, access_exp)?;
        let refresh_token = self.sign(user, TokenType::Refresh, now, refresh_exp)?;
        Ok(SessionCredential {
            access_token,
            token_type: "bearer".to_string(),
            expires_in: self.config.access_ttl_seconds,
            expires_at: access_exp.timestamp(),
            refresh_token,
        })
    }

    /// Verify signature, key id, issuer, type and time window.
    ///
    /// # Errors
    /// Returns an error describing the first failed check.
    pub fn verify(
        &self,
        token: &str,
        expected_type: TokenType,
        now: DateTime<Utc>,
    ) -> Result<SessionClaims, Error> {
        let claims = paseto::verify(token, &self.kid, &self.public_key)?;
        validate_claims(&claims, &self.config.issuer, expected_type, now)?;
        Ok(claims)
    }

    fn sign(
        &self,
        user: &User,
        typ: TokenType,
        iat: DateTime<Utc>,
        exp: DateTime<Utc>,
    ) -> Result<String, Error> {
        let claims = SessionClaims {
            iss: self.config.issuer.clone(),
            aud: user.aud.clone(),
            sub: user.id,
            instance_id: user.instance_id,
            email: user.email.clone(),
            role: user.role.clone(),
            confirmed: user.confirmed(),
            typ,
            iat: rfc3339(iat),
            exp: rfc3339(exp),
            jti: Ulid::new().to_string(),
        };
        let footer = SessionFooter {
            kid: self.kid.clone(),
        };
        paseto::sign(&claims, &footer, &self.secret_key)
    }
}

fn expiry(now: DateTime<Utc>, ttl_seconds: i64) -> Result<DateTime<Utc>, Error> {
    Duration::try_seconds(ttl_seconds)
        .filter(|ttl| *ttl > Duration::zero())
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or(Error::InvalidTtl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64ct::Base64UrlUnpadded;
    use uuid::Uuid;

    fn issuer() -> Result<Issuer, Error> {
        let config = SessionConfig::new().with_issuer("https://id.example.test".into());
        Issuer::from_seed(&[7u8; 32], config)
    }

    fn user() -> User {
        User::new(Uuid::new_v4(), "web", "alice@example.com", Utc::now())
    }

    #[test]
    fn issue_and_verify() -> Result<(), Error> {
        let issuer = issuer()?;
        let user = user();
        let now = Utc::now();
        let session = issuer.issue_at(&user, now)?;
        assert!(session.access_token.starts_with("v4.public."));
        assert_eq!(session.expires_in, 3600);

        let claims = issuer.verify(&session.access_token, TokenType::Access, now)?;
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.instance_id, user.instance_id);
        assert_eq!(claims.aud, "web");
        assert_eq!(claims.role, "authenticated");
        assert!(!claims.confirmed);

        let refresh = issuer.verify(&session.refresh_token, TokenType::Refresh, now)?;
        assert_eq!(refresh.sub, user.id);
        assert_ne!(refresh.jti, claims.jti);
        Ok(())
    }

    #[test]
    fn kid_is_paserk_pid() -> Result<(), Error> {
        assert!(issuer()?.kid().starts_with("k4.pid."));
        Ok(())
    }

    #[test]
    fn rejects_wrong_type() -> Result<(), Error> {
        let issuer = issuer()?;
        let now = Utc::now();
        let session = issuer.issue_at(&user(), now)?;
        let result = issuer.verify(&session.refresh_token, TokenType::Access, now);
        assert!(matches!(result, Err(Error::InvalidType)));
        Ok(())
    }

    #[test]
    fn rejects_expired_access_token() -> Result<(), Error> {
        let issuer = issuer()?;
        let issued_at = Utc::now() - Duration::hours(2);
        let session = issuer.issue_at(&user(), issued_at)?;
        let result = issuer.verify(&session.access_token, TokenType::Access, Utc::now());
        assert!(matches!(result, Err(Error::Expired)));
        Ok(())
    }

    #[test]
    fn rejects_foreign_key() -> Result<(), Error> {
        let ours = issuer()?;
        let theirs = Issuer::from_seed(&[9u8; 32], SessionConfig::new())?;
        let now = Utc::now();
        let session = theirs.issue_at(&user(), now)?;
        let result = ours.verify(&session.access_token, TokenType::Access, now);
        assert!(matches!(result, Err(Error::UnknownKid(kid)) if kid == theirs.kid()));
        Ok(())
    }

    #[test]
    fn rejects_tampered_payload() -> Result<(), Error> {
        let issuer = issuer()?;
        let now = Utc::now();
        let session = issuer.issue_at(&user(), now)?;
        let mut parts: Vec<String> = session
            .access_token
            .split('.')
            .map(ToString::to_string)
            .collect();
        let mut body =
            Base64UrlUnpadded::decode_vec(&parts[2]).map_err(|_| Error::Base64)?;
        body[5] ^= 0x01;
        parts[2] = Base64UrlUnpadded::encode_string(&body);
        let result = issuer.verify(&parts.join("."), TokenType::Access, now);
        assert!(matches!(result, Err(Error::InvalidSignature)));
        Ok(())
    }

    #[test]
    fn oversized_ttl_is_an_error() -> Result<(), Error> {
        let config = SessionConfig::new().with_refresh_ttl_seconds(1_000_000_000_000_000);
        let issuer = Issuer::from_seed(&[7u8; 32], config)?;
        assert!(matches!(
            issuer.issue_at(&user(), Utc::now()),
            Err(Error::InvalidTtl)
        ));

        let config = SessionConfig::new().with_access_ttl_seconds(i64::MAX);
        let issuer = Issuer::from_seed(&[7u8; 32], config)?;
        assert!(matches!(
            issuer.issue_at(&user(), Utc::now()),
            Err(Error::InvalidTtl)
        ));
        Ok(())
    }

    #[test]
    fn from_base64_seed_checks_length() {
        let short = SecretString::from("AAAA".to_string());
        assert!(matches!(
            Issuer::from_base64_seed(&short, SessionConfig::new()),
            Err(Error::InvalidKeyLength)
        ));
        let seed = SecretString::from(Base64::encode_string(&[1u8; 32]));
        assert!(Issuer::from_base64_seed(&seed, SessionConfig::new()).is_ok());
    }
}
