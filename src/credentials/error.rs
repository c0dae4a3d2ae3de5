use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid footer")]
    InvalidFooter,
    #[error("missing footer")]
    MissingFooter,
    #[error("invalid base64 encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("invalid signing key length")]
    InvalidKeyLength,
    #[error("invalid key type")]
    InvalidKeyType,
    #[error("invalid paserk id")]
    InvalidPaserkId,
    #[error("unknown key id: {0}")]
    UnknownKid(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid issued-at")]
    InvalidIat,
    #[error("invalid expiration")]
    InvalidExp,
    #[error("token expired")]
    Expired,
    #[error("invalid token ttl")]
    InvalidTtl,
    #[error("unexpected token type")]
    InvalidType,
    #[error("invalid length")]
    InvalidLength,
}

impl From<pasetors::errors::Error> for Error {
    fn from(err: pasetors::errors::Error) -> Self {
        use pasetors::errors::Error as Paseto;
        match err {
            Paseto::Base64 => Self::Base64,
            Paseto::TokenValidation => Self::InvalidSignature,
            Paseto::FooterParsing => Self::InvalidFooter,
            Paseto::LossyConversion => Self::InvalidLength,
            Paseto::Key => Self::InvalidKeyType,
            _ => Self::TokenFormat,
        }
    }
}
