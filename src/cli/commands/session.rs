use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::credentials::SessionConfig;

pub const ARG_SIGNING_SEED: &str = "signing-seed";
pub const ARG_ISSUER: &str = "issuer";
pub const ARG_ACCESS_TTL: &str = "access-ttl-seconds";
pub const ARG_REFRESH_TTL: &str = "refresh-ttl-seconds";

/// Ten years; anything longer is a misconfiguration.
const MAX_TTL_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Options {
    /// Base64 encoded 32-byte Ed25519 seed.
    pub signing_seed: SecretString,
    pub issuer: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
}

impl Options {
    /// Parse session arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the signing seed is missing or a TTL is not positive
    /// or longer than ten years.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let signing_seed = matches
            .get_one::<String>(ARG_SIGNING_SEED)
            .filter(|seed| !seed.trim().is_empty())
            .map(|seed| SecretString::from(seed.clone()))
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_SIGNING_SEED}"))?;
        let issuer = matches
            .get_one::<String>(ARG_ISSUER)
            .cloned()
            .unwrap_or_else(|| "keyward".to_string());

        let read_ttl = |id: &str| -> anyhow::Result<i64> {
            let ttl = matches
                .get_one::<i64>(id)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))?;
            anyhow::ensure!(ttl > 0, "--{id} must be greater than zero");
            anyhow::ensure!(
                ttl <= MAX_TTL_SECONDS,
                "--{id} must be at most {MAX_TTL_SECONDS} seconds"
            );
            Ok(ttl)
        };

        Ok(Self {
            signing_seed,
            issuer,
            access_ttl_seconds: read_ttl(ARG_ACCESS_TTL)?,
            refresh_ttl_seconds: read_ttl(ARG_REFRESH_TTL)?,
        })
    }

    #[must_use]
    pub fn config(&self) -> SessionConfig {
        SessionConfig::new()
            .with_issuer(self.issuer.clone())
            .with_access_ttl_seconds(self.access_ttl_seconds)
            .with_refresh_ttl_seconds(self.refresh_ttl_seconds)
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SIGNING_SEED)
                .long(ARG_SIGNING_SEED)
                .help("Base64 encoded 32-byte Ed25519 seed used to sign sessions")
                .env("KEYWARD_SIGNING_SEED")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_ISSUER)
                .long(ARG_ISSUER)
                .help("Issuer claim of session tokens")
                .env("KEYWARD_ISSUER")
                .default_value("keyward"),
        )
        .arg(
            Arg::new(ARG_ACCESS_TTL)
                .long(ARG_ACCESS_TTL)
                .help("Access token TTL in seconds")
                .env("KEYWARD_ACCESS_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TTL)
                .long(ARG_REFRESH_TTL)
                .help("Refresh token TTL in seconds")
                .env("KEYWARD_REFRESH_TTL_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(i64)),
        )
}
