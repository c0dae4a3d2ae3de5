//! One-time token lifetimes. `0` means the token never expires.

use clap::{Arg, ArgMatches, Command};

use crate::verification::TokenPolicy;

pub const ARG_CONFIRMATION_TTL: &str = "confirmation-ttl-seconds";
pub const ARG_RECOVERY_TTL: &str = "recovery-ttl-seconds";
pub const ARG_INVITE_TTL: &str = "invite-ttl-seconds";
pub const ARG_EMAIL_CHANGE_TTL: &str = "email-change-ttl-seconds";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub confirmation_ttl_seconds: u64,
    pub recovery_ttl_seconds: u64,
    pub invite_ttl_seconds: u64,
    pub email_change_ttl_seconds: u64,
}

impl Options {
    /// Parse token TTL arguments from matches.
    ///
    /// # Errors
    /// Returns an error if an argument is missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let read = |id: &str| -> anyhow::Result<u64> {
            matches
                .get_one::<u64>(id)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
        };

        Ok(Self {
            confirmation_ttl_seconds: read(ARG_CONFIRMATION_TTL)?,
            recovery_ttl_seconds: read(ARG_RECOVERY_TTL)?,
            invite_ttl_seconds: read(ARG_INVITE_TTL)?,
            email_change_ttl_seconds: read(ARG_EMAIL_CHANGE_TTL)?,
        })
    }

    #[must_use]
    pub fn policy(&self) -> TokenPolicy {
        TokenPolicy::new()
            .with_confirmation_ttl_seconds(self.confirmation_ttl_seconds)
            .with_recovery_ttl_seconds(self.recovery_ttl_seconds)
            .with_invite_ttl_seconds(self.invite_ttl_seconds)
            .with_email_change_ttl_seconds(self.email_change_ttl_seconds)
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_CONFIRMATION_TTL)
                .long(ARG_CONFIRMATION_TTL)
                .help("Confirmation token TTL in seconds (0 = no expiry)")
                .env("KEYWARD_CONFIRMATION_TTL_SECONDS")
                .default_value("0")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_RECOVERY_TTL)
                .long(ARG_RECOVERY_TTL)
                .help("Recovery token TTL in seconds (0 = no expiry)")
                .env("KEYWARD_RECOVERY_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_INVITE_TTL)
                .long(ARG_INVITE_TTL)
                .help("Invite token TTL in seconds (0 = no expiry)")
                .env("KEYWARD_INVITE_TTL_SECONDS")
                .default_value("0")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_EMAIL_CHANGE_TTL)
                .long(ARG_EMAIL_CHANGE_TTL)
                .help("Email change token TTL in seconds (0 = no expiry)")
                .env("KEYWARD_EMAIL_CHANGE_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64)),
        )
}
