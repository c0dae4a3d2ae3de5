use clap::{Arg, ArgMatches, Command};

use crate::mailer::MailerConfig;

pub const ARG_MAX_ATTEMPTS: &str = "mailer-max-attempts";
pub const ARG_BACKOFF_BASE: &str = "mailer-backoff-base-seconds";
pub const ARG_BACKOFF_MAX: &str = "mailer-backoff-max-seconds";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

impl Options {
    /// Parse mail delivery arguments from matches.
    ///
    /// # Errors
    /// Returns an error if an argument is missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let missing = |id: &str| anyhow::anyhow!("missing required argument: --{id}");
        Ok(Self {
            max_attempts: matches
                .get_one::<u32>(ARG_MAX_ATTEMPTS)
                .copied()
                .ok_or_else(|| missing(ARG_MAX_ATTEMPTS))?,
            backoff_base_seconds: matches
                .get_one::<u64>(ARG_BACKOFF_BASE)
                .copied()
                .ok_or_else(|| missing(ARG_BACKOFF_BASE))?,
            backoff_max_seconds: matches
                .get_one::<u64>(ARG_BACKOFF_MAX)
                .copied()
                .ok_or_else(|| missing(ARG_BACKOFF_MAX))?,
        })
    }

    #[must_use]
    pub fn config(&self) -> MailerConfig {
        MailerConfig::new()
            .with_max_attempts(self.max_attempts)
            .with_backoff_base_seconds(self.backoff_base_seconds)
            .with_backoff_max_seconds(self.backoff_max_seconds)
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MAX_ATTEMPTS)
                .long(ARG_MAX_ATTEMPTS)
                .help("Max delivery attempts per email")
                .env("KEYWARD_MAILER_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_BACKOFF_BASE)
                .long(ARG_BACKOFF_BASE)
                .help("Base delay for delivery retry backoff")
                .env("KEYWARD_MAILER_BACKOFF_BASE_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_BACKOFF_MAX)
                .long(ARG_BACKOFF_MAX)
                .help("Max delay for delivery retry backoff")
                .env("KEYWARD_MAILER_BACKOFF_MAX_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_flags() -> anyhow::Result<()> {
        temp_env::with_vars([("KEYWARD_MAILER_MAX_ATTEMPTS", None::<&str>)], || {
            let matches = with_args(Command::new("keyward")).get_matches_from(vec![
                "keyward",
                "--mailer-backoff-base-seconds",
                "2",
            ]);
            let config = Options::parse(&matches)?.config();
            assert_eq!(config.max_attempts(), 5);
            assert_eq!(config.backoff_base(), Duration::from_secs(2));
            assert_eq!(config.backoff_max(), Duration::from_secs(300));
            Ok(())
        })
    }
}
