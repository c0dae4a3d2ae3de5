//! Map parsed CLI arguments to the action to run.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{
    self, mailer, session, tokens, ARG_ADMIN_ROLE, ARG_AUDIENCE, ARG_AUTOCONFIRM, ARG_DSN,
    ARG_INSTANCE_ID, ARG_PORT, ARG_SITE_URL,
};
use anyhow::{Context, Result};
use url::Url;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    let site_url = matches
        .get_one::<String>(ARG_SITE_URL)
        .cloned()
        .context("missing required argument: --site-url")?;
    Url::parse(&site_url).context("invalid KEYWARD_SITE_URL")?;

    let instance_id = matches
        .get_one::<uuid::Uuid>(ARG_INSTANCE_ID)
        .copied()
        .context("missing required argument: --instance-id")?;
    let audience = matches
        .get_one::<String>(ARG_AUDIENCE)
        .cloned()
        .context("missing required argument: --audience")?;
    let admin_role = matches
        .get_one::<String>(ARG_ADMIN_ROLE)
        .cloned()
        .context("missing required argument: --admin-role")?;

    Ok(Action::Server(Args {
        port,
        dsn,
        site_url,
        instance_id,
        audience,
        autoconfirm: matches.get_flag(ARG_AUTOCONFIRM),
        admin_role,
        tokens: tokens::Options::parse(matches)?,
        session: session::Options::parse(matches)?,
        mailer: mailer::Options::parse(matches)?,
    }))
}
