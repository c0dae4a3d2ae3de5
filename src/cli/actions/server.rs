use crate::{
    api::{self, handlers::AuthState, AuthConfig},
    cli::{
        commands::{mailer, session, tokens},
        telemetry,
    },
    credentials::Issuer,
    mailer::{spawn_delivery_worker, LogMailer},
    users::{MemoryUserStore, PgUserStore, Store},
    verification::Engine,
};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

/// DSN selecting the in-process user store.
pub const MEMORY_DSN: &str = "memory://";

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub site_url: String,
    pub instance_id: Uuid,
    pub audience: String,
    pub autoconfirm: bool,
    pub admin_role: String,
    pub tokens: tokens::Options,
    pub session: session::Options,
    pub mailer: mailer::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the signing seed is invalid, the store cannot be reached, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    // Fail on a bad seed before touching the database.
    let issuer = Issuer::from_base64_seed(&args.session.signing_seed, args.session.config())
        .context("Invalid signing seed")?;
    info!(kid = issuer.kid(), "Session signing key loaded");

    let store = connect_store(&args.dsn).await?;
    let engine = Engine::new(store, args.tokens.policy());

    let (delivery, worker) = spawn_delivery_worker(
        Arc::new(LogMailer),
        args.mailer.config(),
        args.site_url.clone(),
    );

    let config = AuthConfig::new(args.site_url)
        .with_instance_id(args.instance_id)
        .with_audience(args.audience)
        .with_autoconfirm(args.autoconfirm)
        .with_admin_role(args.admin_role);
    let state = Arc::new(AuthState::new(config, engine, issuer, delivery));

    // The router owns the last queue handle, so the worker drains once it is gone.
    let result = api::new(args.port, state).await;
    if let Err(err) = worker.await {
        warn!("Delivery worker ended abnormally: {err}");
    }
    telemetry::shutdown_tracer();
    result
}

/// Open the user store named by `dsn` and make sure its schema exists.
///
/// # Errors
/// Returns an error if the database is unreachable or the schema cannot be applied.
pub async fn connect_store(dsn: &str) -> Result<Store> {
    if dsn == MEMORY_DSN {
        warn!("Using the in-memory user store; accounts are lost on restart");
        return Ok(Store::from(MemoryUserStore::new()));
    }

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")?;
    let store = PgUserStore::new(pool);
    store.migrate().await?;
    Ok(Store::from(store))
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("dsn", redact_dsn(&args.dsn)),
        ("site_url", args.site_url.clone()),
        ("instance_id", args.instance_id.to_string()),
        ("audience", args.audience.clone()),
        ("autoconfirm", args.autoconfirm.to_string()),
        ("issuer", args.session.issuer.clone()),
    ];
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "keyward {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in &entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn redact_dsn(dsn: &str) -> String {
    if dsn == MEMORY_DSN {
        return dsn.to_string();
    }
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    if trimmed.len() > 7 {
        trimmed[..7].to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserStore;

    #[test]
    fn redact_dsn_hides_password() {
        assert_eq!(
            redact_dsn("postgres://keyward:hunter2@db:5432/keyward"),
            "postgres://keyward:REDACTED@db:5432/keyward"
        );
        assert_eq!(redact_dsn("memory://"), "memory://");
        assert_eq!(redact_dsn("::"), "invalid-dsn");
    }

    #[test]
    fn short_commit_truncates() {
        assert_eq!(short_commit("0123456789abcdef"), "0123456");
        assert_eq!(short_commit("abc"), "abc");
    }

    #[tokio::test]
    async fn memory_dsn_selects_memory_store() -> Result<()> {
        let store = connect_store(MEMORY_DSN).await?;
        assert_eq!(store.backend(), "memory");
        store.ping().await?;
        Ok(())
    }
}
