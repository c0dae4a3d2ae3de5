//! Delivery of verification links.
//!
//! Handlers call [`DeliveryQueue::deliver`] after a token was issued and
//! committed. The message goes onto an unbounded channel; a background worker
//! hands it to a [`Mailer`] and retries failures with exponential backoff and
//! jitter. A failed delivery is logged and never undoes the issuance: the user
//! can always ask for a resend.
//!
//! Once every queue handle is dropped the worker waits up to the shutdown grace
//! period for messages still being retried, then logs and drops the rest.
//!
//! The default mailer for local dev is [`LogMailer`], which logs the recipient
//! and kind but never the link, since the link embeds the token.

use anyhow::Result;
use rand::Rng;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::verification::TokenKind;

#[derive(Clone)]
pub struct EmailMessage {
    pub to_email: String,
    pub kind: TokenKind,
    /// Carries the raw token.
    pub link: String,
}

impl fmt::Debug for EmailMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailMessage")
            .field("to_email", &self.to_email)
            .field("kind", &self.kind)
            .field("link", &"***")
            .finish()
    }
}

/// Delivery abstraction used by the worker.
pub trait Mailer: Send + Sync {
    /// Deliver a message or return an error to have it retried.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            kind = %message.kind,
            "verification email send stub"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MailerConfig {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    shutdown_grace: Duration,
}

impl MailerConfig {
    /// Default: 5 attempts, 5s->5m exponential backoff with jitter, 10s to
    /// drain on shutdown.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let max_attempts = self.max_attempts.max(1);
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_millis(1)
        } else {
            self.backoff_base
        };
        let backoff_max = if self.backoff_max < backoff_base {
            backoff_base
        } else {
            self.backoff_max
        };
        Self {
            max_attempts,
            backoff_base,
            backoff_max,
            shutdown_grace: self.shutdown_grace,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Link the user follows from the email: `{site_url}/#{kind}_token={token}`.
pub fn build_link(site_url: &str, kind: TokenKind, token: &str) -> String {
    let base = site_url.trim_end_matches('/');
    format!("{base}/#{kind}_token={token}")
}

/// Handler-side entry point to the delivery worker.
#[derive(Clone, Debug)]
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<EmailMessage>,
    site_url: String,
}

impl DeliveryQueue {
    /// Fire and forget; the caller's request does not wait for delivery.
    pub fn deliver(&self, to_email: &str, kind: TokenKind, token: &str) {
        let message = EmailMessage {
            to_email: to_email.to_string(),
            kind,
            link: build_link(&self.site_url, kind, token),
        };
        if self.tx.send(message).is_err() {
            error!(%kind, "delivery worker stopped, message dropped");
        }
    }
}

/// Spawn the worker and return the queue feeding it. The worker exits once
/// every [`DeliveryQueue`] clone is dropped and in-flight messages are drained;
/// await the handle on shutdown.
pub fn spawn_delivery_worker(
    mailer: Arc<dyn Mailer>,
    config: MailerConfig,
    site_url: String,
) -> (DeliveryQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<EmailMessage>();
    let config = config.normalize();
    let handle = tokio::spawn(async move {
        // Retries sleep, so each message gets its own task to keep the queue moving.
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    let mailer = Arc::clone(&mailer);
                    in_flight.spawn(async move {
                        deliver_with_retry(mailer.as_ref(), &message, &config).await;
                    });
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }
        drain(in_flight, config.shutdown_grace()).await;
    });
    (DeliveryQueue { tx, site_url }, handle)
}

async fn drain(mut in_flight: JoinSet<()>, grace: Duration) {
    if in_flight.is_empty() {
        debug!("delivery queue closed");
        return;
    }
    info!(
        pending = in_flight.len(),
        "delivery queue closed, waiting for in-flight messages"
    );
    let drained = timeout(grace, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        error!(
            dropped = in_flight.len(),
            "shutdown grace period elapsed, undelivered messages dropped"
        );
        in_flight.abort_all();
    }
}

/// Returns whether the message was delivered.
async fn deliver_with_retry(mailer: &dyn Mailer, message: &EmailMessage, config: &MailerConfig) -> bool {
    let mut attempt = 1;
    loop {
        match mailer.send(message) {
            Ok(()) => return true,
            Err(err) if attempt >= config.max_attempts() => {
                error!(
                    to_email = %message.to_email,
                    kind = %message.kind,
                    attempt,
                    "email delivery failed permanently: {err}"
                );
                return false;
            }
            Err(err) => {
                let delay = backoff_delay(attempt, config.backoff_base(), config.backoff_max());
                warn!(
                    to_email = %message.to_email,
                    kind = %message.kind,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "email delivery failed, retrying: {err}"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
