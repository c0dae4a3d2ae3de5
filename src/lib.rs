//! # Keyward
//!
//! `keyward` is an identity backend: it keeps user accounts, hands out
//! one-time verification tokens and signs session credentials.
//!
//! ## One-time tokens
//!
//! A user record carries at most one pending token per kind:
//!
//! | kind           | issued by                     | consuming it                         |
//! |----------------|-------------------------------|--------------------------------------|
//! | `confirmation` | signup, resend                | confirms the account                 |
//! | `recovery`     | `/v1/recover`, resend         | confirms, optionally sets a password |
//! | `invite`       | `/v1/invite` (admin), resend  | confirms and sets the first password |
//! | `email_change` | `PUT /v1/user`, resend        | confirms and moves the email address |
//!
//! Issuing a token replaces the pending one of the same kind, so only the
//! latest link works. A token is consumed at most once: lookup, expiry check
//! and clearing happen in one transaction on the user row (see
//! [`users::UserStore::transact`]). An expired token is rejected but left in
//! place, so repeating the request keeps reporting the expiry.
//!
//! ## Sessions
//!
//! Access and refresh tokens are PASETO `v4.public` signed with an Ed25519 key
//! derived from a configured seed. The footer carries the key id as a PASERK
//! `k4.pid`.
//!
//! ## Storage
//!
//! Users live in `PostgreSQL` (schema in `db/sql/01_users.sql`, applied at
//! startup). The `memory://` DSN selects an in-process store for local
//! development and tests.

pub mod api;
pub mod cli;
pub mod credentials;
pub mod mailer;
pub mod tokens;
pub mod users;
pub mod verification;

pub use api::GIT_COMMIT_HASH;
