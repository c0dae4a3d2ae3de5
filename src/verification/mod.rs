//! One-time token lifecycle: issue, verify and consume confirmation, recovery,
//! invite and email change tokens.
//!
//! The [`Engine`] never caches tokens and never spawns work. Every mutation is a
//! single [`UserStore::transact`](crate::users::UserStore::transact) call, so a
//! token is consumed at most once even when the same value is presented by
//! concurrent requests.

mod accounts;
mod engine;
mod error;
mod kind;
mod policy;

pub use accounts::{Registered, SignupRequest};
pub use engine::{Engine, Identifier, Issued};
pub use error::Error;
pub use kind::TokenKind;
pub use policy::TokenPolicy;
