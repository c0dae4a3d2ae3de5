//! User directory: the record model, password hashing and the store seam.
//!
//! Every token mutation goes through [`UserStore::transact`], which reads one user
//! row under a lock, lets the caller decide synchronously what to change, and
//! commits or rolls back in the same unit.

mod memory;
mod model;
mod password;
mod postgres;
mod store;

pub use memory::MemoryUserStore;
pub use model::{PendingToken, User, DEFAULT_ROLE};
pub use password::{hash_password, valid_password, verify_password, MIN_PASSWORD_LENGTH};
pub use postgres::PgUserStore;
pub use store::{Lookup, Mutation, Store, StoreError, UserStore};

use regex::Regex;

/// Normalize an email for lookup/uniqueness checks.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email("  Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn valid_email_rejects_garbage() {
        assert!(valid_email("alice@example.com"));
        assert!(!valid_email("alice"));
        assert!(!valid_email("alice@example"));
        assert!(!valid_email("al ice@example.com"));
    }
}
