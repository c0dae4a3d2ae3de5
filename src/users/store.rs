use std::future::Future;
use thiserror::Error;
use uuid::Uuid;

use super::{MemoryUserStore, PgUserStore, User};
use crate::verification::TokenKind;

/// How a single user row is located inside one instance.
#[derive(Clone, Copy, Debug)]
pub enum Lookup<'a> {
    Id(Uuid),
    Email { audience: &'a str, email: &'a str },
    Token { kind: TokenKind, token: &'a str },
}

/// Outcome of a transactional step: `Write` persists the (possibly mutated)
/// row and commits, `Keep` rolls back. Both hand `T` back to the caller.
#[derive(Debug)]
pub enum Mutation<T> {
    Write(T),
    Keep(T),
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Serialization failure or deadlock; the caller may retry.
    #[error("concurrent update conflict")]
    Conflict,
    /// Unique `(instance, audience, email)` violated.
    #[error("email already registered in this audience")]
    Duplicate,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Persistence seam for user records.
pub trait UserStore: Send + Sync {
    fn find(
        &self,
        instance_id: Uuid,
        lookup: Lookup<'_>,
    ) -> impl Future<Output = Result<Option<User>, StoreError>> + Send;

    fn create(&self, user: &User) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn update(&self, user: &User) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Lock the row matching `lookup`, run `apply` on it and commit only when
    /// it answers [`Mutation::Write`]. `apply` sees `None` when nothing matches.
    fn transact<T, F>(
        &self,
        instance_id: Uuid,
        lookup: Lookup<'_>,
        apply: F,
    ) -> impl Future<Output = Result<T, StoreError>> + Send
    where
        T: Send,
        F: FnOnce(Option<&mut User>) -> Mutation<T> + Send;

    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Runtime choice between the Postgres and in-memory directories.
#[derive(Clone, Debug)]
pub enum Store {
    Postgres(PgUserStore),
    Memory(MemoryUserStore),
}

impl Store {
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgresql",
            Self::Memory(_) => "memory",
        }
    }
}

impl From<PgUserStore> for Store {
    fn from(store: PgUserStore) -> Self {
        Self::Postgres(store)
    }
}

impl From<MemoryUserStore> for Store {
    fn from(store: MemoryUserStore) -> Self {
        Self::Memory(store)
    }
}

impl UserStore for Store {
    async fn find(&self, instance_id: Uuid, lookup: Lookup<'_>) -> Result<Option<User>, StoreError> {
        match self {
            Self::Postgres(store) => store.find(instance_id, lookup).await,
            Self::Memory(store) => store.find(instance_id, lookup).await,
        }
    }

    async fn create(&self, user: &User) -> Result<(), StoreError> {
        match self {
            Self::Postgres(store) => store.create(user).await,
            Self::Memory(store) => store.create(user).await,
        }
    }

    async fn update(&self, user: &User) -> Result<(), StoreError> {
        match self {
            Self::Postgres(store) => store.update(user).await,
            Self::Memory(store) => store.update(user).await,
        }
    }

    async fn transact<T, F>(
        &self,
        instance_id: Uuid,
        lookup: Lookup<'_>,
        apply: F,
    ) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(Option<&mut User>) -> Mutation<T> + Send,
    {
        match self {
            Self::Postgres(store) => store.transact(instance_id, lookup, apply).await,
            Self::Memory(store) => store.transact(instance_id, lookup, apply).await,
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        match self {
            Self::Postgres(store) => store.ping().await,
            Self::Memory(store) => store.ping().await,
        }
    }
}
