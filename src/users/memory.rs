//! In-process user directory for local development and tests.
//!
//! Each user sits behind its own mutex so transactions on different users never
//! wait on each other. Email and token lookups resolve through an index, so no
//! lookup ever waits on a user it does not return. Lock order is always: row
//! map, then one user, then the index.

use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{Lookup, Mutation, StoreError, User, UserStore};
use crate::verification::TokenKind;

type EmailKey = (Uuid, String, String);
type TokenKey = (Uuid, TokenKind, String);

#[derive(Clone, Default)]
pub struct MemoryUserStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: RwLock<HashMap<Uuid, Arc<Mutex<User>>>>,
    index: Mutex<Index>,
}

#[derive(Default)]
struct Index {
    emails: HashMap<EmailKey, Uuid>,
    tokens: HashMap<TokenKey, Uuid>,
}

impl fmt::Debug for MemoryUserStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryUserStore").finish_non_exhaustive()
    }
}

fn email_key(user: &User) -> EmailKey {
    (user.instance_id, user.aud.clone(), user.email.clone())
}

fn token_keys(user: &User) -> impl Iterator<Item = TokenKey> + '_ {
    TokenKind::ALL.into_iter().filter_map(move |kind| {
        user.pending(kind)
            .map(|pending| (user.instance_id, kind, pending.value.clone()))
    })
}

fn matches(user: &User, instance_id: Uuid, lookup: Lookup<'_>) -> bool {
    user.instance_id == instance_id
        && match lookup {
            Lookup::Id(id) => user.id == id,
            Lookup::Email { audience, email } => user.aud == audience && user.email == email,
            Lookup::Token { kind, token } => user.holds(kind, token),
        }
}

impl Index {
    fn resolve(&self, instance_id: Uuid, lookup: Lookup<'_>) -> Option<Uuid> {
        match lookup {
            Lookup::Id(id) => Some(id),
            Lookup::Email { audience, email } => self
                .emails
                .get(&(instance_id, audience.to_string(), email.to_string()))
                .copied(),
            Lookup::Token { kind, token } => self
                .tokens
                .get(&(instance_id, kind, token.to_string()))
                .copied(),
        }
    }

    /// Replace the entries of `before` with those of `after`. Nothing changes
    /// when the new address belongs to another user.
    fn reindex(&mut self, before: Option<&User>, after: &User) -> Result<(), StoreError> {
        let email = email_key(after);
        if self.emails.get(&email).is_some_and(|owner| *owner != after.id) {
            return Err(StoreError::Duplicate);
        }
        if let Some(before) = before {
            self.emails.remove(&email_key(before));
            for key in token_keys(before) {
                if self.tokens.get(&key) == Some(&before.id) {
                    self.tokens.remove(&key);
                }
            }
        }
        self.emails.insert(email, after.id);
        for key in token_keys(after) {
            self.tokens.insert(key, after.id);
        }
        Ok(())
    }
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn locate(
        &self,
        rows: &HashMap<Uuid, Arc<Mutex<User>>>,
        instance_id: Uuid,
        lookup: Lookup<'_>,
    ) -> Option<Arc<Mutex<User>>> {
        let id = self.inner.index.lock().await.resolve(instance_id, lookup)?;
        rows.get(&id).cloned()
    }
}

impl UserStore for MemoryUserStore {
    async fn find(&self, instance_id: Uuid, lookup: Lookup<'_>) -> Result<Option<User>, StoreError> {
        let rows = self.inner.rows.read().await;
        let Some(row) = self.locate(&rows, instance_id, lookup).await else {
            return Ok(None);
        };
        let user = row.lock().await;
        Ok(matches(&user, instance_id, lookup).then(|| user.clone()))
    }

    async fn create(&self, user: &User) -> Result<(), StoreError> {
        let mut rows = self.inner.rows.write().await;
        if rows.contains_key(&user.id) {
            return Err(StoreError::Duplicate);
        }
        self.inner.index.lock().await.reindex(None, user)?;
        rows.insert(user.id, Arc::new(Mutex::new(user.clone())));
        Ok(())
    }

    async fn update(&self, user: &User) -> Result<(), StoreError> {
        let rows = self.inner.rows.read().await;
        let Some(row) = rows.get(&user.id) else {
            return Ok(());
        };
        let mut current = row.lock().await;
        if current.instance_id != user.instance_id {
            return Ok(());
        }
        self.inner
            .index
            .lock()
            .await
            .reindex(Some(&current), user)?;
        *current = user.clone();
        Ok(())
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
        let rows = self.inner.rows.read().await;
        let Some(row) = self.locate(&rows, instance_id, lookup).await else {
            return Ok(unwrap_mutation(apply(None)));
        };
        let mut current = row.lock().await;
        // The row may have changed between resolving and taking the lock.
        if !matches(&current, instance_id, lookup) {
            return Ok(unwrap_mutation(apply(None)));
        }

        let mut draft = current.clone();
        match apply(Some(&mut draft)) {
            Mutation::Write(value) => {
                self.inner
                    .index
                    .lock()
                    .await
                    .reindex(Some(&current), &draft)?;
                *current = draft;
                Ok(value)
            }
            Mutation::Keep(value) => Ok(value),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn unwrap_mutation<T>(mutation: Mutation<T>) -> T {
    match mutation {
        Mutation::Write(value) | Mutation::Keep(value) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn user(instance_id: Uuid, email: &str) -> User {
        User::new(instance_id, "web", email, Utc::now())
    }

    async fn row_count(store: &MemoryUserStore) -> usize {
        store.inner.rows.read().await.len()
    }

    #[tokio::test]
    async fn create_rejects_duplicate_email_in_scope() -> anyhow::Result<()> {
        let store = MemoryUserStore::new();
        let instance = Uuid::new_v4();
        store.create(&user(instance, "a@example.com")).await?;
        let duplicate = store.create(&user(instance, "a@example.com")).await;
        assert!(matches!(duplicate, Err(StoreError::Duplicate)));

        // Same address in another instance is a different account.
        store.create(&user(Uuid::new_v4(), "a@example.com")).await?;
        assert_eq!(row_count(&store).await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn find_by_token_is_instance_scoped() -> anyhow::Result<()> {
        let store = MemoryUserStore::new();
        let instance = Uuid::new_v4();
        let mut alice = user(instance, "a@example.com");
        alice.set_pending(TokenKind::Recovery, "tok".into(), Utc::now());
        store.create(&alice).await?;

        let lookup = Lookup::Token {
            kind: TokenKind::Recovery,
            token: "tok",
        };
        assert!(store.find(instance, lookup).await?.is_some());
        assert!(store.find(Uuid::new_v4(), lookup).await?.is_none());
        let wrong_kind = Lookup::Token {
            kind: TokenKind::Confirmation,
            token: "tok",
        };
        assert!(store.find(instance, wrong_kind).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn consumed_token_leaves_the_index() -> anyhow::Result<()> {
        let store = MemoryUserStore::new();
        let instance = Uuid::new_v4();
        let mut alice = user(instance, "a@example.com");
        alice.set_pending(TokenKind::Recovery, "old".into(), Utc::now());
        store.create(&alice).await?;

        store
            .transact(instance, Lookup::Id(alice.id), |user| {
                if let Some(user) = user {
                    user.set_pending(TokenKind::Recovery, "new".into(), Utc::now());
                }
                Mutation::Write(())
            })
            .await?;
        let old = Lookup::Token {
            kind: TokenKind::Recovery,
            token: "old",
        };
        let new = Lookup::Token {
            kind: TokenKind::Recovery,
            token: "new",
        };
        assert!(store.find(instance, old).await?.is_none());
        assert!(store.find(instance, new).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn lookups_do_not_wait_on_other_users() -> anyhow::Result<()> {
        let store = MemoryUserStore::new();
        let instance = Uuid::new_v4();
        let alice = user(instance, "a@example.com");
        let mut bob = user(instance, "b@example.com");
        bob.set_pending(TokenKind::Confirmation, "bob-token".into(), Utc::now());
        store.create(&alice).await?;
        store.create(&bob).await?;

        // Hold alice's row as an in-flight transaction would.
        let alice_row = store
            .inner
            .rows
            .read()
            .await
            .get(&alice.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("alice missing"))?;
        let _held = alice_row.lock().await;

        let by_token = Lookup::Token {
            kind: TokenKind::Confirmation,
            token: "bob-token",
        };
        let found = timeout(Duration::from_secs(1), store.find(instance, by_token)).await??;
        assert_eq!(found.map(|user| user.id), Some(bob.id));

        let by_email = Lookup::Email {
            audience: "web",
            email: "b@example.com",
        };
        let consumed = timeout(
            Duration::from_secs(1),
            store.transact(instance, by_email, |user| {
                if let Some(user) = user {
                    user.take_pending(TokenKind::Confirmation);
                }
                Mutation::Write(())
            }),
        )
        .await?;
        consumed?;
        Ok(())
    }

    #[tokio::test]
    async fn keep_discards_changes() -> anyhow::Result<()> {
        let store = MemoryUserStore::new();
        let instance = Uuid::new_v4();
        let alice = user(instance, "a@example.com");
        store.create(&alice).await?;

        store
            .transact(instance, Lookup::Id(alice.id), |user| {
                if let Some(user) = user {
                    user.role = "admin".into();
                }
                Mutation::Keep(())
            })
            .await?;
        let stored = store.find(instance, Lookup::Id(alice.id)).await?;
        assert_eq!(stored.map(|u| u.role), Some("authenticated".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn write_moving_to_taken_email_is_duplicate() -> anyhow::Result<()> {
        let store = MemoryUserStore::new();
        let instance = Uuid::new_v4();
        let alice = user(instance, "a@example.com");
        store.create(&alice).await?;
        store.create(&user(instance, "b@example.com")).await?;

        let result = store
            .transact(instance, Lookup::Id(alice.id), |user| {
                if let Some(user) = user {
                    user.email = "b@example.com".into();
                }
                Mutation::Write(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Duplicate)));
        let stored = store.find(instance, Lookup::Id(alice.id)).await?;
        assert_eq!(stored.map(|u| u.email), Some("a@example.com".to_string()));
        Ok(())
    }
}
