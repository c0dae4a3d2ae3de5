use chrono::{DateTime, Utc};
use std::{fmt, future::Future};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{Error, TokenKind, TokenPolicy};
use crate::{
    tokens::generate_token,
    users::{hash_password, normalize_email, Lookup, Mutation, StoreError, User, UserStore},
};

/// Conflicting writers are retried this many times before giving up.
const CONFLICT_RETRIES: usize = 1;

/// Who a token is issued to.
#[derive(Clone, Copy, Debug)]
pub enum Identifier<'a> {
    Email(&'a str),
    Id(Uuid),
}

/// A freshly issued token and the user it now belongs to.
///
/// The token leaves the engine only through this value; callers hand it to the
/// delivery queue and never put it in a response or a log line.
#[derive(Clone)]
pub struct Issued {
    pub user: User,
    pub token: String,
}

impl fmt::Debug for Issued {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Issued")
            .field("user", &self.user)
            .field("token", &"***")
            .finish()
    }
}

pub struct Engine<S> {
    pub(super) store: S,
    pub(super) policy: TokenPolicy,
}

impl<S: fmt::Debug> fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("policy", &self.policy)
            .finish()
    }
}

pub(super) fn fatal(err: impl Into<anyhow::Error>, context: &'static str) -> Error {
    Error::Fatal(err.into().context(context))
}

impl<S: UserStore> Engine<S> {
    pub fn new(store: S, policy: TokenPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `transaction` again when the store reports a conflict, up to
    /// [`CONFLICT_RETRIES`] times.
    pub(super) async fn retry_conflicts<T, Fut>(
        &self,
        operation: &'static str,
        mut transaction: impl FnMut() -> Fut,
    ) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match transaction().await {
                Err(StoreError::Conflict) if attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(operation, attempt, "retrying after write conflict");
                }
                result => return result,
            }
        }
    }

    /// Issue a new token of `kind`, voiding any unconsumed one of the same kind.
    ///
    /// # Errors
    /// `NotFound` when no user matches in `(instance, audience)`, or when an
    /// invite is requested for an account that is already confirmed.
    #[instrument(skip_all, fields(instance_id = %instance_id, kind = %kind))]
    pub async fn issue(
        &self,
        instance_id: Uuid,
        audience: &str,
        kind: TokenKind,
        identifier: Identifier<'_>,
        now: DateTime<Utc>,
    ) -> Result<Issued, Error> {
        let email;
        let lookup = match identifier {
            Identifier::Email(raw) => {
                email = normalize_email(raw);
                Lookup::Email {
                    audience,
                    email: &email,
                }
            }
            Identifier::Id(id) => Lookup::Id(id),
        };
        let token = generate_token().map_err(|err| fatal(err, "failed to generate token"))?;
        let value = token.as_str();

        let user = self
            .retry_conflicts("issue", move || {
                self.store.transact(instance_id, lookup, move |user| {
                    stamp(user, audience, kind, value, now)
                })
            })
            .await??;
        debug!(user_id = %user.id, "token issued");
        Ok(Issued { user, token })
    }

    /// Consume a token of `kind`, confirming the user. An `email_change` token
    /// also moves the account to its pending address.
    ///
    /// # Errors
    /// `InvalidToken` if nothing in the instance holds `token` as its pending
    /// `kind` token, `ExpiredToken` if it outlived its TTL (nothing is written),
    /// `EmailTaken` if the pending address was claimed by another account
    /// meanwhile (the token stays pending).
    pub async fn verify(
        &self,
        instance_id: Uuid,
        kind: TokenKind,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<User, Error> {
        match kind {
            TokenKind::EmailChange => {
                self.consume(instance_id, kind, token, now, move_to_pending_email)
                    .await
            }
            _ => {
                self.consume(instance_id, kind, token, now, |_| Ok(()))
                    .await
            }
        }
    }

    pub async fn confirm_user(
        &self,
        instance_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<User, Error> {
        self.verify(instance_id, TokenKind::Confirmation, token, now)
            .await
    }

    /// Consume a recovery token and set a new password in the same transaction.
    /// The password is hashed before the row is locked.
    pub async fn recover_password(
        &self,
        instance_id: Uuid,
        token: &str,
        new_password: &str,
        now: DateTime<Utc>,
    ) -> Result<User, Error> {
        let hash = hash_password(new_password).map_err(Error::Fatal)?;
        self.consume(instance_id, TokenKind::Recovery, token, now, |user| {
            user.encrypted_password = Some(hash.clone());
            Ok(())
        })
        .await
    }

    /// Consume an invite token and set the invited account's first password.
    pub async fn accept_invite(
        &self,
        instance_id: Uuid,
        token: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<User, Error> {
        let hash = hash_password(password).map_err(Error::Fatal)?;
        self.consume(instance_id, TokenKind::Invite, token, now, |user| {
            user.encrypted_password = Some(hash.clone());
            Ok(())
        })
        .await
    }

    pub async fn confirm_email_change(
        &self,
        instance_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<User, Error> {
        self.verify(instance_id, TokenKind::EmailChange, token, now)
            .await
    }

    #[instrument(skip_all, fields(instance_id = %instance_id, kind = %kind))]
    async fn consume<A>(
        &self,
        instance_id: Uuid,
        kind: TokenKind,
        token: &str,
        now: DateTime<Utc>,
        effect: A,
    ) -> Result<User, Error>
    where
        A: Fn(&mut User) -> Result<(), Error> + Send + Sync,
    {
        if token.is_empty() {
            return Err(Error::InvalidToken);
        }
        let lookup = Lookup::Token { kind, token };
        let policy = &self.policy;
        let effect = &effect;

        let user = self
            .retry_conflicts("consume", move || {
                self.store.transact(instance_id, lookup, move |user| {
                    let Some(user) = user else {
                        return Mutation::Keep(Err(Error::InvalidToken));
                    };
                    let Some(pending) = user.pending(kind).filter(|p| p.value == token) else {
                        return Mutation::Keep(Err(Error::InvalidToken));
                    };
                    if policy.is_expired(kind, pending.issued_at, now) {
                        return Mutation::Keep(Err(Error::ExpiredToken));
                    }
                    user.take_pending(kind);
                    user.confirm(now);
                    if let Err(err) = effect(user) {
                        return Mutation::Keep(Err(err));
                    }
                    user.updated_at = now;
                    Mutation::Write(Ok(user.clone()))
                })
            })
            .await??;
        debug!(user_id = %user.id, "token consumed");
        Ok(user)
    }
}

fn move_to_pending_email(user: &mut User) -> Result<(), Error> {
    let email = user.email_change_to.take().ok_or(Error::InvalidToken)?;
    user.email = email;
    Ok(())
}

/// Transaction body for issuance.
fn stamp(
    user: Option<&mut User>,
    audience: &str,
    kind: TokenKind,
    token: &str,
    now: DateTime<Utc>,
) -> Mutation<Result<User, Error>> {
    let Some(user) = user.filter(|user| user.aud == audience) else {
        return Mutation::Keep(Err(Error::NotFound));
    };
    match kind {
        TokenKind::Invite if user.confirmed() => return Mutation::Keep(Err(Error::NotFound)),
        TokenKind::EmailChange if user.email_change_to.is_none() => {
            return Mutation::Keep(Err(Error::NotFound));
        }
        _ => {}
    }
    user.set_pending(kind, token.to_string(), now);
    user.updated_at = now;
    Mutation::Write(Ok(user.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::{MemoryUserStore, Store};
    use anyhow::Result;
    use chrono::Duration;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    const AUD: &str = "web";

    async fn engine_with_user(policy: TokenPolicy) -> Result<(Engine<Store>, Uuid, User)> {
        let store = MemoryUserStore::new();
        let instance = Uuid::new_v4();
        let user = User::new(instance, AUD, "alice@example.com", Utc::now());
        store.create(&user).await?;
        Ok((Engine::new(Store::from(store), policy), instance, user))
    }

    fn email(address: &str) -> Identifier<'_> {
        Identifier::Email(address)
    }

    #[tokio::test]
    async fn issue_then_verify_every_kind() -> Result<()> {
        for kind in TokenKind::ALL {
            let (engine, instance, mut user) = engine_with_user(TokenPolicy::default()).await?;
            if kind == TokenKind::EmailChange {
                user.email_change_to = Some("alice.new@example.com".into());
                engine.store().update(&user).await?;
            }
            let now = Utc::now();
            let issued = engine
                .issue(instance, AUD, kind, email("alice@example.com"), now)
                .await?;
            let verified = engine.verify(instance, kind, &issued.token, now).await?;
            assert_eq!(verified.id, user.id, "{kind}");
            assert!(verified.pending(kind).is_none(), "{kind}");
            assert!(verified.confirmed(), "{kind}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn verify_email_change_moves_address() -> Result<()> {
        let (engine, instance, mut user) = engine_with_user(TokenPolicy::default()).await?;
        user.email_change_to = Some("alice.new@example.com".into());
        engine.store().update(&user).await?;
        let now = Utc::now();
        let issued = engine
            .issue(instance, AUD, TokenKind::EmailChange, Identifier::Id(user.id), now)
            .await?;

        let moved = engine
            .verify(instance, TokenKind::EmailChange, &issued.token, now)
            .await?;
        assert_eq!(moved.email, "alice.new@example.com");
        assert!(moved.email_change_to.is_none());
        assert!(moved.email_change.is_none());

        // The change is done; there is nothing left to resend.
        let resend = engine
            .issue(instance, AUD, TokenKind::EmailChange, Identifier::Id(user.id), now)
            .await;
        assert!(matches!(resend, Err(Error::NotFound)));
        let old = engine
            .store()
            .find(
                instance,
                Lookup::Email {
                    audience: AUD,
                    email: "alice@example.com",
                },
            )
            .await?;
        assert!(old.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn invite_round_trip_on_pending_account() -> Result<()> {
        let (engine, instance, user) = engine_with_user(TokenPolicy::default()).await?;
        let now = Utc::now();
        let issued = engine
            .issue(instance, AUD, TokenKind::Invite, Identifier::Id(user.id), now)
            .await?;
        let accepted = engine
            .accept_invite(instance, &issued.token, "first password", now)
            .await?;
        assert!(accepted.confirmed());
        assert!(accepted.encrypted_password.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn invite_for_confirmed_account_is_not_found() -> Result<()> {
        let (engine, instance, _) = engine_with_user(TokenPolicy::default()).await?;
        let now = Utc::now();
        let issued = engine
            .issue(instance, AUD, TokenKind::Confirmation, email("alice@example.com"), now)
            .await?;
        engine.confirm_user(instance, &issued.token, now).await?;
        let result = engine
            .issue(instance, AUD, TokenKind::Invite, email("alice@example.com"), now)
            .await;
        assert!(matches!(result, Err(Error::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn issue_for_unknown_user_or_audience_is_not_found() -> Result<()> {
        let (engine, instance, user) = engine_with_user(TokenPolicy::default()).await?;
        let now = Utc::now();
        let missing = engine
            .issue(instance, AUD, TokenKind::Recovery, email("bob@example.com"), now)
            .await;
        assert!(matches!(missing, Err(Error::NotFound)));

        let other_audience = engine
            .issue(instance, "mobile", TokenKind::Recovery, Identifier::Id(user.id), now)
            .await;
        assert!(matches!(other_audience, Err(Error::NotFound)));

        let other_instance = engine
            .issue(Uuid::new_v4(), AUD, TokenKind::Recovery, Identifier::Id(user.id), now)
            .await;
        assert!(matches!(other_instance, Err(Error::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn issue_normalizes_email() -> Result<()> {
        let (engine, instance, user) = engine_with_user(TokenPolicy::default()).await?;
        let issued = engine
            .issue(instance, AUD, TokenKind::Recovery, email(" Alice@Example.com "), Utc::now())
            .await?;
        assert_eq!(issued.user.id, user.id);
        Ok(())
    }

    #[tokio::test]
    async fn reissue_voids_previous_token() -> Result<()> {
        let (engine, instance, _) = engine_with_user(TokenPolicy::default()).await?;
        let now = Utc::now();
        let first = engine
            .issue(instance, AUD, TokenKind::Recovery, email("alice@example.com"), now)
            .await?;
        let second = engine
            .issue(instance, AUD, TokenKind::Recovery, email("alice@example.com"), now)
            .await?;
        assert_ne!(first.token, second.token);

        let stale = engine
            .verify(instance, TokenKind::Recovery, &first.token, now)
            .await;
        assert!(matches!(stale, Err(Error::InvalidToken)));
        engine
            .verify(instance, TokenKind::Recovery, &second.token, now)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn second_verify_is_invalid() -> Result<()> {
        let (engine, instance, _) = engine_with_user(TokenPolicy::default()).await?;
        let now = Utc::now();
        let issued = engine
            .issue(instance, AUD, TokenKind::Confirmation, email("alice@example.com"), now)
            .await?;
        engine.confirm_user(instance, &issued.token, now).await?;
        let again = engine.confirm_user(instance, &issued.token, now).await;
        assert!(matches!(again, Err(Error::InvalidToken)));
        Ok(())
    }

    #[tokio::test]
    async fn cross_kind_presentation_is_invalid() -> Result<()> {
        let (engine, instance, _) = engine_with_user(TokenPolicy::default()).await?;
        let now = Utc::now();
        let issued = engine
            .issue(instance, AUD, TokenKind::Recovery, email("alice@example.com"), now)
            .await?;
        let wrong = engine
            .verify(instance, TokenKind::Confirmation, &issued.token, now)
            .await;
        assert!(matches!(wrong, Err(Error::InvalidToken)));
        // The recovery token is untouched by the failed attempt.
        engine
            .verify(instance, TokenKind::Recovery, &issued.token, now)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn other_instance_cannot_consume() -> Result<()> {
        let (engine, instance, _) = engine_with_user(TokenPolicy::default()).await?;
        let now = Utc::now();
        let issued = engine
            .issue(instance, AUD, TokenKind::Recovery, email("alice@example.com"), now)
            .await?;
        let foreign = engine
            .verify(Uuid::new_v4(), TokenKind::Recovery, &issued.token, now)
            .await;
        assert!(matches!(foreign, Err(Error::InvalidToken)));
        Ok(())
    }

    #[tokio::test]
    async fn empty_token_is_invalid() -> Result<()> {
        let (engine, instance, _) = engine_with_user(TokenPolicy::default()).await?;
        let result = engine
            .verify(instance, TokenKind::Confirmation, "", Utc::now())
            .await;
        assert!(matches!(result, Err(Error::InvalidToken)));
        Ok(())
    }

    #[tokio::test]
    async fn expired_token_is_kept_and_keeps_failing() -> Result<()> {
        let policy = TokenPolicy::new().with_recovery_ttl_seconds(60);
        let (engine, instance, user) = engine_with_user(policy).await?;
        let issued_at = Utc::now();
        let issued = engine
            .issue(instance, AUD, TokenKind::Recovery, email("alice@example.com"), issued_at)
            .await?;

        let late = issued_at + Duration::seconds(61);
        for _ in 0..2 {
            let result = engine
                .verify(instance, TokenKind::Recovery, &issued.token, late)
                .await;
            assert!(matches!(result, Err(Error::ExpiredToken)));
        }
        let stored = engine
            .store()
            .find(instance, Lookup::Id(user.id))
            .await?
            .ok_or_else(|| anyhow::anyhow!("user vanished"))?;
        assert!(stored.holds(TokenKind::Recovery, &issued.token));
        assert!(!stored.confirmed());

        // Still valid right at the boundary.
        engine
            .verify(instance, TokenKind::Recovery, &issued.token, issued_at + Duration::seconds(60))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn confirmation_resend_never_unconfirms() -> Result<()> {
        let (engine, instance, _) = engine_with_user(TokenPolicy::default()).await?;
        let now = Utc::now();
        let issued = engine
            .issue(instance, AUD, TokenKind::Confirmation, email("alice@example.com"), now)
            .await?;
        let confirmed = engine.confirm_user(instance, &issued.token, now).await?;

        let later = now + Duration::hours(1);
        let resent = engine
            .issue(instance, AUD, TokenKind::Confirmation, email("alice@example.com"), later)
            .await?;
        assert_eq!(resent.user.confirmed_at, confirmed.confirmed_at);
        let again = engine.confirm_user(instance, &resent.token, later).await?;
        assert_eq!(again.confirmed_at, confirmed.confirmed_at);
        Ok(())
    }

    #[tokio::test]
    async fn recover_password_sets_hash_and_consumes() -> Result<()> {
        let (engine, instance, _) = engine_with_user(TokenPolicy::default()).await?;
        let now = Utc::now();
        let issued = engine
            .issue(instance, AUD, TokenKind::Recovery, email("alice@example.com"), now)
            .await?;
        let user = engine
            .recover_password(instance, &issued.token, "new password", now)
            .await?;
        let hash = user.encrypted_password.unwrap_or_default();
        assert!(crate::users::verify_password(&hash, "new password"));
        assert!(user.recovery.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_verify_succeeds_exactly_once() -> Result<()> {
        let (engine, instance, _) = engine_with_user(TokenPolicy::default()).await?;
        let engine = Arc::new(engine);
        let now = Utc::now();
        let issued = engine
            .issue(instance, AUD, TokenKind::Confirmation, email("alice@example.com"), now)
            .await?;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let engine = Arc::clone(&engine);
            let token = issued.token.clone();
            handles.push(tokio::spawn(async move {
                engine.confirm_user(instance, &token, now).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await? {
                Ok(_) => successes += 1,
                Err(Error::InvalidToken) => {}
                Err(err) => return Err(err.into()),
            }
        }
        assert_eq!(successes, 1);
        Ok(())
    }

    /// Delegates to the memory store after failing the first `conflicts`
    /// transactions.
    #[derive(Default)]
    struct ConflictingStore {
        inner: MemoryUserStore,
        conflicts: AtomicUsize,
        transactions: AtomicUsize,
    }

    impl UserStore for ConflictingStore {
        async fn find(
            &self,
            instance_id: Uuid,
            lookup: Lookup<'_>,
        ) -> Result<Option<User>, StoreError> {
            self.inner.find(instance_id, lookup).await
        }

        async fn create(&self, user: &User) -> Result<(), StoreError> {
            self.inner.create(user).await
        }

        async fn update(&self, user: &User) -> Result<(), StoreError> {
            self.inner.update(user).await
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
            self.transactions.fetch_add(1, Ordering::SeqCst);
            let conflicted = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if conflicted {
                return Err(StoreError::Conflict);
            }
            self.inner.transact(instance_id, lookup, apply).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    async fn conflicting_engine() -> Result<(Engine<ConflictingStore>, Uuid, User)> {
        let store = ConflictingStore::default();
        let instance = Uuid::new_v4();
        let user = User::new(instance, AUD, "alice@example.com", Utc::now());
        store.create(&user).await?;
        Ok((Engine::new(store, TokenPolicy::default()), instance, user))
    }

    #[tokio::test]
    async fn one_conflict_is_retried() -> Result<()> {
        let (engine, instance, user) = conflicting_engine().await?;
        let now = Utc::now();
        engine.store().conflicts.store(1, Ordering::SeqCst);
        let issued = engine
            .issue(instance, AUD, TokenKind::Recovery, Identifier::Id(user.id), now)
            .await?;
        assert_eq!(engine.store().transactions.load(Ordering::SeqCst), 2);

        engine.store().conflicts.store(1, Ordering::SeqCst);
        engine.store().transactions.store(0, Ordering::SeqCst);
        let verified = engine
            .verify(instance, TokenKind::Recovery, &issued.token, now)
            .await?;
        assert!(verified.recovery.is_none());
        assert_eq!(engine.store().transactions.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn second_conflict_surfaces() -> Result<()> {
        let (engine, instance, user) = conflicting_engine().await?;
        engine.store().conflicts.store(2, Ordering::SeqCst);
        let result = engine
            .issue(instance, AUD, TokenKind::Recovery, Identifier::Id(user.id), Utc::now())
            .await;
        assert!(matches!(result, Err(Error::Conflict)));
        assert_eq!(engine.store().transactions.load(Ordering::SeqCst), 2);

        let stored = engine
            .store()
            .find(instance, Lookup::Id(user.id))
            .await?
            .ok_or_else(|| anyhow::anyhow!("user vanished"))?;
        assert!(stored.recovery.is_none());
        Ok(())
    }
}
