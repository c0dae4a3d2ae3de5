//! Account operations built on the same store seam as token consumption.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    engine::{fatal, Issued},
    Engine, Error, TokenKind,
};
use crate::{
    tokens::generate_token,
    users::{hash_password, normalize_email, verify_password, Lookup, Mutation, User, UserStore},
};

/// Input for [`Engine::signup`].
pub struct SignupRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub metadata: Option<Value>,
    /// Skip the confirmation mail and mark the account confirmed right away.
    pub autoconfirm: bool,
}

/// A newly created account and, unless autoconfirmed, the token to deliver.
#[derive(Debug)]
pub struct Registered {
    pub user: User,
    pub token: Option<Issued>,
}

/// Shallow merge of `patch` into `target`; `null` removes a key.
fn merge_metadata(target: &mut Value, patch: Value) {
    let Value::Object(patch) = patch else {
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(&key);
            } else {
                target.insert(key, value);
            }
        }
    }
}

impl<S: UserStore> Engine<S> {
    /// Create an account with a password.
    ///
    /// # Errors
    /// `EmailTaken` if the address is already registered in `(instance, audience)`.
    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn signup(
        &self,
        instance_id: Uuid,
        audience: &str,
        request: SignupRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<Registered, Error> {
        let email = normalize_email(request.email);
        let mut user = User::new(instance_id, audience, &email, now);
        user.encrypted_password = Some(hash_password(request.password).map_err(Error::Fatal)?);
        if let Some(metadata) = request.metadata {
            merge_metadata(&mut user.user_metadata, metadata);
        }

        let token = if request.autoconfirm {
            user.confirm(now);
            None
        } else {
            let token =
                generate_token().map_err(|err| fatal(err, "failed to generate token"))?;
            user.set_pending(TokenKind::Confirmation, token.clone(), now);
            Some(token)
        };

        self.store.create(&user).await?;
        debug!(user_id = %user.id, "account created");
        Ok(Registered {
            token: token.map(|token| Issued {
                user: user.clone(),
                token,
            }),
            user,
        })
    }

    /// Create a passwordless, unconfirmed account carrying an invite token.
    ///
    /// # Errors
    /// `EmailTaken` if the address is already registered.
    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn invite(
        &self,
        instance_id: Uuid,
        audience: &str,
        email: &str,
        metadata: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<Issued, Error> {
        let email = normalize_email(email);
        let mut user = User::new(instance_id, audience, &email, now);
        if let Some(metadata) = metadata {
            merge_metadata(&mut user.user_metadata, metadata);
        }
        let token = generate_token().map_err(|err| fatal(err, "failed to generate token"))?;
        user.set_pending(TokenKind::Invite, token.clone(), now);

        self.store.create(&user).await?;
        debug!(user_id = %user.id, "account invited");
        Ok(Issued { user, token })
    }

    /// Password grant.
    ///
    /// # Errors
    /// `InvalidCredentials` for an unknown email or a wrong password (the two are
    /// indistinguishable), `NotConfirmed` when `require_confirmed` is set and the
    /// account was never confirmed.
    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn authenticate(
        &self,
        instance_id: Uuid,
        audience: &str,
        email: &str,
        password: &str,
        require_confirmed: bool,
        now: DateTime<Utc>,
    ) -> Result<User, Error> {
        let email = normalize_email(email);
        let lookup = Lookup::Email {
            audience,
            email: &email,
        };
        let user = self
            .store
            .find(instance_id, lookup)
            .await?
            .ok_or(Error::InvalidCredentials)?;
        let matches = user
            .encrypted_password
            .as_deref()
            .is_some_and(|phc| verify_password(phc, password));
        if !matches {
            return Err(Error::InvalidCredentials);
        }
        if require_confirmed && !user.confirmed() {
            return Err(Error::NotConfirmed);
        }

        let user_id = user.id;
        let user = self
            .retry_conflicts("authenticate", move || {
                self.store
                    .transact(instance_id, Lookup::Id(user_id), move |user| match user {
                        Some(user) => {
                            user.last_sign_in_at = Some(now);
                            user.updated_at = now;
                            Mutation::Write(Ok(user.clone()))
                        }
                        None => Mutation::Keep(Err(Error::InvalidCredentials)),
                    })
            })
            .await??;
        Ok(user)
    }

    /// Fetch an account by id inside `(instance, audience)`.
    ///
    /// # Errors
    /// `NotFound` if it does not exist there.
    pub async fn find_user(
        &self,
        instance_id: Uuid,
        audience: &str,
        user_id: Uuid,
    ) -> Result<User, Error> {
        self.store
            .find(instance_id, Lookup::Id(user_id))
            .await?
            .filter(|user| user.aud == audience)
            .ok_or(Error::NotFound)
    }

    /// Record `new_email` as pending and issue an email change token for it.
    ///
    /// # Errors
    /// `EmailTaken` if another account, or this one, already uses the address.
    #[instrument(skip_all, fields(instance_id = %instance_id, user_id = %user_id))]
    pub async fn request_email_change(
        &self,
        instance_id: Uuid,
        audience: &str,
        user_id: Uuid,
        new_email: &str,
        now: DateTime<Utc>,
    ) -> Result<Issued, Error> {
        let new_email = normalize_email(new_email);
        let taken = Lookup::Email {
            audience,
            email: &new_email,
        };
        if self.store.find(instance_id, taken).await?.is_some() {
            return Err(Error::EmailTaken);
        }
        let token = generate_token().map_err(|err| fatal(err, "failed to generate token"))?;
        let (value, pending) = (token.as_str(), new_email.as_str());

        let user = self
            .retry_conflicts("request_email_change", move || {
                self.store
                    .transact(instance_id, Lookup::Id(user_id), move |user| {
                        let Some(user) = user.filter(|user| user.aud == audience) else {
                            return Mutation::Keep(Err(Error::NotFound));
                        };
                        user.email_change_to = Some(pending.to_string());
                        user.set_pending(TokenKind::EmailChange, value.to_string(), now);
                        user.updated_at = now;
                        Mutation::Write(Ok(user.clone()))
                    })
            })
            .await??;
        Ok(Issued { user, token })
    }

    /// Replace the password of an authenticated account.
    pub async fn change_password(
        &self,
        instance_id: Uuid,
        audience: &str,
        user_id: Uuid,
        new_password: &str,
        now: DateTime<Utc>,
    ) -> Result<User, Error> {
        let hash = hash_password(new_password).map_err(Error::Fatal)?;
        let hash = hash.as_str();
        let user = self
            .retry_conflicts("change_password", move || {
                self.store
                    .transact(instance_id, Lookup::Id(user_id), move |user| {
                        let Some(user) = user.filter(|user| user.aud == audience) else {
                            return Mutation::Keep(Err(Error::NotFound));
                        };
                        user.encrypted_password = Some(hash.to_string());
                        user.updated_at = now;
                        Mutation::Write(Ok(user.clone()))
                    })
            })
            .await??;
        Ok(user)
    }

    /// Merge `data` into the account's user metadata.
    pub async fn update_metadata(
        &self,
        instance_id: Uuid,
        audience: &str,
        user_id: Uuid,
        data: Value,
        now: DateTime<Utc>,
    ) -> Result<User, Error> {
        let data = &data;
        let user = self
            .retry_conflicts("update_metadata", move || {
                self.store
                    .transact(instance_id, Lookup::Id(user_id), move |user| {
                        let Some(user) = user.filter(|user| user.aud == audience) else {
                            return Mutation::Keep(Err(Error::NotFound));
                        };
                        merge_metadata(&mut user.user_metadata, data.clone());
                        user.updated_at = now;
                        Mutation::Write(Ok(user.clone()))
                    })
            })
            .await??;
        Ok(user)
    }
}
