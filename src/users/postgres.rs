//! Postgres-backed user directory (`db/sql/01_users.sql`).

use anyhow::{anyhow, Context};
use sqlx::{
    postgres::{PgArguments, PgPool, PgRow},
    query::Query,
    Connection, Postgres, Row,
};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::{Lookup, Mutation, PendingToken, StoreError, User, UserStore};
use crate::verification::TokenKind;

const USER_COLUMNS: &str = r"
    id, instance_id, aud, email, role, encrypted_password, confirmed_at,
    confirmation_token, confirmation_sent_at,
    recovery_token, recovery_sent_at,
    invite_token, invited_at,
    email_change_token, email_change, email_change_sent_at,
    last_sign_in_at, raw_app_meta_data, raw_user_meta_data,
    created_at, updated_at";

const INSERT_USER: &str = r"
    INSERT INTO users
        (instance_id, id, aud, email, role, encrypted_password, confirmed_at,
         confirmation_token, confirmation_sent_at,
         recovery_token, recovery_sent_at,
         invite_token, invited_at,
         email_change_token, email_change, email_change_sent_at,
         last_sign_in_at, raw_app_meta_data, raw_user_meta_data,
         updated_at, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
";

const UPDATE_USER: &str = r"
    UPDATE users SET
        aud = $3, email = $4, role = $5, encrypted_password = $6, confirmed_at = $7,
        confirmation_token = $8, confirmation_sent_at = $9,
        recovery_token = $10, recovery_sent_at = $11,
        invite_token = $12, invited_at = $13,
        email_change_token = $14, email_change = $15, email_change_sent_at = $16,
        last_sign_in_at = $17, raw_app_meta_data = $18, raw_user_meta_data = $19,
        updated_at = $20
    WHERE instance_id = $1 AND id = $2
";

#[derive(Clone, Debug)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply `db/sql/01_users.sql`. Statements are idempotent.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be applied.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        let span = info_span!("db.migrate", db.system = "postgresql");
        sqlx::raw_sql(include_str!("../../db/sql/01_users.sql"))
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to apply users schema")?;
        Ok(())
    }
}

fn token_column(kind: TokenKind) -> &'static str {
    match kind {
        TokenKind::Confirmation => "confirmation_token",
        TokenKind::Recovery => "recovery_token",
        TokenKind::Invite => "invite_token",
        TokenKind::EmailChange => "email_change_token",
    }
}

fn select_statement(lookup: Lookup<'_>, for_update: bool) -> String {
    let clause = match lookup {
        Lookup::Id(_) => "id = $2".to_string(),
        Lookup::Email { .. } => "aud = $2 AND email = $3".to_string(),
        Lookup::Token { kind, .. } => format!("{} = $2", token_column(kind)),
    };
    let lock = if for_update { " FOR UPDATE" } else { "" };
    format!("SELECT {USER_COLUMNS} FROM users WHERE instance_id = $1 AND {clause} LIMIT 1{lock}")
}

fn bind_lookup<'q>(
    query: Query<'q, Postgres, PgArguments>,
    lookup: Lookup<'q>,
) -> Query<'q, Postgres, PgArguments> {
    match lookup {
        Lookup::Id(id) => query.bind(id),
        Lookup::Email { audience, email } => query.bind(audience).bind(email),
        Lookup::Token { token, .. } => query.bind(token),
    }
}

fn pending(value: Option<&PendingToken>) -> (Option<&str>, Option<chrono::DateTime<chrono::Utc>>) {
    value.map_or((None, None), |token| {
        (Some(token.value.as_str()), Some(token.issued_at))
    })
}

/// Binds `$3..` shared by insert and update, in `UPDATE_USER` order.
fn bind_fields<'q>(
    query: Query<'q, Postgres, PgArguments>,
    user: &'q User,
) -> Query<'q, Postgres, PgArguments> {
    let (confirmation, confirmation_sent_at) = pending(user.confirmation.as_ref());
    let (recovery, recovery_sent_at) = pending(user.recovery.as_ref());
    let (invite, invited_at) = pending(user.invite.as_ref());
    let (email_change, email_change_sent_at) = pending(user.email_change.as_ref());
    query
        .bind(&user.aud)
        .bind(&user.email)
        .bind(&user.role)
        .bind(user.encrypted_password.as_deref())
        .bind(user.confirmed_at)
        .bind(confirmation)
        .bind(confirmation_sent_at)
        .bind(recovery)
        .bind(recovery_sent_at)
        .bind(invite)
        .bind(invited_at)
        .bind(email_change)
        .bind(user.email_change_to.as_deref())
        .bind(email_change_sent_at)
        .bind(user.last_sign_in_at)
        .bind(&user.app_metadata)
        .bind(&user.user_metadata)
        .bind(user.updated_at)
}

fn pending_from_row(
    row: &PgRow,
    token: &str,
    sent_at: &str,
) -> Result<Option<PendingToken>, sqlx::Error> {
    let value: Option<String> = row.try_get(token)?;
    let issued_at: Option<chrono::DateTime<chrono::Utc>> = row.try_get(sent_at)?;
    Ok(match (value, issued_at) {
        (Some(value), Some(issued_at)) => Some(PendingToken { value, issued_at }),
        // A token without a send time cannot be checked for expiry; treat it as absent.
        _ => None,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        aud: row.try_get("aud")?,
        email: row.try_get("email")?,
        role: row.try_get("role")?,
        encrypted_password: row.try_get("encrypted_password")?,
        confirmed_at: row.try_get("confirmed_at")?,
        confirmation: pending_from_row(row, "confirmation_token", "confirmation_sent_at")?,
        recovery: pending_from_row(row, "recovery_token", "recovery_sent_at")?,
        invite: pending_from_row(row, "invite_token", "invited_at")?,
        email_change: pending_from_row(row, "email_change_token", "email_change_sent_at")?,
        email_change_to: row.try_get("email_change")?,
        last_sign_in_at: row.try_get("last_sign_in_at")?,
        app_metadata: row.try_get("raw_app_meta_data")?,
        user_metadata: row.try_get("raw_user_meta_data")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Map driver errors onto the store contract.
fn store_error(err: sqlx::Error, context: &'static str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") => return StoreError::Duplicate,
            Some("40001" | "40P01") => return StoreError::Conflict,
            _ => {}
        }
    }
    StoreError::Backend(anyhow::Error::new(err).context(context))
}

fn db_span(operation: &'static str, statement: &str) -> tracing::Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

impl UserStore for PgUserStore {
    async fn find(&self, instance_id: Uuid, lookup: Lookup<'_>) -> Result<Option<User>, StoreError> {
        let statement = select_statement(lookup, false);
        let span = db_span("SELECT", &statement);
        let row = bind_lookup(sqlx::query(&statement).bind(instance_id), lookup)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| store_error(err, "failed to look up user"))?;
        row.as_ref()
            .map(user_from_row)
            .transpose()
            .map_err(|err| store_error(err, "failed to decode user row"))
    }

    async fn create(&self, user: &User) -> Result<(), StoreError> {
        let span = db_span("INSERT", INSERT_USER);
        let query = sqlx::query(INSERT_USER).bind(user.instance_id).bind(user.id);
        bind_fields(query, user)
            .bind(user.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| store_error(err, "failed to insert user"))?;
        Ok(())
    }

    async fn update(&self, user: &User) -> Result<(), StoreError> {
        let span = db_span("UPDATE", UPDATE_USER);
        let query = sqlx::query(UPDATE_USER).bind(user.instance_id).bind(user.id);
        bind_fields(query, user)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| store_error(err, "failed to update user"))?;
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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| store_error(err, "begin user transaction"))?;

        let statement = select_statement(lookup, true);
        let span = db_span("SELECT", &statement);
        let row = bind_lookup(sqlx::query(&statement).bind(instance_id), lookup)
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .map_err(|err| store_error(err, "failed to lock user row"))?;
        let mut user = row
            .as_ref()
            .map(user_from_row)
            .transpose()
            .map_err(|err| store_error(err, "failed to decode user row"))?;

        match apply(user.as_mut()) {
            Mutation::Write(value) => {
                if let Some(user) = &user {
                    let span = db_span("UPDATE", UPDATE_USER);
                    let query = sqlx::query(UPDATE_USER).bind(user.instance_id).bind(user.id);
                    bind_fields(query, user)
                        .execute(&mut *tx)
                        .instrument(span)
                        .await
                        .map_err(|err| store_error(err, "failed to update user"))?;
                }
                tx.commit()
                    .await
                    .map_err(|err| store_error(err, "commit user transaction"))?;
                Ok(value)
            }
            Mutation::Keep(value) => {
                tx.rollback()
                    .await
                    .map_err(|err| store_error(err, "rollback user transaction"))?;
                Ok(value)
            }
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let acquire_span = info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        );
        let mut conn = self
            .pool
            .acquire()
            .instrument(acquire_span)
            .await
            .map_err(|err| store_error(err, "failed to acquire database connection"))?;
        let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        conn.ping()
            .instrument(ping_span)
            .await
            .map_err(|err| StoreError::Backend(anyhow!(err).context("failed to ping database")))
    }
}
