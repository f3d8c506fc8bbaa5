//! `PostgreSQL` implementation of [`UserStore`].

use crate::dead_letter_queue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use user_sync_core::{FailedMessage, StoreError, User, UserStore};

const UPSERT_USER: &str = r"
    INSERT INTO users (id, name, email, age)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (id) DO UPDATE SET
        name = EXCLUDED.name,
        email = EXCLUDED.email,
        age = EXCLUDED.age
";

const DELETE_USER: &str = "DELETE FROM users WHERE id = $1";

/// PostgreSQL-backed user mirror.
///
/// Writes go to the `users` table:
///
/// ```sql
/// CREATE TABLE users (
///     id TEXT PRIMARY KEY,
///     name TEXT NULL,
///     email TEXT NULL,
///     age INTEGER NOT NULL DEFAULT 0
/// );
/// ```
///
/// The pool is cheap to clone; the processing loop holds one store for its whole lifetime
/// and only ever has one transaction open at a time.
#[derive(Clone)]
pub struct PostgresUserStore {
    pool: PgPool,
}

impl PostgresUserStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the database cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `users` and `failed_messages` tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Migration`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }

    /// Look up a user by id outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the query fails.
    pub async fn find(&self, id: &str) -> Result<Option<User>, StoreError> {
        let row: Option<(String, Option<String>, Option<String>, i32)> =
            sqlx::query_as("SELECT id, name, email, age FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        Ok(row.map(|(id, name, email, age)| User {
            id,
            name,
            email,
            age,
        }))
    }

    /// Number of rows in the mirror.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the query fails.
    pub async fn count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(count)
    }
}

impl UserStore for PostgresUserStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::Transaction(format!("Failed to begin transaction: {e}")))
    }

    async fn upsert(&self, tx: &mut Self::Tx, user: &User) -> Result<u64, StoreError> {
        let result = sqlx::query(UPSERT_USER)
            .bind(&user.id)
            .bind(user.name.as_deref())
            .bind(user.email.as_deref())
            .bind(user.age)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;

        tracing::debug!(
            user_id = %user.id,
            rows_affected = result.rows_affected(),
            "Upserted user"
        );

        Ok(result.rows_affected())
    }

    async fn delete(&self, tx: &mut Self::Tx, id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(DELETE_USER)
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            tracing::debug!(user_id = id, "No user found to delete");
        } else {
            tracing::debug!(user_id = id, "Deleted user");
        }

        Ok(result.rows_affected())
    }

    async fn dead_letter(&self, tx: &mut Self::Tx, failed: &FailedMessage) -> Result<i64, StoreError> {
        dead_letter_queue::insert_entry(&mut **tx, failed).await
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.commit()
            .await
            .map_err(|e| StoreError::Transaction(format!("Failed to commit transaction: {e}")))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.rollback()
            .await
            .map_err(|e| StoreError::Transaction(format!("Failed to roll back transaction: {e}")))
    }
}

/// Split connectivity failures from statement failures.
pub(crate) fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connection(error.to_string()),
        other => StoreError::Query(other.to_string()),
    }
}
