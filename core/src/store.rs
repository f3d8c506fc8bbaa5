//! Relational store capability.
//!
//! [`UserStore`] is the gateway through which the processing loop mutates the mirror table.
//! Every mutation runs inside a caller-owned transaction:
//!
//! ```text
//! begin() ──▶ upsert()/delete() ──▶ commit()
//!                    │
//!                    └──(error)──▶ rollback() / drop
//! ```
//!
//! Neither [`UserStore::upsert`] nor [`UserStore::delete`] commits on its own. Both are
//! idempotent so that a message redelivered after a crash can be safely reapplied.

use crate::consumer::MessagePosition;
use crate::user::User;
use std::future::Future;
use thiserror::Error;

/// Error type for store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Could not reach the database
    #[error("Connection error: {0}")]
    Connection(String),

    /// A statement failed (constraint violation, type mismatch, ...)
    #[error("Query error: {0}")]
    Query(String),

    /// Beginning, committing or rolling back a transaction failed
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(String),
}

/// A message that could not be decoded and was parked instead of retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMessage {
    /// Where the message came from
    pub position: MessagePosition,
    /// The raw payload bytes (`None` for tombstones)
    pub payload: Option<Vec<u8>>,
    /// Why processing failed
    pub error: String,
    /// How many times processing was attempted
    pub attempts: u32,
}

/// Transactional gateway to the `users` mirror table.
///
/// # Transactions
///
/// The transaction type is an associated type so implementations can use their native
/// handle (`sqlx::Transaction` for Postgres, a staging buffer in memory). Dropping an
/// uncommitted transaction must abandon its changes.
///
/// # Example
///
/// ```ignore
/// let mut tx = store.begin().await?;
/// store.upsert(&mut tx, &user).await?;
/// store.commit(tx).await?;
/// ```
pub trait UserStore: Send + Sync {
    /// Transaction handle.
    type Tx: Send;

    /// Open a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] or [`StoreError::Transaction`] if no transaction
    /// can be started.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send;

    /// Insert `user`, or overwrite `name`, `email` and `age` of the row with the same id.
    ///
    /// Returns the number of rows affected.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the statement fails.
    fn upsert(
        &self,
        tx: &mut Self::Tx,
        user: &User,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Delete the row with `id`.
    ///
    /// Returns the number of rows affected; `0` when no such row exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the statement fails.
    fn delete(
        &self,
        tx: &mut Self::Tx,
        id: &str,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Park a message that cannot be processed.
    ///
    /// Returns the identifier of the dead-letter entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the insert fails.
    fn dead_letter(
        &self,
        tx: &mut Self::Tx,
        failed: &FailedMessage,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transaction`] if the commit fails; the changes are lost.
    fn commit(&self, tx: Self::Tx) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Roll the transaction back.
    ///
    /// The default implementation drops the handle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transaction`] if an explicit rollback fails.
    fn rollback(&self, tx: Self::Tx) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            drop(tx);
            Ok(())
        }
    }
}
