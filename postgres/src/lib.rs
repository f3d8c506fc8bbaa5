//! `PostgreSQL` store gateway for user-sync.
//!
//! This crate provides the production implementation of the [`UserStore`] trait from
//! `user-sync-core`. It uses sqlx and supports:
//!
//! - Idempotent upserts keyed on the source document id
//! - Deletes that report zero rows for unknown ids
//! - Caller-scoped transactions (nothing commits implicitly)
//! - A dead-letter table for messages that cannot be decoded
//! - Embedded migrations
//!
//! # Example
//!
//! ```ignore
//! use user_sync_postgres::PostgresUserStore;
//! use user_sync_core::{User, UserStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresUserStore::connect("postgres://localhost/users", 5).await?;
//!     store.migrate().await?;
//!
//!     let mut tx = store.begin().await?;
//!     store.upsert(&mut tx, &User::new("abc123").with_age(30)).await?;
//!     store.commit(tx).await?;
//!     Ok(())
//! }
//! ```
//!
//! [`UserStore`]: user_sync_core::UserStore

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter_queue;
mod user_store;

pub use dead_letter_queue::{DLQStatus, DeadLetterEntry, DeadLetterQueue};
pub use user_store::PostgresUserStore;
