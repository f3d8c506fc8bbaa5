//! # User Sync Core
//!
//! Types and capability traits for the user-sync CDC pipeline.
//!
//! The pipeline reads Debezium change events for a MongoDB `users` collection from a
//! Kafka-compatible topic and mirrors them into a relational `users` table:
//!
//! ```text
//! ┌──────────────┐   raw bytes   ┌────────────────┐   JSON string   ┌──────────┐
//! │ChangeConsumer│ ────────────▶ │ ChangeEnvelope │ ──────────────▶ │   User   │
//! └──────────────┘               └────────────────┘                 └────┬─────┘
//!        ▲                                                               │
//!        │ commit offset (after store commit)                            ▼
//!        └──────────────────────────────────────────────────────── UserStore (tx)
//! ```
//!
//! This crate has no I/O of its own:
//! - [`envelope`]: outer Debezium envelope decoding
//! - [`user`]: inner entity snapshot decoding
//! - [`consumer`]: the broker capability ([`ChangeConsumer`])
//! - [`store`]: the relational store capability ([`UserStore`])
//!
//! Concrete implementations live in `user-sync-redpanda` and `user-sync-postgres`;
//! in-memory doubles live in `user-sync-testing`.

pub mod consumer;
pub mod envelope;
pub mod store;
pub mod user;

pub use consumer::{ChangeConsumer, ConsumedMessage, ConsumerError, MessagePosition};
pub use envelope::{ChangeEnvelope, DecodeError, Operation};
pub use store::{FailedMessage, StoreError, UserStore};
pub use user::User;
