//! The change-processing loop for user-sync.
//!
//! # Overview
//!
//! [`ChangeProcessor`] pulls Debezium change events from a [`ChangeConsumer`], resolves each
//! into a [`Mutation`], applies it inside a [`UserStore`] transaction and acknowledges the
//! offset once that transaction has committed.
//!
//! ```text
//! ChangeConsumer ──▶ ChangeEnvelope ──▶ Mutation ──▶ UserStore tx ──▶ commit ──▶ offset
//!       ▲                                                                          │
//!       └───────────────────── rewind + backoff on failure ◀───────────────────────┘
//! ```
//!
//! Delivery is at-least-once; idempotent store mutations make redelivery harmless.
//!
//! # Example
//!
//! ```ignore
//! use user_sync_projections::{ChangeProcessor, PoisonPolicy, ProcessorConfig};
//!
//! let config = ProcessorConfig::default()
//!     .with_poison_policy(PoisonPolicy::DeadLetter { max_attempts: 5 });
//!
//! let (mut processor, shutdown) = ChangeProcessor::new(consumer, store, config);
//! processor.run().await;
//! ```
//!
//! [`ChangeConsumer`]: user_sync_core::ChangeConsumer
//! [`UserStore`]: user_sync_core::UserStore

pub mod dispatch;
pub mod error;
pub mod processor;
pub mod retry;

pub use dispatch::Mutation;
pub use error::{Disposition, ProcessError};
pub use processor::{ChangeProcessor, Outcome, PoisonPolicy, ProcessorConfig};
pub use retry::{RetryPolicy, retry_with_backoff};
