//! # user-sync testing
//!
//! Testing utilities for the user-sync pipeline.
//!
//! This crate provides:
//! - [`InMemoryConsumer`]: broker double with committed offsets, rewind and restart
//! - [`InMemoryUserStore`]: store double with transactional staging and fault injection
//! - [`CallLog`]: shared record of store and offset commits, for ordering assertions
//! - [`fixtures`]: builders for raw Debezium change events
//! - [`properties`]: proptest strategies and a reference model
//!
//! ## Example
//!
//! ```ignore
//! use user_sync_testing::{InMemoryConsumer, InMemoryUserStore, fixtures};
//! use user_sync_projections::{ChangeProcessor, ProcessorConfig};
//!
//! #[tokio::test]
//! async fn applies_create() {
//!     let consumer = InMemoryConsumer::new("users");
//!     let store = InMemoryUserStore::new();
//!     consumer.publish(fixtures::create_event(&User::new("abc123")));
//!
//!     let (mut processor, _shutdown) =
//!         ChangeProcessor::new(consumer.clone(), store.clone(), ProcessorConfig::default());
//!     processor.poll_once().await;
//!
//!     assert!(store.get("abc123").is_some());
//! }
//! ```

pub mod call_log;
pub mod consumer_mocks;
pub mod fixtures;
pub mod properties;
pub mod store_mocks;

pub use call_log::{Call, CallLog};
pub use consumer_mocks::InMemoryConsumer;
pub use store_mocks::{InMemoryTx, InMemoryUserStore};

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honours `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
