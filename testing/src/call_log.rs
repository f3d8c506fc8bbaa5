//! Shared record of side effects across the consumer and store doubles.
//!
//! Attach the same [`CallLog`] to an [`InMemoryConsumer`](crate::InMemoryConsumer) and an
//! [`InMemoryUserStore`](crate::InMemoryUserStore) to assert the relative order of store
//! commits and offset commits.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use std::sync::{Arc, RwLock};
use user_sync_core::MessagePosition;

/// A side effect observed by a double.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// A store transaction committed
    StoreCommit,
    /// A store transaction was explicitly rolled back
    StoreRollback,
    /// An offset was committed for this message
    OffsetCommit(MessagePosition),
    /// The consumer was rewound to this message
    Rewind(MessagePosition),
}

/// Append-only, cloneable log of [`Call`]s.
#[derive(Clone, Debug, Default)]
pub struct CallLog {
    calls: Arc<RwLock<Vec<Call>>>,
}

impl CallLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call.
    pub fn record(&self, call: Call) {
        self.calls.write().unwrap().push(call);
    }

    /// Snapshot of every call so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.calls.read().unwrap().clone()
    }

    /// Whether every offset commit is immediately preceded by a store commit.
    ///
    /// `ignored` positions are acknowledged without a transaction and are exempt.
    #[must_use]
    pub fn offsets_follow_store_commits(&self, ignored: &[MessagePosition]) -> bool {
        let calls = self.calls();
        calls.iter().enumerate().all(|(index, call)| match call {
            Call::OffsetCommit(position) if !ignored.contains(position) => {
                index > 0 && calls[index - 1] == Call::StoreCommit
            }
            _ => true,
        })
    }
}
