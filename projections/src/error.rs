//! Errors raised while processing a single polled message.

use thiserror::Error;
use user_sync_core::{DecodeError, StoreError};

/// Why a message could not be applied.
///
/// Consumer errors are not part of this type: they happen before there is a message to
/// process, and the loop handles them inline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The envelope or entity snapshot could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The store rejected the mutation or the transaction
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How the loop should treat a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The failure may go away on its own (database restart, lock timeout, ...)
    Retry,
    /// Replaying the same bytes will fail the same way
    Poison,
}

impl ProcessError {
    /// Classify the error.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::Decode(_) => Disposition::Poison,
            Self::Store(_) => Disposition::Retry,
        }
    }

    /// Short label used as a metrics dimension.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Store(_) => "store",
        }
    }
}
