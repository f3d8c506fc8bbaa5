//! Broker consumer capability.
//!
//! The processing loop does not talk to Kafka directly. It drives a [`ChangeConsumer`],
//! which hands out one message at a time and accepts explicit offset commits:
//!
//! - **Manual commits**: nothing is acknowledged until [`ChangeConsumer::commit`] is called
//! - **Rewind**: a failed message can be re-polled with [`ChangeConsumer::rewind`]
//! - **Ordering**: messages within a partition are delivered in offset order
//!
//! # Implementations
//!
//! - `RedpandaConsumer` in `user-sync-redpanda` (rdkafka)
//! - `InMemoryConsumer` in `user-sync-testing`

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while consuming or acknowledging messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// Failed to create the consumer client
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to subscribe to the topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Network or broker error while receiving
    #[error("Transport error: {0}")]
    Transport(String),

    /// Failed to commit an offset
    #[error("Commit failed at {position}: {reason}")]
    CommitFailed {
        /// Position that could not be committed
        position: MessagePosition,
        /// The reason for failure
        reason: String,
    },

    /// Failed to seek back to a message
    #[error("Rewind failed at {position}: {reason}")]
    RewindFailed {
        /// Position that could not be rewound to
        position: MessagePosition,
        /// The reason for failure
        reason: String,
    },
}

/// Where a message sits in the broker log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessagePosition {
    /// Topic the message was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset of the message within the partition
    pub offset: i64,
}

impl MessagePosition {
    /// Create a new position.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// The offset to commit once this message is fully processed.
    ///
    /// Kafka commits record the *next* offset to read.
    #[must_use]
    pub const fn next_offset(&self) -> i64 {
        self.offset + 1
    }
}

impl fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A message pulled from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    /// Where the message came from
    pub position: MessagePosition,
    /// Message key, if any
    pub key: Option<Vec<u8>>,
    /// Message body; `None` for tombstones
    pub payload: Option<Vec<u8>>,
}

impl ConsumedMessage {
    /// Create a message with a payload and no key.
    #[must_use]
    pub fn new(position: MessagePosition, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            position,
            key: None,
            payload: Some(payload.into()),
        }
    }

    /// Create a tombstone (no payload).
    #[must_use]
    pub const fn tombstone(position: MessagePosition) -> Self {
        Self {
            position,
            key: None,
            payload: None,
        }
    }

    /// The payload bytes, empty for tombstones.
    #[must_use]
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }
}

/// A single-topic consumer with manual offset management.
///
/// The processing loop owns its consumer exclusively, so every method takes `&mut self`.
///
/// # At-least-once contract
///
/// Implementations must not acknowledge a message before [`ChangeConsumer::commit`] is
/// called for it. A message that is polled but never committed is redelivered after a
/// restart or rebalance.
pub trait ChangeConsumer: Send {
    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` when the timeout elapses with nothing to read. That is the normal
    /// idle case, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Transport`] if the broker reports an error.
    fn poll(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<ConsumedMessage>, ConsumerError>> + Send;

    /// Mark `position` (and everything before it on that partition) as processed.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::CommitFailed`] if the broker rejects the commit.
    fn commit(
        &mut self,
        position: &MessagePosition,
    ) -> impl Future<Output = Result<(), ConsumerError>> + Send;

    /// Reposition the consumer so the next poll on that partition returns `position` again.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::RewindFailed`] if the consumer cannot seek.
    fn rewind(
        &mut self,
        position: &MessagePosition,
    ) -> impl Future<Output = Result<(), ConsumerError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_display_and_next_offset() {
        let position = MessagePosition::new("users", 2, 41);

        assert_eq!(position.to_string(), "users[2]@41");
        assert_eq!(position.next_offset(), 42);
    }

    #[test]
    fn tombstone_has_empty_payload_bytes() {
        let message = ConsumedMessage::tombstone(MessagePosition::new("users", 0, 0));
        assert!(message.payload_bytes().is_empty());
    }
}
