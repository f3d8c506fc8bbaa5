//! Redpanda change consumer for user-sync.
//!
//! This crate provides the production implementation of the [`ChangeConsumer`] trait from
//! `user-sync-core`. It uses rdkafka, so it works against Redpanda, Apache Kafka, MSK, or
//! any other Kafka-compatible broker.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Auto-commit is disabled; offsets move only when [`ChangeConsumer::commit`] is called
//! - The processor commits AFTER the store transaction for the message has committed
//! - If the process crashes in between, the message is redelivered on restart
//! - [`ChangeConsumer::rewind`] seeks back so a failed message is polled again in-session
//!
//! # Example
//!
//! ```no_run
//! use user_sync_redpanda::RedpandaConsumer;
//! use user_sync_core::ChangeConsumer;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut consumer = RedpandaConsumer::builder()
//!     .brokers("localhost:9092")
//!     .topic("mongo.productionData.users")
//!     .consumer_group("user-consumer-group")
//!     .build()?;
//!
//! if let Some(message) = consumer.poll(Duration::from_secs(2)).await? {
//!     // ... apply the change ...
//!     consumer.commit(&message.position).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`ChangeConsumer`]: user_sync_core::ChangeConsumer
//! [`ChangeConsumer::commit`]: user_sync_core::ChangeConsumer::commit
//! [`ChangeConsumer::rewind`]: user_sync_core::ChangeConsumer::rewind

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use user_sync_core::{ChangeConsumer, ConsumedMessage, ConsumerError, MessagePosition};

/// Default consumer group, shared across restarts so offsets are resumed.
pub const DEFAULT_CONSUMER_GROUP: &str = "user-consumer-group";

/// Kafka-compatible consumer for one change topic.
///
/// The consumer is subscribed when built and is owned exclusively by the processing
/// loop. Commits and seeks are synchronous broker calls; they happen once per message.
pub struct RedpandaConsumer {
    consumer: StreamConsumer,
    topic: String,
    consumer_group: String,
    seek_timeout: Duration,
}

impl RedpandaConsumer {
    /// Create a new builder for configuring the consumer.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use user_sync_redpanda::RedpandaConsumer;
    ///
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let consumer = RedpandaConsumer::builder()
    ///     .brokers("localhost:9092")
    ///     .topic("mongo.productionData.users")
    ///     .auto_offset_reset("earliest")
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn builder() -> RedpandaConsumerBuilder {
        RedpandaConsumerBuilder::default()
    }

    /// The subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The consumer group id.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

/// Builder for configuring a [`RedpandaConsumer`].
#[derive(Default)]
pub struct RedpandaConsumerBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
    seek_timeout: Option<Duration>,
}

impl RedpandaConsumerBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the topic to consume.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the consumer group ID.
    ///
    /// Default: [`DEFAULT_CONSUMER_GROUP`]
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set where a group with no committed offset starts reading.
    ///
    /// - `"earliest"`: Start from the beginning of the topic
    /// - `"latest"`: Start from the end (only new changes)
    /// - `"error"`: Fail if no offset exists
    ///
    /// Default: `"earliest"`, so a fresh mirror replays the connector's initial snapshot.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the group session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Set how long a rewind may block waiting for the broker.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn seek_timeout(mut self, timeout: Duration) -> Self {
        self.seek_timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaConsumer`] and subscribe it to the topic.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::ConnectionFailed`] if brokers or topic are not set or the
    /// client cannot be created, and [`ConsumerError::SubscriptionFailed`] if the
    /// subscription is rejected.
    pub fn build(self) -> Result<RedpandaConsumer, ConsumerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| ConsumerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let topic = self
            .topic
            .ok_or_else(|| ConsumerError::ConnectionFailed("Topic not configured".to_string()))?;
        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());
        let session_timeout = self.session_timeout.unwrap_or(Duration::from_secs(6));

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &consumer_group)
            .set("enable.auto.commit", "false") // Manual commit for at-least-once
            .set("auto.offset.reset", &auto_offset_reset)
            .set("session.timeout.ms", session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                ConsumerError::ConnectionFailed(format!("Failed to create consumer: {e}"))
            })?;

        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| ConsumerError::SubscriptionFailed {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            consumer_group = %consumer_group,
            auto_offset_reset = %auto_offset_reset,
            manual_commit = true,
            "Subscribed to change topic"
        );

        Ok(RedpandaConsumer {
            consumer,
            topic,
            consumer_group,
            seek_timeout: self.seek_timeout.unwrap_or(Duration::from_secs(5)),
        })
    }
}

fn to_consumed(message: &BorrowedMessage<'_>) -> ConsumedMessage {
    ConsumedMessage {
        position: MessagePosition::new(message.topic(), message.partition(), message.offset()),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

impl ChangeConsumer for RedpandaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedMessage>, ConsumerError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(Ok(message)) => {
                let consumed = to_consumed(&message);
                tracing::trace!(position = %consumed.position, "Received message");
                Ok(Some(consumed))
            }
            Ok(Err(e)) => Err(ConsumerError::Transport(format!(
                "Failed to receive message: {e}"
            ))),
        }
    }

    async fn commit(&mut self, position: &MessagePosition) -> Result<(), ConsumerError> {
        let commit_failed = |reason: String| ConsumerError::CommitFailed {
            position: position.clone(),
            reason,
        };

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &position.topic,
                position.partition,
                Offset::Offset(position.next_offset()),
            )
            .map_err(|e| commit_failed(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| commit_failed(e.to_string()))?;

        tracing::trace!(position = %position, "Committed offset");
        Ok(())
    }

    async fn rewind(&mut self, position: &MessagePosition) -> Result<(), ConsumerError> {
        self.consumer
            .seek(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset),
                self.seek_timeout,
            )
            .map_err(|e| ConsumerError::RewindFailed {
                position: position.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(position = %position, "Rewound consumer");
        Ok(())
    }
}
