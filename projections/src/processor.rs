//! `ChangeProcessor`: the loop that projects change events into the users mirror.
//!
//! # Overview
//!
//! One message is processed completely before the next one is polled:
//!
//! ```text
//!   ┌──────┐ timeout  ┌─────────┐ empty ─────────────────────────────▶ Skipped
//!   │ Idle │◀─────────│ Polling │
//!   └──────┘          └────┬────┘
//!                          │ message
//!                          ▼
//!                    ┌──────────┐  unknown op ── commit offset ──────▶ Ignored
//!                    │ Decoding │
//!                    └────┬─────┘  no image ──── commit offset ──────▶ MissingImage
//!                         │ Upsert / Delete
//!                         ▼
//!                  ┌─────────────┐     ┌────────────┐
//!                  │ Dispatching │────▶│ Committing │ store commit, then offset ──▶ Applied
//!                  └─────────────┘     └────────────┘
//! ```
//!
//! Any failure along the way leaves the offset untouched, rewinds the consumer to the failed
//! message and backs off before it is polled again.
//!
//! # Delivery Guarantees
//!
//! - The offset of a message is committed only after the store transaction carrying its
//!   mutation has committed
//! - A crash between the two commits redelivers the message; upserts and deletes are
//!   idempotent, so reapplying it converges to the same row
//! - Messages are applied in the order the consumer delivers them
//!
//! # Poison messages
//!
//! By default a message that fails to decode is retried forever, stalling its partition until
//! the producer is fixed. [`PoisonPolicy::DeadLetter`] parks such a message in the store's
//! dead-letter table after a number of attempts and moves on.

use crate::dispatch::Mutation;
use crate::error::{Disposition, ProcessError};
use crate::retry::RetryPolicy;
use std::time::Duration;
use tokio::sync::watch;
use user_sync_core::{
    ChangeConsumer, ChangeEnvelope, ConsumedMessage, ConsumerError, FailedMessage,
    MessagePosition, StoreError, UserStore,
};

/// What to do with a message that can never be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoisonPolicy {
    /// Keep retrying; the partition stalls until the message is fixed or skipped by hand
    #[default]
    RetryForever,
    /// Park the message in the dead-letter table once it has failed `max_attempts` times
    DeadLetter {
        /// Attempts before the message is parked (at least 1)
        max_attempts: u32,
    },
}

/// Tuning for [`ChangeProcessor`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// How long a single poll waits for a message
    pub poll_timeout: Duration,
    /// Backoff between redeliveries of a failing message
    pub retry: RetryPolicy,
    /// Treatment of messages that cannot be decoded
    pub poison: PoisonPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            poison: PoisonPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    /// Set the poll timeout.
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the redelivery backoff.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the poison-message policy.
    #[must_use]
    pub const fn with_poison_policy(mut self, poison: PoisonPolicy) -> Self {
        self.poison = poison;
        self
    }
}

/// Result of one iteration of the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The poll timed out
    Idle,
    /// The message had no payload; its offset was not committed
    Skipped {
        /// The skipped message
        position: MessagePosition,
    },
    /// The mutation was committed to the store and the offset acknowledged
    Applied {
        /// The applied message
        position: MessagePosition,
        /// What was written
        mutation: Mutation,
        /// Rows touched by the statement
        rows_affected: u64,
    },
    /// The operation is not handled; the offset was acknowledged without touching the store
    Ignored {
        /// The ignored message
        position: MessagePosition,
        /// The raw operation code
        operation: String,
    },
    /// The event had no image to apply; the offset was acknowledged without touching the
    /// store
    MissingImage {
        /// The acknowledged message
        position: MessagePosition,
        /// The raw operation code
        operation: String,
        /// The absent snapshot field
        field: &'static str,
    },
    /// The message was parked in the dead-letter table and its offset acknowledged
    DeadLettered {
        /// The parked message
        position: MessagePosition,
        /// Identifier of the dead-letter entry
        dlq_id: i64,
    },
    /// Processing failed; the message will be polled again after `delay`
    Retrying {
        /// The failed message
        position: MessagePosition,
        /// Consecutive failures of this message, starting at 1
        attempt: u32,
        /// Backoff before the next attempt
        delay: Duration,
        /// Why it failed
        error: ProcessError,
    },
    /// The consumer reported an error while polling
    ConsumeFailed(ConsumerError),
}

/// Drives a [`ChangeConsumer`] into a [`UserStore`].
///
/// The processor owns both handles for its whole lifetime and processes messages strictly
/// one at a time.
///
/// # Example
///
/// ```ignore
/// use user_sync_projections::{ChangeProcessor, ProcessorConfig};
///
/// let (mut processor, shutdown) = ChangeProcessor::new(consumer, store, ProcessorConfig::default());
///
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     shutdown.send(true).ok();
/// });
///
/// processor.run().await;
/// ```
pub struct ChangeProcessor<C, S>
where
    C: ChangeConsumer,
    S: UserStore,
{
    consumer: C,
    store: S,
    config: ProcessorConfig,
    /// Consecutive failures of the message at this position
    failures: Option<(MessagePosition, u32)>,
    /// Failed message to reprocess without polling, set when a rewind fails
    redeliver: Option<ConsumedMessage>,
    shutdown: watch::Receiver<bool>,
}

impl<C, S> ChangeProcessor<C, S>
where
    C: ChangeConsumer,
    S: UserStore,
{
    /// Create a new processor.
    ///
    /// Returns the processor and a shutdown sender. Send `true` to stop [`Self::run`] after
    /// the in-flight message.
    #[must_use]
    pub fn new(consumer: C, store: S, config: ProcessorConfig) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let processor = Self {
            consumer,
            store,
            config,
            failures: None,
            redeliver: None,
            shutdown: shutdown_rx,
        };

        (processor, shutdown_tx)
    }

    /// The consumer handle.
    #[must_use]
    pub const fn consumer(&self) -> &C {
        &self.consumer
    }

    /// The store handle.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Process messages until a shutdown signal is received.
    ///
    /// Failures are logged and retried; no single message stops the loop.
    pub async fn run(&mut self) {
        tracing::info!(
            poll_timeout_ms = self.config.poll_timeout.as_millis(),
            poison_policy = ?self.config.poison,
            "Starting change processor"
        );

        while !*self.shutdown.borrow() {
            if let Outcome::Retrying { delay, .. } = self.poll_once().await {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    Ok(()) = self.shutdown.changed() => {
                        tracing::info!("Shutdown signal received during backoff");
                    }
                }
            }
        }

        tracing::info!("Change processor stopped");
    }

    /// Run one iteration: poll, decode, apply, acknowledge.
    ///
    /// Never sleeps; a [`Outcome::Retrying`] result carries the delay the caller should wait.
    pub async fn poll_once(&mut self) -> Outcome {
        let message = if let Some(message) = self.redeliver.take() {
            message
        } else {
            match self.consumer.poll(self.config.poll_timeout).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    tracing::trace!("No message within poll timeout");
                    return Outcome::Idle;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to consume message");
                    metrics::counter!("user_sync.consume.errors").increment(1);
                    return Outcome::ConsumeFailed(e);
                }
            }
        };

        match self.process(&message).await {
            Ok(outcome) => {
                self.failures = None;
                outcome
            }
            Err(error) => self.handle_failure(message, error).await,
        }
    }

    async fn process(&mut self, message: &ConsumedMessage) -> Result<Outcome, ProcessError> {
        let position = message.position.clone();

        let Some(envelope) = ChangeEnvelope::decode(message.payload_bytes())? else {
            tracing::warn!(position = %position, "Skipping change event without payload");
            metrics::counter!("user_sync.messages.skipped").increment(1);
            return Ok(Outcome::Skipped { position });
        };

        let mutation = match Mutation::resolve(&envelope)? {
            Mutation::Ignore(operation) => {
                tracing::warn!(
                    position = %position,
                    op = %operation,
                    "Ignoring unsupported change operation"
                );
                metrics::counter!("user_sync.messages.ignored", "reason" => "unknown_op")
                    .increment(1);
                self.commit_offset(&position).await;
                return Ok(Outcome::Ignored {
                    position,
                    operation,
                });
            }
            Mutation::MissingImage { operation, field } => {
                tracing::warn!(
                    position = %position,
                    op = %operation,
                    field,
                    "Change event has no image to apply"
                );
                metrics::counter!("user_sync.messages.ignored", "reason" => "missing_image")
                    .increment(1);
                self.commit_offset(&position).await;
                return Ok(Outcome::MissingImage {
                    position,
                    operation,
                    field,
                });
            }
            mutation => mutation,
        };

        let mut tx = self.store.begin().await?;
        let rows_affected = match apply(&self.store, &mut tx, &mutation).await {
            Ok(rows) => rows,
            Err(e) => {
                if let Err(rollback_error) = self.store.rollback(tx).await {
                    tracing::warn!(error = %rollback_error, "Failed to roll back transaction");
                }
                return Err(e.into());
            }
        };
        self.store.commit(tx).await?;

        match &mutation {
            Mutation::Upsert(user) => tracing::info!(
                position = %position,
                op = %envelope.operation,
                user_id = %user.id,
                rows_affected,
                "Upserted user"
            ),
            Mutation::Delete(id) => tracing::info!(
                position = %position,
                user_id = %id,
                rows_affected,
                "Deleted user"
            ),
            Mutation::Ignore(_) | Mutation::MissingImage { .. } => {}
        }
        metrics::counter!("user_sync.messages.applied", "op" => mutation.label()).increment(1);

        self.commit_offset(&position).await;

        Ok(Outcome::Applied {
            position,
            mutation,
            rows_affected,
        })
    }

    async fn handle_failure(&mut self, message: ConsumedMessage, error: ProcessError) -> Outcome {
        let position = message.position.clone();
        let attempt = self.record_failure(&position);

        if let (Disposition::Poison, PoisonPolicy::DeadLetter { max_attempts }) =
            (error.disposition(), self.config.poison)
        {
            if attempt >= max_attempts {
                match dead_letter(&self.store, &message, &error, attempt).await {
                    Ok(dlq_id) => {
                        self.failures = None;
                        metrics::counter!("user_sync.messages.dead_lettered").increment(1);
                        self.commit_offset(&position).await;
                        return Outcome::DeadLettered { position, dlq_id };
                    }
                    Err(e) => {
                        tracing::error!(
                            position = %position,
                            error = %e,
                            "Failed to dead-letter message"
                        );
                    }
                }
            }
        }

        let delay = self.config.retry.delay_for_attempt(attempt - 1);
        tracing::error!(
            position = %position,
            attempt,
            delay_ms = delay.as_millis(),
            error = %error,
            "Failed to process change event, will retry"
        );
        metrics::counter!("user_sync.messages.retried", "reason" => error.reason()).increment(1);

        if let Err(e) = self.consumer.rewind(&position).await {
            tracing::warn!(
                position = %position,
                error = %e,
                "Rewind failed, holding message for local redelivery"
            );
            self.redeliver = Some(message);
        }

        Outcome::Retrying {
            position,
            attempt,
            delay,
            error,
        }
    }

    fn record_failure(&mut self, position: &MessagePosition) -> u32 {
        let attempt = match &self.failures {
            Some((failed, count)) if failed == position => count.saturating_add(1),
            _ => 1,
        };
        self.failures = Some((position.clone(), attempt));
        attempt
    }

    /// Acknowledge `position`. Failures are logged; the message is redelivered later and
    /// reapplied idempotently.
    async fn commit_offset(&mut self, position: &MessagePosition) {
        if let Err(e) = self.consumer.commit(position).await {
            tracing::warn!(position = %position, error = %e, "Failed to commit offset");
            metrics::counter!("user_sync.offset_commit.errors").increment(1);
        }
    }
}

async fn apply<S: UserStore>(
    store: &S,
    tx: &mut S::Tx,
    mutation: &Mutation,
) -> Result<u64, StoreError> {
    match mutation {
        Mutation::Upsert(user) => store.upsert(tx, user).await,
        Mutation::Delete(id) => store.delete(tx, id).await,
        Mutation::Ignore(_) | Mutation::MissingImage { .. } => Ok(0),
    }
}

async fn dead_letter<S: UserStore>(
    store: &S,
    message: &ConsumedMessage,
    error: &ProcessError,
    attempts: u32,
) -> Result<i64, StoreError> {
    let failed = FailedMessage {
        position: message.position.clone(),
        payload: message.payload.clone(),
        error: error.to_string(),
        attempts,
    };

    let mut tx = store.begin().await?;
    let dlq_id = store.dead_letter(&mut tx, &failed).await?;
    store.commit(tx).await?;

    Ok(dlq_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = ProcessorConfig::default();

        assert_eq!(config.poll_timeout, Duration::from_secs(2));
        assert_eq!(config.poison, PoisonPolicy::RetryForever);
    }

    #[test]
    fn config_builders_override_fields() {
        let config = ProcessorConfig::default()
            .with_poll_timeout(Duration::from_millis(50))
            .with_poison_policy(PoisonPolicy::DeadLetter { max_attempts: 3 });

        assert_eq!(config.poll_timeout, Duration::from_millis(50));
        assert_eq!(config.poison, PoisonPolicy::DeadLetter { max_attempts: 3 });
    }
}
