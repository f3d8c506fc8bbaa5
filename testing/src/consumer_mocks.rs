//! In-memory [`ChangeConsumer`] with broker-like offset semantics.
//!
//! The consumer keeps an append-only log per partition, a delivery cursor per partition and
//! the committed offset per partition, which is what a Kafka consumer group persists.
//! [`InMemoryConsumer::restart`] moves every cursor back to its committed offset, which is
//! what a crashed process sees when it rejoins the group.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use crate::call_log::{Call, CallLog};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use user_sync_core::{ChangeConsumer, ConsumedMessage, ConsumerError, MessagePosition};

#[derive(Debug, Default)]
struct ConsumerState {
    partitions: BTreeMap<i32, Vec<Option<Vec<u8>>>>,
    cursors: HashMap<i32, i64>,
    committed: HashMap<i32, i64>,
    commit_history: Vec<MessagePosition>,
    poll_count: usize,
    failing_polls: u32,
    failing_commits: u32,
    failing_rewinds: u32,
    call_log: Option<CallLog>,
}

/// In-memory change consumer for fast, deterministic tests.
///
/// Clones share state, so a test can keep a handle while the processor owns another.
///
/// # Example
///
/// ```
/// use user_sync_testing::InMemoryConsumer;
/// use user_sync_core::ChangeConsumer;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let consumer = InMemoryConsumer::new("users");
/// let position = consumer.publish(b"{}".to_vec());
///
/// let mut handle = consumer.clone();
/// let message = handle.poll(Duration::ZERO).await.unwrap().unwrap();
/// assert_eq!(message.position, position);
///
/// handle.commit(&position).await.unwrap();
/// assert_eq!(consumer.committed_offset(0), Some(1));
/// # });
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryConsumer {
    topic: String,
    state: Arc<RwLock<ConsumerState>>,
}

impl InMemoryConsumer {
    /// Create a consumer for `topic` with no messages.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: Arc::new(RwLock::new(ConsumerState::default())),
        }
    }

    /// Record commits and rewinds into `log`.
    #[must_use]
    pub fn with_call_log(self, log: CallLog) -> Self {
        self.state.write().unwrap().call_log = Some(log);
        self
    }

    /// Append a message to partition 0.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> MessagePosition {
        self.append(0, Some(payload.into()))
    }

    /// Append a message to `partition`.
    pub fn publish_to(&self, partition: i32, payload: impl Into<Vec<u8>>) -> MessagePosition {
        self.append(partition, Some(payload.into()))
    }

    /// Append a tombstone (no payload) to partition 0.
    pub fn publish_tombstone(&self) -> MessagePosition {
        self.append(0, None)
    }

    fn append(&self, partition: i32, payload: Option<Vec<u8>>) -> MessagePosition {
        let mut state = self.state.write().unwrap();
        let log = state.partitions.entry(partition).or_default();
        log.push(payload);
        let offset = i64::try_from(log.len() - 1).unwrap();
        MessagePosition::new(self.topic.clone(), partition, offset)
    }

    /// The committed offset of `partition`: the next offset the group will read.
    #[must_use]
    pub fn committed_offset(&self, partition: i32) -> Option<i64> {
        self.state.read().unwrap().committed.get(&partition).copied()
    }

    /// Every successful commit, in call order.
    #[must_use]
    pub fn commits(&self) -> Vec<MessagePosition> {
        self.state.read().unwrap().commit_history.clone()
    }

    /// Number of times `poll` was called.
    #[must_use]
    pub fn poll_count(&self) -> usize {
        self.state.read().unwrap().poll_count
    }

    /// Messages not yet delivered since the last restart or rewind.
    #[must_use]
    pub fn pending(&self) -> usize {
        let state = self.state.read().unwrap();
        state
            .partitions
            .iter()
            .map(|(partition, log)| {
                let cursor = state.cursors.get(partition).copied().unwrap_or_default();
                usize::try_from(cursor).map_or(0, |cursor| log.len().saturating_sub(cursor))
            })
            .sum()
    }

    /// Simulate a process restart: delivery resumes from the committed offsets, or from
    /// the beginning of partitions that were never committed.
    pub fn restart(&self) {
        let mut state = self.state.write().unwrap();
        state.cursors = state.committed.clone();
    }

    /// Make the next `count` polls fail with a transport error.
    pub fn fail_next_polls(&self, count: u32) {
        self.state.write().unwrap().failing_polls = count;
    }

    /// Make the next `count` commits fail.
    pub fn fail_next_commits(&self, count: u32) {
        self.state.write().unwrap().failing_commits = count;
    }

    /// Make the next `count` rewinds fail.
    pub fn fail_next_rewinds(&self, count: u32) {
        self.state.write().unwrap().failing_rewinds = count;
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

impl ChangeConsumer for InMemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedMessage>, ConsumerError> {
        let next = {
            let mut state = self.state.write().unwrap();
            state.poll_count += 1;

            if take_failure(&mut state.failing_polls) {
                return Err(ConsumerError::Transport("injected poll failure".to_string()));
            }

            let next = state.partitions.iter().find_map(|(partition, log)| {
                let cursor = state.cursors.get(partition).copied().unwrap_or_default();
                let index = usize::try_from(cursor).ok()?;
                log.get(index)
                    .map(|payload| (*partition, cursor, payload.clone()))
            });
            if let Some((partition, offset, _)) = &next {
                state.cursors.insert(*partition, offset + 1);
            }
            next
        };

        let Some((partition, offset, payload)) = next else {
            // Idle brokers block for the whole timeout
            tokio::time::sleep(timeout).await;
            return Ok(None);
        };

        Ok(Some(ConsumedMessage {
            position: MessagePosition::new(self.topic.clone(), partition, offset),
            key: None,
            payload,
        }))
    }

    async fn commit(&mut self, position: &MessagePosition) -> Result<(), ConsumerError> {
        let mut state = self.state.write().unwrap();

        if take_failure(&mut state.failing_commits) {
            return Err(ConsumerError::CommitFailed {
                position: position.clone(),
                reason: "injected commit failure".to_string(),
            });
        }

        state
            .committed
            .insert(position.partition, position.next_offset());
        state.commit_history.push(position.clone());
        if let Some(log) = &state.call_log {
            log.record(Call::OffsetCommit(position.clone()));
        }
        Ok(())
    }

    async fn rewind(&mut self, position: &MessagePosition) -> Result<(), ConsumerError> {
        let mut state = self.state.write().unwrap();

        if take_failure(&mut state.failing_rewinds) {
            return Err(ConsumerError::RewindFailed {
                position: position.clone(),
                reason: "injected rewind failure".to_string(),
            });
        }

        state.cursors.insert(position.partition, position.offset);
        if let Some(log) = &state.call_log {
            log.record(Call::Rewind(position.clone()));
        }
        Ok(())
    }
}
