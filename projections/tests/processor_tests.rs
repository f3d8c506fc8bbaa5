//! End-to-end tests for `ChangeProcessor` against the in-memory doubles.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect
#![allow(clippy::panic)] // Tests can panic

use std::time::Duration;
use user_sync_core::{DecodeError, StoreError, User};
use user_sync_projections::{
    ChangeProcessor, Mutation, Outcome, PoisonPolicy, ProcessError, ProcessorConfig, RetryPolicy,
};
use user_sync_testing::{CallLog, InMemoryConsumer, InMemoryUserStore, fixtures};

type Processor = ChangeProcessor<InMemoryConsumer, InMemoryUserStore>;

const TOPIC: &str = "mongo.productionData.users";

const ALICE_CREATE: &str = r#"{"payload":{"op":"c","after":"{\"_id\":{\"$oid\":\"abc123\"},\"Name\":\"Alice\",\"Email\":\"a@x.com\",\"Age\":30}"}}"#;
const ALICE_UPDATE: &str = r#"{"payload":{"op":"u","after":"{\"_id\":{\"$oid\":\"abc123\"},\"Name\":\"Alice\",\"Email\":\"a@x.com\",\"Age\":31}"}}"#;
const ALICE_DELETE: &str = r#"{"payload":{"op":"d","before":"{\"_id\":{\"$oid\":\"abc123\"},\"Name\":\"Alice\"}"}}"#;

fn config() -> ProcessorConfig {
    ProcessorConfig::default().with_poll_timeout(Duration::from_millis(10))
}

fn setup(config: ProcessorConfig) -> (InMemoryConsumer, InMemoryUserStore, Processor) {
    user_sync_testing::init_test_tracing();

    let consumer = InMemoryConsumer::new(TOPIC);
    let store = InMemoryUserStore::new();
    let (processor, _shutdown) = ChangeProcessor::new(consumer.clone(), store.clone(), config);
    (consumer, store, processor)
}

fn alice(age: i32) -> User {
    User::new("abc123")
        .with_name("Alice")
        .with_email("a@x.com")
        .with_age(age)
}

async fn drain(processor: &mut Processor) -> Vec<Outcome> {
    let mut outcomes = Vec::new();
    loop {
        match processor.poll_once().await {
            Outcome::Idle => return outcomes,
            outcome => outcomes.push(outcome),
        }
    }
}

// ============================================================================
// Literal scenarios
// ============================================================================

#[tokio::test]
async fn scenario_create_inserts_row() {
    let (consumer, store, mut processor) = setup(config());
    let position = consumer.publish(ALICE_CREATE);

    let outcome = processor.poll_once().await;

    assert_eq!(
        outcome,
        Outcome::Applied {
            position,
            mutation: Mutation::Upsert(alice(30)),
            rows_affected: 1,
        }
    );
    assert_eq!(store.get("abc123"), Some(alice(30)));
    assert_eq!(consumer.committed_offset(0), Some(1));
}

#[tokio::test]
async fn scenario_update_overwrites_row() {
    let (consumer, store, mut processor) = setup(config());
    consumer.publish(ALICE_CREATE);
    consumer.publish(ALICE_UPDATE);

    drain(&mut processor).await;

    assert_eq!(store.users(), vec![alice(31)]);
    assert_eq!(consumer.committed_offset(0), Some(2));
}

#[tokio::test]
async fn scenario_delete_then_repeat_delete() {
    let (consumer, store, mut processor) = setup(config());
    consumer.publish(ALICE_CREATE);
    consumer.publish(ALICE_DELETE);
    consumer.publish(ALICE_DELETE);

    let outcomes = drain(&mut processor).await;

    let deletes: Vec<u64> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            Outcome::Applied {
                mutation: Mutation::Delete(id),
                rows_affected,
                ..
            } if id == "abc123" => Some(*rows_affected),
            _ => None,
        })
        .collect();

    assert_eq!(deletes, vec![1, 0]);
    assert!(store.is_empty());
    assert_eq!(consumer.committed_offset(0), Some(3));
}

#[tokio::test]
async fn scenario_null_payload_is_skipped_and_loop_proceeds() {
    let (consumer, store, mut processor) = setup(config());
    let skipped = consumer.publish(fixtures::null_payload());
    let next = consumer.publish(ALICE_CREATE);

    assert_eq!(
        processor.poll_once().await,
        Outcome::Skipped { position: skipped }
    );
    assert!(store.is_empty());
    assert_eq!(consumer.committed_offset(0), None);

    let outcome = processor.poll_once().await;
    assert!(matches!(outcome, Outcome::Applied { position, .. } if position == next));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn scenario_unknown_operation_is_handled_without_mutation() {
    let (consumer, store, mut processor) = setup(config());
    let position = consumer.publish(fixtures::envelope("x", Some("{}"), None));

    assert_eq!(
        processor.poll_once().await,
        Outcome::Ignored {
            position,
            operation: "x".to_string(),
        }
    );
    assert!(store.is_empty());
    assert_eq!(store.commit_count(), 0);
    assert_eq!(consumer.committed_offset(0), Some(1));
}

// ============================================================================
// Delivery properties
// ============================================================================

#[tokio::test]
async fn tombstone_is_skipped() {
    let (consumer, store, mut processor) = setup(config());
    let position = consumer.publish_tombstone();

    assert_eq!(processor.poll_once().await, Outcome::Skipped { position });
    assert!(store.is_empty());
}

#[tokio::test]
async fn delete_without_before_image_is_acknowledged_and_loop_proceeds() {
    let (consumer, store, mut processor) = setup(config());
    let delete = consumer.publish(r#"{"payload":{"op":"d","before":null,"after":null}}"#);
    let next = consumer.publish(ALICE_CREATE);

    assert_eq!(
        processor.poll_once().await,
        Outcome::MissingImage {
            position: delete,
            operation: "d".to_string(),
            field: "before",
        }
    );
    assert_eq!(store.commit_count(), 0);
    assert_eq!(consumer.committed_offset(0), Some(1));

    let outcome = processor.poll_once().await;
    assert!(matches!(outcome, Outcome::Applied { position, .. } if position == next));
    assert_eq!(store.get("abc123"), Some(alice(30)));
    assert_eq!(consumer.committed_offset(0), Some(2));
}

#[tokio::test]
async fn null_encoded_after_image_is_acknowledged() {
    let (consumer, store, mut processor) = setup(config());
    let position = consumer.publish(fixtures::envelope("u", Some("null"), None));

    assert_eq!(
        processor.poll_once().await,
        Outcome::MissingImage {
            position,
            operation: "u".to_string(),
            field: "after",
        }
    );
    assert!(store.is_empty());
    assert_eq!(consumer.committed_offset(0), Some(1));
}

#[tokio::test]
async fn redelivered_create_is_idempotent() {
    let (consumer, store, mut processor) = setup(config());
    consumer.publish(ALICE_CREATE);
    consumer.publish(ALICE_CREATE);

    let outcomes = drain(&mut processor).await;

    assert_eq!(outcomes.len(), 2);
    assert_eq!(store.users(), vec![alice(30)]);
}

#[tokio::test]
async fn later_operation_wins_for_same_id() {
    let (consumer, store, mut processor) = setup(config());
    let bob = User::new("bob");

    consumer.publish(fixtures::create_event(&alice(30)));
    consumer.publish(fixtures::delete_event("abc123"));
    consumer.publish(fixtures::delete_event("bob"));
    consumer.publish(fixtures::read_event(&bob));

    drain(&mut processor).await;

    assert_eq!(store.get("abc123"), None);
    assert_eq!(store.get("bob"), Some(bob));
}

#[tokio::test]
async fn offset_is_committed_only_after_store_commit() {
    user_sync_testing::init_test_tracing();
    let log = CallLog::new();
    let consumer = InMemoryConsumer::new(TOPIC).with_call_log(log.clone());
    let store = InMemoryUserStore::new().with_call_log(log.clone());
    let (mut processor, _shutdown) =
        ChangeProcessor::new(consumer.clone(), store.clone(), config());

    consumer.publish(ALICE_CREATE);
    let ignored = consumer.publish(fixtures::envelope("t", None, None));
    consumer.publish(ALICE_UPDATE);
    consumer.publish(ALICE_DELETE);

    drain(&mut processor).await;

    assert_eq!(consumer.commits().len(), 4);
    assert!(log.offsets_follow_store_commits(&[ignored]));
}

#[tokio::test]
async fn crash_after_store_commit_replays_without_side_effects() {
    let (consumer, store, mut processor) = setup(config());
    consumer.publish(ALICE_CREATE);
    consumer.publish(ALICE_DELETE);

    // Store commits succeed but neither offset reaches the broker
    consumer.fail_next_commits(2);
    let outcomes = drain(&mut processor).await;
    assert_eq!(outcomes.len(), 2);
    assert!(store.is_empty());
    assert_eq!(consumer.committed_offset(0), None);
    drop(processor);

    consumer.restart();
    let (mut restarted, _shutdown) =
        ChangeProcessor::new(consumer.clone(), store.clone(), config());
    let replayed = drain(&mut restarted).await;

    assert_eq!(replayed.len(), 2);
    assert!(store.is_empty());
    assert_eq!(consumer.committed_offset(0), Some(2));
}

#[tokio::test]
async fn replayed_delete_reports_zero_rows() {
    let (consumer, store, mut processor) = setup(config());
    store.seed(alice(30));
    consumer.publish(ALICE_DELETE);

    consumer.fail_next_commits(1);
    assert!(matches!(
        processor.poll_once().await,
        Outcome::Applied { rows_affected: 1, .. }
    ));

    consumer.restart();
    assert!(matches!(
        processor.poll_once().await,
        Outcome::Applied {
            mutation: Mutation::Delete(_),
            rows_affected: 0,
            ..
        }
    ));
    assert!(store.is_empty());
    assert_eq!(consumer.committed_offset(0), Some(1));
}

#[tokio::test]
async fn crash_after_upsert_commit_leaves_single_row() {
    let (consumer, store, mut processor) = setup(config());
    consumer.publish(ALICE_CREATE);

    consumer.fail_next_commits(1);
    processor.poll_once().await;
    consumer.restart();
    processor.poll_once().await;

    assert_eq!(store.users(), vec![alice(30)]);
    assert_eq!(store.commit_count(), 2);
    assert_eq!(consumer.committed_offset(0), Some(1));
}

// ============================================================================
// Failures and retries
// ============================================================================

#[tokio::test]
async fn store_failure_rolls_back_rewinds_and_retries() {
    let (consumer, store, mut processor) = setup(config());
    let position = consumer.publish(ALICE_CREATE);
    store.fail_next_writes(1);

    let outcome = processor.poll_once().await;
    assert_eq!(
        outcome,
        Outcome::Retrying {
            position: position.clone(),
            attempt: 1,
            delay: RetryPolicy::default().delay_for_attempt(0),
            error: ProcessError::Store(StoreError::Query("injected write failure".to_string())),
        }
    );
    assert!(store.is_empty());
    assert_eq!(store.rollback_count(), 1);
    assert_eq!(consumer.committed_offset(0), None);

    let outcome = processor.poll_once().await;
    assert!(matches!(outcome, Outcome::Applied { position: p, .. } if p == position));
    assert_eq!(store.get("abc123"), Some(alice(30)));
}

#[tokio::test]
async fn failed_store_commit_is_retried() {
    let (consumer, store, mut processor) = setup(config());
    consumer.publish(ALICE_CREATE);
    store.fail_next_commits(1);

    assert!(matches!(
        processor.poll_once().await,
        Outcome::Retrying {
            error: ProcessError::Store(StoreError::Transaction(_)),
            ..
        }
    ));
    assert_eq!(consumer.committed_offset(0), None);

    assert!(matches!(processor.poll_once().await, Outcome::Applied { .. }));
    assert_eq!(consumer.committed_offset(0), Some(1));
}

#[tokio::test]
async fn malformed_envelope_is_retried_forever_by_default() {
    let retry = RetryPolicy::builder()
        .initial_delay(Duration::from_millis(100))
        .max_delay(Duration::from_millis(300))
        .build();
    let (consumer, store, mut processor) = setup(config().with_retry(retry));
    let position = consumer.publish(b"{not json".to_vec());
    consumer.publish(ALICE_CREATE);

    let mut delays = Vec::new();
    for expected_attempt in 1..=4 {
        match processor.poll_once().await {
            Outcome::Retrying {
                position: p,
                attempt,
                delay,
                error: ProcessError::Decode(DecodeError::Envelope(_)),
            } => {
                assert_eq!(p, position);
                assert_eq!(attempt, expected_attempt);
                delays.push(delay);
            }
            other => panic!("expected a retry, got {other:?}"),
        }
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(300),
            Duration::from_millis(300),
        ]
    );
    assert!(store.is_empty());
    assert_eq!(consumer.committed_offset(0), None);
}

#[tokio::test]
async fn entity_without_id_is_retried() {
    let (consumer, store, mut processor) = setup(config());
    consumer.publish(fixtures::envelope("c", Some(r#"{"Name":"NoId"}"#), None));

    assert!(matches!(
        processor.poll_once().await,
        Outcome::Retrying {
            error: ProcessError::Decode(DecodeError::Entity(_)),
            ..
        }
    ));
    assert_eq!(store.commit_count(), 0);
}

#[tokio::test]
async fn poison_message_is_dead_lettered_after_max_attempts() {
    let (consumer, store, mut processor) = setup(
        config().with_poison_policy(PoisonPolicy::DeadLetter { max_attempts: 3 }),
    );
    let poison = consumer.publish(b"{not json".to_vec());
    let next = consumer.publish(ALICE_CREATE);

    for _ in 0..2 {
        assert!(matches!(processor.poll_once().await, Outcome::Retrying { .. }));
    }
    assert_eq!(
        processor.poll_once().await,
        Outcome::DeadLettered {
            position: poison.clone(),
            dlq_id: 1,
        }
    );

    let parked = store.dead_letters();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].position, poison);
    assert_eq!(parked[0].payload.as_deref(), Some(&b"{not json"[..]));
    assert_eq!(parked[0].attempts, 3);
    assert_eq!(consumer.committed_offset(0), Some(1));

    let outcome = processor.poll_once().await;
    assert!(matches!(outcome, Outcome::Applied { position, .. } if position == next));
}

#[tokio::test]
async fn binary_poison_payload_is_parked_byte_for_byte() {
    let (consumer, store, mut processor) = setup(
        config().with_poison_policy(PoisonPolicy::DeadLetter { max_attempts: 1 }),
    );
    let garbage = vec![0x00, b'{', 0xff, 0x00];
    consumer.publish(garbage.clone());

    assert!(matches!(
        processor.poll_once().await,
        Outcome::DeadLettered { dlq_id: 1, .. }
    ));
    assert_eq!(store.dead_letters()[0].payload, Some(garbage));
    assert_eq!(consumer.committed_offset(0), Some(1));
}

#[tokio::test]
async fn store_failures_are_never_dead_lettered() {
    let (consumer, store, mut processor) = setup(
        config().with_poison_policy(PoisonPolicy::DeadLetter { max_attempts: 1 }),
    );
    consumer.publish(ALICE_CREATE);
    store.fail_next_writes(3);

    for attempt in 1..=3 {
        assert!(matches!(
            processor.poll_once().await,
            Outcome::Retrying { attempt: a, .. } if a == attempt
        ));
    }
    assert!(store.dead_letters().is_empty());

    assert!(matches!(processor.poll_once().await, Outcome::Applied { .. }));
}

#[tokio::test]
async fn failed_dead_letter_write_falls_back_to_retry() {
    let (consumer, store, mut processor) = setup(
        config().with_poison_policy(PoisonPolicy::DeadLetter { max_attempts: 1 }),
    );
    consumer.publish(b"garbage".to_vec());
    store.fail_next_begins(1);

    assert!(matches!(processor.poll_once().await, Outcome::Retrying { .. }));
    assert_eq!(consumer.committed_offset(0), None);

    assert!(matches!(
        processor.poll_once().await,
        Outcome::DeadLettered { .. }
    ));
    assert_eq!(store.dead_letters().len(), 1);
}

#[tokio::test]
async fn failed_rewind_redelivers_locally() {
    let (consumer, store, mut processor) = setup(config());
    let position = consumer.publish(ALICE_CREATE);
    store.fail_next_writes(1);
    consumer.fail_next_rewinds(1);

    assert!(matches!(processor.poll_once().await, Outcome::Retrying { .. }));
    let polls = consumer.poll_count();

    let outcome = processor.poll_once().await;
    assert!(matches!(outcome, Outcome::Applied { position: p, .. } if p == position));
    assert_eq!(consumer.poll_count(), polls);
    assert_eq!(consumer.committed_offset(0), Some(1));
}

#[tokio::test]
async fn consume_errors_are_reported_and_polling_continues() {
    let (consumer, store, mut processor) = setup(config());
    consumer.publish(ALICE_CREATE);
    consumer.fail_next_polls(1);

    assert!(matches!(
        processor.poll_once().await,
        Outcome::ConsumeFailed(_)
    ));
    assert!(matches!(processor.poll_once().await, Outcome::Applied { .. }));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn idle_poll_reports_idle() {
    let (_consumer, _store, mut processor) = setup(config());
    assert_eq!(processor.poll_once().await, Outcome::Idle);
}

// ============================================================================
// Run loop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn run_processes_until_shutdown() {
    user_sync_testing::init_test_tracing();
    let consumer = InMemoryConsumer::new(TOPIC);
    let store = InMemoryUserStore::new();
    let (mut processor, shutdown) =
        ChangeProcessor::new(consumer.clone(), store.clone(), config());

    consumer.publish(ALICE_CREATE);
    consumer.publish(ALICE_UPDATE);
    consumer.publish(fixtures::create_event(&User::new("bob")));

    let handle = tokio::spawn(async move {
        processor.run().await;
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(store.len(), 2);
    assert_eq!(store.get("abc123"), Some(alice(31)));
    assert_eq!(consumer.committed_offset(0), Some(3));
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_retry_backoff() {
    user_sync_testing::init_test_tracing();
    let consumer = InMemoryConsumer::new(TOPIC);
    let store = InMemoryUserStore::new();
    let retry = RetryPolicy::builder()
        .initial_delay(Duration::from_secs(3600))
        .max_delay(Duration::from_secs(3600))
        .build();
    let (mut processor, shutdown) =
        ChangeProcessor::new(consumer.clone(), store.clone(), config().with_retry(retry));

    consumer.publish(b"{not json".to_vec());
    let started = tokio::time::Instant::now();

    let handle = tokio::spawn(async move {
        processor.run().await;
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.send(true).unwrap();
    handle.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(consumer.committed_offset(0), None);
}
