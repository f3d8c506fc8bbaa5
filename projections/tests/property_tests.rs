//! Property tests: any change history converges to the reference model, even when every
//! offset commit is lost and the whole history is replayed.

#![allow(clippy::unwrap_used)] // Tests can unwrap

use proptest::prelude::*;
use std::time::Duration;
use user_sync_projections::{ChangeProcessor, Outcome, ProcessorConfig};
use user_sync_testing::properties::{arb_changes, arb_user, expected_state};
use user_sync_testing::{InMemoryConsumer, InMemoryUserStore, fixtures};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

async fn drain(consumer: &InMemoryConsumer, store: &InMemoryUserStore) -> usize {
    let config = ProcessorConfig::default().with_poll_timeout(Duration::ZERO);
    let (mut processor, _shutdown) = ChangeProcessor::new(consumer.clone(), store.clone(), config);

    let mut applied = 0;
    while let outcome @ (Outcome::Applied { .. } | Outcome::Skipped { .. } | Outcome::Ignored { .. }) =
        processor.poll_once().await
    {
        if matches!(outcome, Outcome::Applied { .. }) {
            applied += 1;
        }
    }
    applied
}

proptest! {
    #[test]
    fn store_converges_to_last_write_per_id(changes in arb_changes(4, 24)) {
        let consumer = InMemoryConsumer::new("users");
        let store = InMemoryUserStore::new();
        for change in &changes {
            consumer.publish(change.to_event());
        }

        let applied = runtime().block_on(drain(&consumer, &store));

        prop_assert_eq!(applied, changes.len());
        prop_assert_eq!(store.snapshot(), expected_state(&changes));
    }

    #[test]
    fn full_replay_after_lost_commits_is_harmless(changes in arb_changes(4, 24)) {
        let consumer = InMemoryConsumer::new("users");
        let store = InMemoryUserStore::new();
        for change in &changes {
            consumer.publish(change.to_event());
        }

        consumer.fail_next_commits(u32::MAX);
        runtime().block_on(drain(&consumer, &store));
        prop_assert_eq!(consumer.committed_offset(0), None);

        consumer.fail_next_commits(0);
        consumer.restart();
        runtime().block_on(drain(&consumer, &store));

        prop_assert_eq!(store.snapshot(), expected_state(&changes));
    }

    #[test]
    fn upserting_twice_equals_upserting_once(user in arb_user()) {
        let consumer = InMemoryConsumer::new("users");
        let store = InMemoryUserStore::new();
        consumer.publish(fixtures::create_event(&user));

        runtime().block_on(drain(&consumer, &store));
        let once = store.snapshot();

        consumer.publish(fixtures::update_event(&user));
        runtime().block_on(drain(&consumer, &store));

        prop_assert_eq!(store.snapshot(), once);
        prop_assert_eq!(store.get(&user.id), Some(user));
    }
}
