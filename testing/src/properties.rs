//! Property-based testing utilities using proptest.
//!
//! [`arb_changes`] generates change histories over a small id pool so that creates, updates
//! and deletes of the same user interleave. [`expected_state`] is the reference model: the
//! table a correct consumer must converge to after applying a history in order.

use crate::fixtures;
use proptest::prelude::*;
use std::collections::BTreeMap;
use user_sync_core::User;

/// One source-side change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Insert or update with this post-image
    Upsert(User),
    /// Delete the user with this id
    Delete(String),
}

impl Change {
    /// Encode as the connector would publish it.
    #[must_use]
    pub fn to_event(&self) -> Vec<u8> {
        match self {
            Self::Upsert(user) => fixtures::update_event(user),
            Self::Delete(id) => fixtures::delete_event(id),
        }
    }
}

/// Any user whose id is drawn from `ids`.
pub fn arb_user_from(ids: Vec<String>) -> impl Strategy<Value = User> {
    (
        proptest::sample::select(ids),
        proptest::option::of("[A-Za-z ]{1,16}"),
        proptest::option::of("[a-z]{1,8}@[a-z]{1,8}\\.com"),
        any::<i32>(),
    )
        .prop_map(|(id, name, email, age)| User {
            id,
            name,
            email,
            age,
        })
}

/// Any user with a 24-hex-digit `ObjectId`.
pub fn arb_user() -> impl Strategy<Value = User> {
    (
        "[0-9a-f]{24}",
        proptest::option::of("[A-Za-z ]{1,16}"),
        proptest::option::of("[a-z]{1,8}@[a-z]{1,8}\\.com"),
        any::<i32>(),
    )
        .prop_map(|(id, name, email, age)| User {
            id,
            name,
            email,
            age,
        })
}

/// A history of up to `max_len` changes over `pool_size` distinct ids.
pub fn arb_changes(pool_size: usize, max_len: usize) -> impl Strategy<Value = Vec<Change>> {
    let ids: Vec<String> = (0..pool_size.max(1)).map(|n| format!("{n:024x}")).collect();

    let change = prop_oneof![
        3 => arb_user_from(ids.clone()).prop_map(Change::Upsert),
        1 => proptest::sample::select(ids).prop_map(Change::Delete),
    ];

    proptest::collection::vec(change, 0..=max_len)
}

/// The table after applying `changes` in order.
#[must_use]
pub fn expected_state(changes: &[Change]) -> BTreeMap<String, User> {
    let mut table = BTreeMap::new();
    for change in changes {
        match change {
            Change::Upsert(user) => {
                table.insert(user.id.clone(), user.clone());
            }
            Change::Delete(id) => {
                table.remove(id);
            }
        }
    }
    table
}
