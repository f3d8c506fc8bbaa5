//! In-memory [`UserStore`] with transactional staging and fault injection.
//!
//! Mutations are staged in an [`InMemoryTx`] and become visible only when the transaction
//! is committed, so a dropped or failed transaction leaves the table untouched, just like
//! `PostgreSQL`.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use crate::call_log::{Call, CallLog};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use user_sync_core::{FailedMessage, StoreError, User, UserStore};

#[derive(Debug, Clone)]
enum Staged {
    Upsert(User),
    Delete(String),
    DeadLetter(FailedMessage),
}

/// Transaction handle for [`InMemoryUserStore`].
///
/// Dropping it without calling [`UserStore::commit`] discards the staged mutations.
#[derive(Debug, Default)]
pub struct InMemoryTx {
    staged: Vec<Staged>,
}

impl InMemoryTx {
    fn contains(&self, committed: &BTreeMap<String, User>, id: &str) -> bool {
        self.staged
            .iter()
            .fold(committed.contains_key(id), |present, op| match op {
                Staged::Upsert(user) if user.id == id => true,
                Staged::Delete(deleted) if deleted == id => false,
                _ => present,
            })
    }
}

#[derive(Debug, Default)]
struct StoreState {
    users: BTreeMap<String, User>,
    dead_letters: Vec<FailedMessage>,
    commits: usize,
    rollbacks: usize,
    failing_begins: u32,
    failing_writes: u32,
    failing_commits: u32,
    call_log: Option<CallLog>,
}

/// In-memory user mirror for fast, deterministic testing.
///
/// Clones share state, so a test can keep a handle while the processor owns another.
///
/// # Example
///
/// ```
/// use user_sync_testing::InMemoryUserStore;
/// use user_sync_core::{User, UserStore};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryUserStore::new();
///
/// let mut tx = store.begin().await.unwrap();
/// store.upsert(&mut tx, &User::new("abc123")).await.unwrap();
/// assert!(store.get("abc123").is_none()); // not yet committed
///
/// store.commit(tx).await.unwrap();
/// assert_eq!(store.get("abc123"), Some(User::new("abc123")));
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryUserStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryUserStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record commits and rollbacks into `log`.
    #[must_use]
    pub fn with_call_log(self, log: CallLog) -> Self {
        self.state.write().unwrap().call_log = Some(log);
        self
    }

    /// Insert a committed row directly, bypassing transactions.
    pub fn seed(&self, user: User) {
        self.state
            .write()
            .unwrap()
            .users
            .insert(user.id.clone(), user);
    }

    /// The committed row with `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<User> {
        self.state.read().unwrap().users.get(id).cloned()
    }

    /// All committed rows, ordered by id.
    #[must_use]
    pub fn users(&self) -> Vec<User> {
        self.state.read().unwrap().users.values().cloned().collect()
    }

    /// Committed rows keyed by id.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, User> {
        self.state.read().unwrap().users.clone()
    }

    /// Number of committed rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap().users.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().unwrap().users.is_empty()
    }

    /// Committed dead-letter entries, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<FailedMessage> {
        self.state.read().unwrap().dead_letters.clone()
    }

    /// Number of committed transactions.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.state.read().unwrap().commits
    }

    /// Number of explicit rollbacks.
    #[must_use]
    pub fn rollback_count(&self) -> usize {
        self.state.read().unwrap().rollbacks
    }

    /// Make the next `count` calls to `begin` fail with a connection error.
    pub fn fail_next_begins(&self, count: u32) {
        self.state.write().unwrap().failing_begins = count;
    }

    /// Make the next `count` upserts, deletes or dead-letter writes fail with a query error.
    pub fn fail_next_writes(&self, count: u32) {
        self.state.write().unwrap().failing_writes = count;
    }

    /// Make the next `count` commits fail; the staged mutations are lost.
    pub fn fail_next_commits(&self, count: u32) {
        self.state.write().unwrap().failing_commits = count;
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(StoreError::Query("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl UserStore for InMemoryUserStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let mut state = self.state.write().unwrap();
        if state.failing_begins > 0 {
            state.failing_begins -= 1;
            return Err(StoreError::Connection("injected connection failure".to_string()));
        }
        Ok(InMemoryTx::default())
    }

    async fn upsert(&self, tx: &mut Self::Tx, user: &User) -> Result<u64, StoreError> {
        self.check_write()?;
        tx.staged.push(Staged::Upsert(user.clone()));
        Ok(1)
    }

    async fn delete(&self, tx: &mut Self::Tx, id: &str) -> Result<u64, StoreError> {
        self.check_write()?;
        let present = tx.contains(&self.state.read().unwrap().users, id);
        tx.staged.push(Staged::Delete(id.to_string()));
        Ok(u64::from(present))
    }

    async fn dead_letter(&self, tx: &mut Self::Tx, failed: &FailedMessage) -> Result<i64, StoreError> {
        self.check_write()?;
        let staged = tx
            .staged
            .iter()
            .filter(|op| matches!(op, Staged::DeadLetter(_)))
            .count();
        tx.staged.push(Staged::DeadLetter(failed.clone()));
        let id = self.state.read().unwrap().dead_letters.len() + staged + 1;
        Ok(i64::try_from(id).unwrap())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StoreError::Transaction("injected commit failure".to_string()));
        }

        for op in tx.staged {
            match op {
                Staged::Upsert(user) => {
                    state.users.insert(user.id.clone(), user);
                }
                Staged::Delete(id) => {
                    state.users.remove(&id);
                }
                Staged::DeadLetter(failed) => state.dead_letters.push(failed),
            }
        }
        state.commits += 1;
        if let Some(log) = &state.call_log {
            log.record(Call::StoreCommit);
        }
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        drop(tx);
        let mut state = self.state.write().unwrap();
        state.rollbacks += 1;
        if let Some(log) = &state.call_log {
            log.record(Call::StoreRollback);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_transaction_is_discarded() {
        let store = InMemoryUserStore::new();

        let mut tx = store.begin().await.unwrap();
        store.upsert(&mut tx, &User::new("ghost")).await.unwrap();
        drop(tx);

        assert!(store.is_empty());
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn delete_reports_rows_against_staged_state() {
        let store = InMemoryUserStore::new();
        store.seed(User::new("a"));

        let mut tx = store.begin().await.unwrap();
        assert_eq!(store.delete(&mut tx, "a").await.unwrap(), 1);
        assert_eq!(store.delete(&mut tx, "a").await.unwrap(), 0);
        store.upsert(&mut tx, &User::new("b")).await.unwrap();
        assert_eq!(store.delete(&mut tx, "b").await.unwrap(), 1);
        store.commit(tx).await.unwrap();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failed_commit_loses_staged_changes() {
        let store = InMemoryUserStore::new();
        store.fail_next_commits(1);

        let mut tx = store.begin().await.unwrap();
        store.upsert(&mut tx, &User::new("a")).await.unwrap();

        assert!(matches!(
            store.commit(tx).await,
            Err(StoreError::Transaction(_))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn injected_write_failure_applies_once() {
        let store = InMemoryUserStore::new();
        store.fail_next_writes(1);

        let mut tx = store.begin().await.unwrap();
        assert!(store.upsert(&mut tx, &User::new("a")).await.is_err());
        assert_eq!(store.upsert(&mut tx, &User::new("a")).await.unwrap(), 1);
    }
}
