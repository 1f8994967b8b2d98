use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard, watch};

use crate::{
    error::StoreError,
    store::{CasOutcome, KvEntry, KvStore, Snapshot},
};

/// In-process store with the same revision semantics as Xline.
///
/// Every write bumps a single global revision. Errors queued with
/// [`MemStore::fail_next`] are returned by the next operations in order,
/// which lets tests simulate an unreachable store.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    changes: watch::Sender<i64>,
    operations: AtomicUsize,
}

impl Default for Inner {
    fn default() -> Self {
        let (changes, _) = watch::channel(0);
        Inner {
            state: Mutex::new(State::default()),
            changes,
            operations: AtomicUsize::new(0),
        }
    }
}

#[derive(Default)]
struct State {
    revision: i64,
    compacted: i64,
    data: BTreeMap<String, Stored>,
    /// (revision, key) of every write and delete since the last compaction.
    history: Vec<(i64, String)>,
    faults: VecDeque<StoreError>,
}

struct Stored {
    value: Vec<u8>,
    mod_revision: i64,
}

impl State {
    fn commit_put(&mut self, key: &str, value: Vec<u8>) -> i64 {
        self.revision += 1;
        self.data.insert(
            key.to_string(),
            Stored {
                value,
                mod_revision: self.revision,
            },
        );
        self.history.push((self.revision, key.to_string()));
        self.revision
    }

    fn commit_delete(&mut self, key: &str) -> Option<i64> {
        self.data.remove(key)?;
        self.revision += 1;
        self.history.push((self.revision, key.to_string()));
        Some(self.revision)
    }

    fn first_change_after(&self, prefix: &str, after: i64) -> Option<i64> {
        self.history
            .iter()
            .find(|(rev, key)| *rev > after && key.starts_with(prefix))
            .map(|(rev, _)| *rev)
    }

    fn matches(&self, key: &str, expected_mod_revision: i64) -> bool {
        match self.data.get(key) {
            Some(stored) => stored.mod_revision == expected_mod_revision,
            None => expected_mod_revision == 0,
        }
    }
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    /// Unconditional write, as an external scheduler would do it.
    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> i64 {
        let rev = self.inner.state.lock().await.commit_put(key, value.into());
        self.inner.changes.send_replace(rev);
        rev
    }

    /// Unconditional delete. Returns the delete's revision if the key existed.
    pub async fn delete(&self, key: &str) -> Option<i64> {
        let rev = self.inner.state.lock().await.commit_delete(key)?;
        self.inner.changes.send_replace(rev);
        Some(rev)
    }

    pub async fn revision(&self) -> i64 {
        self.inner.state.lock().await.revision
    }

    /// Drop change history older than `revision`. Waits that start before it
    /// fail with [`StoreError::Compacted`].
    pub async fn compact(&self, revision: i64) {
        let mut state = self.inner.state.lock().await;
        state.compacted = state.compacted.max(revision);
        let compacted = state.compacted;
        state.history.retain(|(rev, _)| *rev >= compacted);
    }

    /// Make the next store operation fail with `error`.
    pub async fn fail_next(&self, error: StoreError) {
        self.inner.state.lock().await.faults.push_back(error);
    }

    /// Number of operations issued through [`KvStore`].
    pub fn operations(&self) -> usize {
        self.inner.operations.load(Ordering::SeqCst)
    }

    async fn begin(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.inner.operations.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;
        if let Some(fault) = state.faults.pop_front() {
            return Err(fault);
        }
        Ok(state)
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let state = self.begin().await?;
        Ok(state.data.get(key).map(|stored| KvEntry {
            key: key.to_string(),
            value: stored.value.clone(),
            mod_revision: stored.mod_revision,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Snapshot, StoreError> {
        let state = self.begin().await?;
        let entries = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| KvEntry {
                key: key.clone(),
                value: stored.value.clone(),
                mod_revision: stored.mod_revision,
            })
            .collect();
        Ok(Snapshot {
            prefix: prefix.to_string(),
            revision: state.revision,
            entries,
        })
    }

    async fn wait_for_change(&self, prefix: &str, after_revision: i64) -> Result<i64, StoreError> {
        // Subscribe before looking at the history so a write landing in
        // between still wakes us.
        let mut changes = self.inner.changes.subscribe();
        {
            let state = self.begin().await?;
            if after_revision + 1 < state.compacted {
                return Err(StoreError::Compacted {
                    requested: after_revision + 1,
                    compacted: state.compacted,
                });
            }
            if let Some(rev) = state.first_change_after(prefix, after_revision) {
                return Ok(rev);
            }
        }
        loop {
            changes
                .changed()
                .await
                .map_err(|_| StoreError::Unavailable("store closed".to_string()))?;
            let state = self.inner.state.lock().await;
            if let Some(rev) = state.first_change_after(prefix, after_revision) {
                return Ok(rev);
            }
        }
    }

    async fn put_if(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_mod_revision: i64,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.begin().await?;
        if !state.matches(key, expected_mod_revision) {
            return Ok(CasOutcome::Conflict);
        }
        let revision = state.commit_put(key, value);
        drop(state);
        self.inner.changes.send_replace(revision);
        Ok(CasOutcome::Applied { revision })
    }

    async fn delete_if(
        &self,
        key: &str,
        expected_mod_revision: i64,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.begin().await?;
        if !state.matches(key, expected_mod_revision) {
            return Ok(CasOutcome::Conflict);
        }
        let revision = state.commit_delete(key).unwrap_or(state.revision);
        drop(state);
        self.inner.changes.send_replace(revision);
        Ok(CasOutcome::Applied { revision })
    }
}
