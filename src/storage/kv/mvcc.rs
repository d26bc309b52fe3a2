//! Embedded multi-version backend.
//!
//! Committed state lives in a persistent ordered map, so taking a snapshot
//! at `begin` is a pointer clone. Each transaction buffers its writes and
//! validates them at commit: if any written key was committed by someone
//! else after this transaction's snapshot, the commit fails with
//! `WriteConflict` and nothing is applied. Keys and ranges a transaction
//! guards are validated the same way without being written.
//!
//! Deletes are kept as tombstones carrying their commit timestamp until no
//! active transaction could still conflict on them.

use super::{KvBackend, KvPair, KvRangeScan, KvTransaction};
use crate::core::{DbError, Result};
use crate::storage::persistence::{DurabilityMode, PersistenceManager, WalEntry, WalWrite};
use crate::transaction::TransactionId;
use crate::transaction::manager::{TransactionManager, TransactionStats};
use im::OrdMap;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub const BACKEND_NAME: &str = "mvcc";
pub const DEFAULT_CHECKPOINT_THRESHOLD: usize = 1000;
const TOMBSTONE_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
struct VersionedValue {
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
    commit_ts: u64,
}

struct CommittedState {
    entries: OrdMap<Vec<u8>, VersionedValue>,
    last_commit_ts: u64,
    tombstones: usize,
}

impl CommittedState {
    fn changed_since(&self, key: &[u8], start_ts: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|versioned| versioned.commit_ts > start_ts)
    }

    fn range_changed_since(&self, range: &KvRangeScan, start_ts: u64) -> bool {
        let Some(bounds) = range.bounds() else {
            return false;
        };
        self.entries
            .range::<_, [u8]>(bounds)
            .any(|(_, versioned)| versioned.commit_ts > start_ts)
    }

    fn live_entries(&self) -> OrdMap<Vec<u8>, Vec<u8>> {
        self.entries
            .iter()
            .filter_map(|(key, versioned)| {
                versioned
                    .value
                    .as_ref()
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect()
    }
}

/// Keys and ranges read by a transaction that must be unchanged at commit.
#[derive(Debug, Default)]
struct ReadGuards {
    keys: BTreeSet<Vec<u8>>,
    ranges: Vec<KvRangeScan>,
}

pub struct MvccKvBackend {
    state: RwLock<CommittedState>,
    // Serializes validation, logging and apply of commits.
    commit_lock: Mutex<Option<PersistenceManager>>,
    txn_manager: TransactionManager,
    closed: AtomicBool,
}

impl MvccKvBackend {
    /// Purely in-memory backend; nothing survives the process.
    pub fn in_memory() -> Self {
        Self::from_parts(OrdMap::new(), 0, None)
    }

    /// Opens a backend persisted under `path`, replaying any snapshot and
    /// log found there. `path == None` or `DurabilityMode::None` yields an
    /// in-memory backend.
    pub fn open(
        path: Option<&Path>,
        durability: DurabilityMode,
        checkpoint_threshold: usize,
    ) -> Result<Self> {
        let Some(path) = path.filter(|_| durability != DurabilityMode::None) else {
            info!("Opening in-memory mvcc backend");
            return Ok(Self::in_memory());
        };

        let mut persistence = PersistenceManager::new(path, durability)?;
        persistence
            .wal_mut()
            .set_checkpoint_threshold(checkpoint_threshold);

        let recovered = persistence.recover()?;
        info!(
            path = %path.display(),
            keys = recovered.entries.len(),
            replayed = recovered.replayed_commits,
            last_commit_ts = recovered.last_commit_ts,
            "Recovered mvcc backend"
        );

        if recovered.replayed_commits > 0 {
            persistence.checkpoint(recovered.entries.clone(), recovered.last_commit_ts)?;
        }

        let entries = recovered
            .entries
            .into_iter()
            .map(|(key, value)| {
                (
                    key,
                    VersionedValue {
                        value: Some(value),
                        commit_ts: recovered.last_commit_ts,
                    },
                )
            })
            .collect();
        Ok(Self::from_parts(
            entries,
            recovered.last_commit_ts,
            Some(persistence),
        ))
    }

    fn from_parts(
        entries: OrdMap<Vec<u8>, VersionedValue>,
        last_commit_ts: u64,
        persistence: Option<PersistenceManager>,
    ) -> Self {
        Self {
            state: RwLock::new(CommittedState {
                entries,
                last_commit_ts,
                tombstones: 0,
            }),
            commit_lock: Mutex::new(persistence),
            txn_manager: TransactionManager::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_persistent(&self) -> Result<bool> {
        Ok(self.commit_lock.lock()?.is_some())
    }

    /// Number of live (non-deleted) keys in the committed state.
    pub fn key_count(&self) -> Result<usize> {
        let state = self.state.read()?;
        Ok(state.entries.len() - state.tombstones)
    }

    pub fn tombstone_count(&self) -> Result<usize> {
        Ok(self.state.read()?.tombstones)
    }

    pub fn last_commit_ts(&self) -> Result<u64> {
        Ok(self.state.read()?.last_commit_ts)
    }

    pub fn active_transactions(&self) -> Result<usize> {
        self.txn_manager.active_count()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Backend("mvcc backend is closed".to_string()));
        }
        Ok(())
    }

    /// Drops tombstones no active transaction can still conflict on.
    fn prune_tombstones(&self, state: &mut CommittedState) -> Result<usize> {
        let horizon = self
            .txn_manager
            .oldest_active_start_ts()?
            .unwrap_or(u64::MAX);
        let expired: Vec<Vec<u8>> = state
            .entries
            .iter()
            .filter(|(_, versioned)| versioned.value.is_none() && versioned.commit_ts <= horizon)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.entries.remove(key);
        }
        state.tombstones -= expired.len();
        if !expired.is_empty() {
            debug!(pruned = expired.len(), horizon, "Pruned tombstones");
        }
        Ok(expired.len())
    }

    fn commit_writes(
        &self,
        txn_id: TransactionId,
        start_ts: u64,
        writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
        guards: ReadGuards,
    ) -> Result<()> {
        if writes.is_empty() {
            return self.txn_manager.commit(txn_id);
        }

        let mut persistence = self.commit_lock.lock()?;

        let commit_ts = {
            let state = self.state.read()?;
            let conflicted = writes.keys().any(|key| state.changed_since(key, start_ts))
                || guards.keys.iter().any(|key| state.changed_since(key, start_ts))
                || guards
                    .ranges
                    .iter()
                    .any(|range| state.range_changed_since(range, start_ts));
            if conflicted {
                drop(state);
                self.txn_manager.abort_conflicted(txn_id)?;
                warn!(txn = %txn_id, start_ts, "Write-write conflict, transaction aborted");
                return Err(DbError::WriteConflict(txn_id.as_u64()));
            }
            state.last_commit_ts + 1
        };

        if let Some(persistence) = persistence.as_mut() {
            let entry = WalEntry::Commit {
                txn_id: txn_id.as_u64(),
                commit_ts,
                writes: writes
                    .iter()
                    .map(|(key, value)| WalWrite {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            };
            if let Err(e) = persistence.log(&entry) {
                self.txn_manager.rollback(txn_id)?;
                return Err(e);
            }
        }

        let write_count = writes.len();
        let checkpoint_input = {
            let mut state = self.state.write()?;
            for (key, value) in writes {
                let was_tombstone = state
                    .entries
                    .get(&key)
                    .is_some_and(|versioned| versioned.value.is_none());
                let is_tombstone = value.is_none();
                state
                    .entries
                    .insert(key, VersionedValue { value, commit_ts });
                match (was_tombstone, is_tombstone) {
                    (false, true) => state.tombstones += 1,
                    (true, false) => state.tombstones -= 1,
                    _ => {}
                }
            }
            state.last_commit_ts = commit_ts;
            self.txn_manager.commit(txn_id)?;

            if state.tombstones >= TOMBSTONE_PRUNE_THRESHOLD {
                self.prune_tombstones(&mut state)?;
            }

            match persistence.as_ref() {
                Some(p) if p.needs_checkpoint() => Some(state.live_entries()),
                _ => None,
            }
        };
        debug!(txn = %txn_id, commit_ts, writes = write_count, "Transaction committed");

        if let (Some(entries), Some(persistence)) = (checkpoint_input, persistence.as_mut()) {
            // The commit is already durable in the log.
            if let Err(e) = persistence.checkpoint(entries, commit_ts) {
                warn!(error = %e, "Checkpoint after commit failed");
            }
        }
        Ok(())
    }
}

impl KvBackend for MvccKvBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn begin(&self) -> Result<Box<dyn KvTransaction + '_>> {
        self.check_open()?;
        // Registration happens under the read lock so pruning never races a
        // snapshot that is not yet accounted for.
        let state = self.state.read()?;
        let start_ts = state.last_commit_ts;
        let snapshot = state.entries.clone();
        let id = self.txn_manager.begin(start_ts)?;
        drop(state);

        Ok(Box::new(MvccTransaction {
            backend: self,
            id,
            start_ts,
            snapshot,
            writes: BTreeMap::new(),
            guards: ReadGuards::default(),
            finished: false,
        }))
    }

    fn checkpoint(&self) -> Result<()> {
        let mut persistence = self.commit_lock.lock()?;
        let (entries, last_commit_ts) = {
            let mut state = self.state.write()?;
            self.prune_tombstones(&mut state)?;
            (state.live_entries(), state.last_commit_ts)
        };
        if let Some(persistence) = persistence.as_mut() {
            persistence.checkpoint(entries, last_commit_ts)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let active = self.txn_manager.active_count()?;
        if active > 0 {
            warn!(active, "Closing mvcc backend with active transactions");
        }
        self.checkpoint()?;
        info!("mvcc backend closed");
        Ok(())
    }

    fn transaction_stats(&self) -> TransactionStats {
        self.txn_manager.stats()
    }
}

fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

pub struct MvccTransaction<'a> {
    backend: &'a MvccKvBackend,
    id: TransactionId,
    start_ts: u64,
    snapshot: OrdMap<Vec<u8>, VersionedValue>,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    guards: ReadGuards,
    finished: bool,
}

impl MvccTransaction<'_> {
    fn visible(&self, key: &[u8]) -> Option<&[u8]> {
        match self.writes.get(key) {
            Some(local) => local.as_deref(),
            None => self
                .snapshot
                .get(key)
                .and_then(|versioned| versioned.value.as_deref()),
        }
    }

    fn check_active(&self) -> Result<()> {
        if self.finished {
            return Err(DbError::TransactionState(format!(
                "transaction {} is already finished",
                self.id
            )));
        }
        Ok(())
    }

    fn collect_range(&self, range: &KvRangeScan) -> Vec<KvPair> {
        let Some(bounds) = range.bounds() else {
            return Vec::new();
        };
        let mut merged: BTreeMap<&[u8], &[u8]> = BTreeMap::new();
        for (key, versioned) in self.snapshot.range::<_, [u8]>(bounds) {
            if let Some(value) = &versioned.value {
                merged.insert(key.as_slice(), value.as_slice());
            }
        }
        for (key, local) in self.writes.range::<[u8], _>(bounds) {
            match local {
                Some(value) => {
                    merged.insert(key.as_slice(), value.as_slice());
                }
                None => {
                    merged.remove(key.as_slice());
                }
            }
        }
        merged
            .into_iter()
            .take(range.limit)
            .map(|(key, value)| (key.to_vec(), value.to_vec()))
            .collect()
    }
}

impl KvTransaction for MvccTransaction<'_> {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_active()?;
        Ok(self.visible(key).map(<[u8]>::to_vec))
    }

    fn put(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> Result<()> {
        self.check_active()?;
        if !overwrite && self.visible(key).is_some() {
            return Err(DbError::AlreadyExists(format!(
                "key '{}' already exists",
                display_key(key)
            )));
        }
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.check_active()?;
        if self.visible(key).is_none() {
            return Ok(false);
        }
        self.writes.insert(key.to_vec(), None);
        Ok(true)
    }

    fn scan(&mut self, range: &KvRangeScan) -> Result<Vec<KvPair>> {
        self.check_active()?;
        Ok(self.collect_range(range))
    }

    fn delete_range(&mut self, range: &KvRangeScan) -> Result<usize> {
        self.check_active()?;
        let doomed = self.collect_range(range);
        let removed = doomed.len();
        for (key, _) in doomed {
            self.writes.insert(key, None);
        }
        Ok(removed)
    }

    fn guard_key(&mut self, key: &[u8]) -> Result<()> {
        self.check_active()?;
        self.guards.keys.insert(key.to_vec());
        Ok(())
    }

    fn guard_range(&mut self, range: &KvRangeScan) -> Result<()> {
        self.check_active()?;
        if !self.guards.ranges.contains(range) {
            self.guards.ranges.push(range.clone());
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.check_active()?;
        self.finished = true;
        let writes = std::mem::take(&mut self.writes);
        let guards = std::mem::take(&mut self.guards);
        self.backend
            .commit_writes(self.id, self.start_ts, writes, guards)
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.check_active()?;
        self.finished = true;
        self.writes.clear();
        self.guards = ReadGuards::default();
        self.backend.txn_manager.rollback(self.id)
    }
}

impl Drop for MvccTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            if let Err(e) = self.backend.txn_manager.rollback(self.id) {
                warn!(txn = %self.id, error = %e, "Rollback of dropped transaction failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_your_own_writes() {
        let backend = MvccKvBackend::in_memory();
        let mut txn = backend.begin().unwrap();
        txn.put(b"k", b"v", false).unwrap();
        assert_eq!(txn.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(txn.delete(b"k").unwrap());
        assert_eq!(txn.get(b"k").unwrap(), None);
        txn.commit().unwrap();
        assert_eq!(backend.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_put_without_overwrite_fails_on_existing_key() {
        let backend = MvccKvBackend::in_memory();
        backend.put(b"k", b"v1", false).unwrap();
        let err = backend.put(b"k", b"v2", false).unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists(_)));
        backend.put(b"k", b"v2", true).unwrap();
        assert_eq!(backend.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_snapshot_isolation() {
        let backend = MvccKvBackend::in_memory();
        backend.put(b"k", b"old", true).unwrap();

        let mut reader = backend.begin().unwrap();
        backend.put(b"k", b"new", true).unwrap();
        backend.put(b"other", b"x", true).unwrap();

        assert_eq!(reader.get(b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(reader.get(b"other").unwrap(), None);
        reader.commit().unwrap();
    }

    #[test]
    fn test_write_write_conflict_first_committer_wins() {
        let backend = MvccKvBackend::in_memory();
        let mut t1 = backend.begin().unwrap();
        let mut t2 = backend.begin().unwrap();
        t1.put(b"k", b"t1", true).unwrap();
        t2.put(b"k", b"t2", true).unwrap();
        t2.put(b"unrelated", b"t2", true).unwrap();

        t1.commit().unwrap();
        let err = t2.commit().unwrap_err();
        assert!(matches!(err, DbError::WriteConflict(_)));

        assert_eq!(backend.get(b"k").unwrap(), Some(b"t1".to_vec()));
        assert_eq!(backend.get(b"unrelated").unwrap(), None);
        assert_eq!(backend.transaction_stats().conflicts, 1);
    }

    #[test]
    fn test_disjoint_writes_both_commit() {
        let backend = MvccKvBackend::in_memory();
        let mut t1 = backend.begin().unwrap();
        let mut t2 = backend.begin().unwrap();
        t1.put(b"a", b"1", true).unwrap();
        t2.put(b"b", b"2", true).unwrap();
        t1.commit().unwrap();
        t2.commit().unwrap();
        assert_eq!(backend.key_count().unwrap(), 2);
    }

    #[test]
    fn test_delete_conflicts_with_concurrent_update() {
        let backend = MvccKvBackend::in_memory();
        backend.put(b"k", b"v", true).unwrap();
        let mut deleter = backend.begin().unwrap();
        let mut updater = backend.begin().unwrap();
        assert!(deleter.delete(b"k").unwrap());
        updater.put(b"k", b"v2", true).unwrap();
        deleter.commit().unwrap();
        assert!(matches!(
            updater.commit(),
            Err(DbError::WriteConflict(_))
        ));
        assert_eq!(backend.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_guarded_key_conflicts_with_concurrent_write() {
        let backend = MvccKvBackend::in_memory();
        backend.put(b"parent", b"live", true).unwrap();

        let mut child = backend.begin().unwrap();
        child.guard_key(b"parent").unwrap();
        child.put(b"parent/child", b"x", false).unwrap();

        backend.put(b"parent", b"deleted", true).unwrap();
        assert!(matches!(child.commit(), Err(DbError::WriteConflict(_))));
        assert_eq!(backend.get(b"parent/child").unwrap(), None);
    }

    #[test]
    fn test_guards_do_not_conflict_with_each_other() {
        let backend = MvccKvBackend::in_memory();
        backend.put(b"parent", b"live", true).unwrap();

        let mut t1 = backend.begin().unwrap();
        let mut t2 = backend.begin().unwrap();
        t1.guard_key(b"parent").unwrap();
        t2.guard_key(b"parent").unwrap();
        t1.put(b"parent/a", b"1", false).unwrap();
        t2.put(b"parent/b", b"2", false).unwrap();
        t1.commit().unwrap();
        t2.commit().unwrap();
        assert_eq!(backend.key_count().unwrap(), 3);
    }

    #[test]
    fn test_guarded_range_sees_new_keys() {
        let backend = MvccKvBackend::in_memory();
        let mut reader = backend.begin().unwrap();
        let range = KvRangeScan::prefix(b"p/");
        assert!(reader.scan(&range).unwrap().is_empty());
        reader.guard_range(&range).unwrap();
        reader.put(b"p", b"gone", true).unwrap();

        backend.put(b"p/1", b"new", false).unwrap();
        assert!(matches!(reader.commit(), Err(DbError::WriteConflict(_))));

        // keys outside the range do not count
        let mut reader = backend.begin().unwrap();
        reader.guard_range(&range).unwrap();
        reader.put(b"p", b"gone", true).unwrap();
        backend.put(b"q/1", b"other", false).unwrap();
        reader.commit().unwrap();
    }

    #[test]
    fn test_rollback_and_drop_discard_writes() {
        let backend = MvccKvBackend::in_memory();
        let mut txn = backend.begin().unwrap();
        txn.put(b"a", b"1", true).unwrap();
        txn.rollback().unwrap();

        {
            let mut txn = backend.begin().unwrap();
            txn.put(b"b", b"1", true).unwrap();
        }

        assert_eq!(backend.get(b"a").unwrap(), None);
        assert_eq!(backend.get(b"b").unwrap(), None);
        assert_eq!(backend.active_transactions().unwrap(), 0);
        assert_eq!(backend.transaction_stats().aborted, 2);
    }

    #[test]
    fn test_scan_merges_local_writes() {
        let backend = MvccKvBackend::in_memory();
        backend.put(b"p/1", b"a", true).unwrap();
        backend.put(b"p/2", b"b", true).unwrap();
        backend.put(b"q/1", b"c", true).unwrap();

        let mut txn = backend.begin().unwrap();
        txn.delete(b"p/1").unwrap();
        txn.put(b"p/3", b"d", true).unwrap();
        let pairs = txn.scan(&KvRangeScan::prefix(b"p/")).unwrap();
        assert_eq!(
            pairs,
            vec![
                (b"p/2".to_vec(), b"b".to_vec()),
                (b"p/3".to_vec(), b"d".to_vec())
            ]
        );
        let limited = txn.scan(&KvRangeScan::prefix(b"p/").limit(1)).unwrap();
        assert_eq!(limited.len(), 1);
        txn.commit().unwrap();
    }

    #[test]
    fn test_delete_range() {
        let backend = MvccKvBackend::in_memory();
        for key in [b"r/1", b"r/2", b"r/3", b"s/1"] {
            backend.put(key, b"v", true).unwrap();
        }
        let removed = backend
            .delete_range(&KvRangeScan::new(b"r/1".to_vec(), b"r/3".to_vec()))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(backend.get(b"r/3").unwrap(), Some(b"v".to_vec()));
        assert_eq!(backend.key_count().unwrap(), 2);
    }

    #[test]
    fn test_checkpoint_prunes_tombstones() {
        let backend = MvccKvBackend::in_memory();
        backend.put(b"k", b"v", true).unwrap();
        backend.delete(b"k").unwrap();
        assert_eq!(backend.tombstone_count().unwrap(), 1);
        backend.checkpoint().unwrap();
        assert_eq!(backend.tombstone_count().unwrap(), 0);
        assert_eq!(backend.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_tombstone_kept_while_older_snapshot_is_active() {
        let backend = MvccKvBackend::in_memory();
        backend.put(b"k", b"v", true).unwrap();
        let mut old = backend.begin().unwrap();
        backend.delete(b"k").unwrap();
        backend.checkpoint().unwrap();
        assert_eq!(backend.tombstone_count().unwrap(), 1);

        old.put(b"k", b"resurrect", true).unwrap();
        assert!(matches!(old.commit(), Err(DbError::WriteConflict(_))));
    }

    #[test]
    fn test_state_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let backend =
                MvccKvBackend::open(Some(temp_dir.path()), DurabilityMode::Sync, 1000).unwrap();
            assert!(backend.is_persistent().unwrap());
            backend.put(b"a", b"1", true).unwrap();
            backend.put(b"b", b"2", true).unwrap();
            backend.delete(b"a").unwrap();
        }

        let backend =
            MvccKvBackend::open(Some(temp_dir.path()), DurabilityMode::Sync, 1000).unwrap();
        assert_eq!(backend.get(b"a").unwrap(), None);
        assert_eq!(backend.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(backend.last_commit_ts().unwrap(), 3);
    }

    #[test]
    fn test_closed_backend_rejects_transactions() {
        let backend = MvccKvBackend::in_memory();
        backend.close().unwrap();
        assert!(matches!(backend.begin(), Err(DbError::Backend(_))));
        // second close is a no-op
        backend.close().unwrap();
    }
}
