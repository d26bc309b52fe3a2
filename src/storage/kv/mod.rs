//! Ordered byte-key / byte-value backend used by every storage service.
//!
//! A backend hands out snapshot-isolated transactions. The single-operation
//! helpers on [`KvBackend`] each run in a transaction of their own.

pub mod mvcc;

pub use mvcc::MvccKvBackend;

use crate::core::Result;
use crate::transaction::TransactionId;
use crate::transaction::manager::TransactionStats;
use std::ops::Bound;

pub type KvPair = (Vec<u8>, Vec<u8>);

/// Smallest key greater than every key starting with `prefix`.
///
/// `None` when the prefix is all `0xFF` (or empty) and therefore has no
/// finite successor.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    for i in (0..next.len()).rev() {
        if next[i] != 0xFF {
            next[i] += 1;
            next.truncate(i + 1);
            return Some(next);
        }
    }
    None
}

/// Key range of a scan or range delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRangeScan {
    pub start: Vec<u8>,
    /// Exclusive upper bound unless `end_inclusive`; `None` is unbounded.
    pub end: Option<Vec<u8>>,
    pub start_inclusive: bool,
    pub end_inclusive: bool,
    pub limit: usize,
}

impl KvRangeScan {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: Some(end.into()),
            start_inclusive: true,
            end_inclusive: false,
            limit: usize::MAX,
        }
    }

    /// All keys starting with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            start: prefix.to_vec(),
            end: prefix_successor(prefix),
            start_inclusive: true,
            end_inclusive: false,
            limit: usize::MAX,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn start_inclusive(mut self, inclusive: bool) -> Self {
        self.start_inclusive = inclusive;
        self
    }

    pub fn end_inclusive(mut self, inclusive: bool) -> Self {
        self.end_inclusive = inclusive;
        self
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = if self.start_inclusive {
            key >= self.start.as_slice()
        } else {
            key > self.start.as_slice()
        };
        let before_end = match &self.end {
            None => true,
            Some(end) if self.end_inclusive => key <= end.as_slice(),
            Some(end) => key < end.as_slice(),
        };
        after_start && before_end
    }

    /// Bounds for ordered-map range queries; `None` when the range is empty.
    pub(crate) fn bounds(&self) -> Option<(Bound<&[u8]>, Bound<&[u8]>)> {
        if let Some(end) = &self.end {
            let empty = match self.start.as_slice().cmp(end.as_slice()) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => !(self.start_inclusive && self.end_inclusive),
                std::cmp::Ordering::Less => false,
            };
            if empty {
                return None;
            }
        }
        let start = if self.start_inclusive {
            Bound::Included(self.start.as_slice())
        } else {
            Bound::Excluded(self.start.as_slice())
        };
        let end = match &self.end {
            None => Bound::Unbounded,
            Some(end) if self.end_inclusive => Bound::Included(end.as_slice()),
            Some(end) => Bound::Excluded(end.as_slice()),
        };
        Some((start, end))
    }
}

/// One unit of atomic work against a backend.
///
/// Dropping a transaction that was neither committed nor rolled back rolls
/// it back.
pub trait KvTransaction: Send {
    fn id(&self) -> TransactionId;

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Fails with `AlreadyExists` when `overwrite` is false and a value is
    /// visible for `key`.
    fn put(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> Result<()>;

    /// Returns whether a value was visible for `key`.
    fn delete(&mut self, key: &[u8]) -> Result<bool>;

    fn scan(&mut self, range: &KvRangeScan) -> Result<Vec<KvPair>>;

    /// Returns the number of keys removed.
    fn delete_range(&mut self, range: &KvRangeScan) -> Result<usize>;

    /// Commit fails with `WriteConflict` if another transaction committed
    /// `key` after this transaction's snapshot, even though it was only read.
    fn guard_key(&mut self, key: &[u8]) -> Result<()>;

    /// Same as [`guard_key`](Self::guard_key) for every key in `range`,
    /// including keys that did not exist when the snapshot was taken.
    fn guard_range(&mut self, range: &KvRangeScan) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

pub trait KvBackend: Send + Sync {
    /// Backend label used in logs and configuration.
    fn name(&self) -> &'static str;

    fn begin(&self) -> Result<Box<dyn KvTransaction + '_>>;

    /// Persists a full snapshot and truncates the log, if the backend keeps
    /// one.
    fn checkpoint(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn transaction_stats(&self) -> TransactionStats;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut txn = self.begin()?;
        let value = txn.get(key)?;
        txn.commit()?;
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<()> {
        let mut txn = self.begin()?;
        txn.put(key, value, overwrite)?;
        txn.commit()
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut txn = self.begin()?;
        let deleted = txn.delete(key)?;
        txn.commit()?;
        Ok(deleted)
    }

    fn scan(&self, range: &KvRangeScan) -> Result<Vec<KvPair>> {
        let mut txn = self.begin()?;
        let pairs = txn.scan(range)?;
        txn.commit()?;
        Ok(pairs)
    }

    fn delete_range(&self, range: &KvRangeScan) -> Result<usize> {
        let mut txn = self.begin()?;
        let removed = txn.delete_range(range)?;
        txn.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(&[0x01, 0xFF]), Some(vec![0x02]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_successor(&[]), None);
    }

    #[test]
    fn test_prefix_range_contains() {
        let range = KvRangeScan::prefix(b"ca/");
        assert!(range.contains(b"ca/"));
        assert!(range.contains(b"ca/\x00\x01"));
        assert!(!range.contains(b"ca0"));
        assert!(!range.contains(b"ml/"));
    }

    #[test]
    fn test_range_bounds() {
        let range = KvRangeScan::new(b"b".to_vec(), b"d".to_vec())
            .start_inclusive(false)
            .end_inclusive(true);
        assert!(!range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(range.contains(b"d"));
        assert!(!range.contains(b"e"));
    }

    #[test]
    fn test_inverted_range_has_no_bounds() {
        assert!(KvRangeScan::new(b"d".to_vec(), b"b".to_vec()).bounds().is_none());
        assert!(KvRangeScan::new(b"b".to_vec(), b"b".to_vec()).bounds().is_none());
        assert!(
            KvRangeScan::new(b"b".to_vec(), b"b".to_vec())
                .end_inclusive(true)
                .bounds()
                .is_some()
        );
    }
}
