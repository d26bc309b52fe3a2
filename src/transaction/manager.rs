// ============================================================================
// Transaction Manager
// ============================================================================

use super::{Transaction, TransactionId, TransactionState};
use crate::core::{DbError, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks live transactions of one backend instance.
///
/// Owns the id counter, so two backends in one process never share
/// transaction ids or state.
pub struct TransactionManager {
    next_id: AtomicU64,

    // Stores full transaction state of active transactions.
    transactions: RwLock<HashMap<TransactionId, Transaction>>,

    committed: AtomicU64,
    aborted: AtomicU64,
    conflicts: AtomicU64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            transactions: RwLock::new(HashMap::new()),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        }
    }

    /// Registers a new active transaction reading at `start_ts`.
    pub fn begin(&self, start_ts: u64) -> Result<TransactionId> {
        let transaction_id = TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let transaction = Transaction::new(transaction_id, start_ts);

        let mut transactions = self.transactions.write()?;
        transactions.insert(transaction_id, transaction);

        Ok(transaction_id)
    }

    pub fn commit(&self, txn_id: TransactionId) -> Result<()> {
        let mut transactions = self.transactions.write()?;
        let transaction = transactions
            .get_mut(&txn_id)
            .ok_or_else(|| DbError::TransactionState(format!("Transaction {} not found", txn_id)))?;

        transaction.commit()?;
        transactions.remove(&txn_id);
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn rollback(&self, txn_id: TransactionId) -> Result<()> {
        let mut transactions = self.transactions.write()?;

        if let Some(transaction) = transactions.get_mut(&txn_id) {
            transaction.rollback()?;
            transactions.remove(&txn_id);
            self.aborted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Aborts a transaction that lost a write-write race.
    pub fn abort_conflicted(&self, txn_id: TransactionId) -> Result<()> {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        self.rollback(txn_id)
    }

    pub fn is_active(&self, txn_id: TransactionId) -> Result<bool> {
        let transactions = self.transactions.read()?;
        Ok(transactions
            .get(&txn_id)
            .map(|txn| txn.state().is_active())
            .unwrap_or(false))
    }

    /// Smallest start timestamp among active transactions.
    pub fn oldest_active_start_ts(&self) -> Result<Option<u64>> {
        let transactions = self.transactions.read()?;
        Ok(transactions.values().map(Transaction::start_ts).min())
    }

    pub fn active_count(&self) -> Result<usize> {
        Ok(self.transactions.read()?.len())
    }

    pub fn get_transaction_info(&self, txn_id: TransactionId) -> Result<Option<TransactionInfo>> {
        let transactions = self.transactions.read()?;
        Ok(transactions.get(&txn_id).map(|txn| TransactionInfo {
            id: txn.id(),
            state: txn.state(),
            start_ts: txn.start_ts(),
            duration: txn.duration(),
        }))
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

pub struct TransactionInfo {
    pub id: TransactionId,
    pub state: TransactionState,
    pub start_ts: u64,
    pub duration: std::time::Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub committed: u64,
    pub aborted: u64,
    pub conflicts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_registers_active_transaction() {
        let tm = TransactionManager::new();
        let txn = tm.begin(0).unwrap();
        assert!(tm.is_active(txn).unwrap());
        let info = tm.get_transaction_info(txn).unwrap().unwrap();
        assert_eq!(info.state, TransactionState::Active);
    }

    #[test]
    fn test_ids_are_unique_per_manager() {
        let tm = TransactionManager::new();
        let tx1 = tm.begin(0).unwrap();
        let tx2 = tm.begin(0).unwrap();
        assert_ne!(tx1, tx2);
        assert!(tx2 > tx1);
    }

    #[test]
    fn test_commit_and_rollback_remove_transaction() {
        let tm = TransactionManager::new();
        let tx1 = tm.begin(1).unwrap();
        let tx2 = tm.begin(2).unwrap();

        tm.commit(tx1).unwrap();
        tm.rollback(tx2).unwrap();

        assert!(!tm.is_active(tx1).unwrap());
        assert!(!tm.is_active(tx2).unwrap());
        assert_eq!(tm.active_count().unwrap(), 0);
        let stats = tm.stats();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.aborted, 1);
    }

    #[test]
    fn test_commit_unknown_transaction_fails() {
        let tm = TransactionManager::new();
        assert!(tm.commit(TransactionId(42)).is_err());
        // rollback of an unknown transaction is a no-op
        assert!(tm.rollback(TransactionId(42)).is_ok());
    }

    #[test]
    fn test_oldest_active_start_ts() {
        let tm = TransactionManager::new();
        assert_eq!(tm.oldest_active_start_ts().unwrap(), None);
        let tx1 = tm.begin(4).unwrap();
        let _tx2 = tm.begin(9).unwrap();
        assert_eq!(tm.oldest_active_start_ts().unwrap(), Some(4));
        tm.abort_conflicted(tx1).unwrap();
        assert_eq!(tm.oldest_active_start_ts().unwrap(), Some(9));
        assert_eq!(tm.stats().conflicts, 1);
    }
}
