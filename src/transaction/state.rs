// ============================================================================
// Transaction State Management
// ============================================================================
//
// Each transaction moves through defined states: Active -> Committed/Aborted
//
// Snapshot isolation over the key-value backend:
// - Each transaction reads the committed state as of its start timestamp
// - Writes stay buffered in the transaction until commit
// - Commit fails if another transaction committed one of the same keys after
//   this transaction started
//
// ============================================================================

use crate::core::{DbError, Result};

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Transaction state
///
/// State transitions:
/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can execute operations
    Active,

    /// Transaction has been successfully committed
    Committed,

    /// Transaction has been aborted/rolled back
    Aborted,
}

impl TransactionState {
    /// Check if transaction can execute operations
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    /// Check if transaction is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Bookkeeping record of one transaction held by the `TransactionManager`.
#[derive(Debug)]
pub struct Transaction {
    /// Unique transaction identifier
    id: TransactionId,

    /// Current state (Active, Committed, Aborted)
    state: TransactionState,

    /// Commit timestamp of the state this transaction reads from
    start_ts: u64,

    /// Start time for diagnostics
    start_time: std::time::Instant,
}

impl Transaction {
    pub fn new(id: TransactionId, start_ts: u64) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            start_ts,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Mark transaction as committed
    ///
    /// # Errors
    /// Returns error if transaction is not active
    pub fn commit(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::TransactionState(format!(
                "Cannot commit: transaction {} is already {}",
                self.id, self.state
            )));
        }

        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Mark transaction as aborted
    ///
    /// # Errors
    /// Returns error if transaction is not active
    pub fn rollback(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::TransactionState(format!(
                "Cannot rollback: transaction {} is already {}",
                self.id, self.state
            )));
        }

        self.state = TransactionState::Aborted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_lifecycle() {
        let mut txn = Transaction::new(TransactionId(1), 0);

        assert_eq!(txn.state(), TransactionState::Active);
        assert!(txn.state().is_active());
        assert!(!txn.state().is_terminal());

        txn.commit().unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(txn.state().is_terminal());
    }

    #[test]
    fn test_cannot_commit_twice() {
        let mut txn = Transaction::new(TransactionId(1), 0);

        txn.commit().unwrap();
        assert!(txn.commit().is_err());
    }

    #[test]
    fn test_cannot_rollback_after_commit() {
        let mut txn = Transaction::new(TransactionId(2), 5);

        txn.commit().unwrap();
        assert!(matches!(
            txn.rollback(),
            Err(DbError::TransactionState(_))
        ));
    }

    #[test]
    fn test_rollback_is_terminal() {
        let mut txn = Transaction::new(TransactionId(3), 5);
        txn.rollback().unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(txn.start_ts(), 5);
    }
}
