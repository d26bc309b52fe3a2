// ============================================================================
// Transaction Coordinator
// ============================================================================
//
// Runs a unit of work inside one backend transaction:
//
//   Idle ──begin──> Active ──Ok──> Committed
//                     │
//                     └──Err / panic──> RolledBack
//
// The error returned by the work reaches the caller unchanged. A failed
// rollback is logged and never replaces it. Exactly one attempt is made;
// retrying is left to the caller (see `RetryPolicy`).
//
// ============================================================================

use super::TransactionId;
use crate::core::{DbError, Result};
use crate::storage::kv::{KvBackend, KvPair, KvRangeScan, KvTransaction};
use std::sync::Arc;
use tracing::{debug, debug_span, warn};

#[derive(Clone)]
pub struct TransactionCoordinator {
    backend: Arc<dyn KvBackend>,
}

impl TransactionCoordinator {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Begins a transaction, runs `work` in it and commits on `Ok`.
    ///
    /// On `Err` the transaction is rolled back and the error is returned
    /// as is. If `work` panics, the transaction is rolled back while the
    /// panic unwinds.
    pub fn execute_in_transaction<R, E, F>(&self, work: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut TxnScope<'_>) -> std::result::Result<R, E>,
        E: From<DbError>,
    {
        let txn = self.backend.begin()?;
        let txn_id = txn.id();
        let span = debug_span!("transaction", txn = %txn_id, backend = self.backend.name());
        let _enter = span.enter();

        let mut scope = TxnScope { txn };
        match work(&mut scope) {
            Ok(value) => {
                scope.txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                match scope.txn.rollback() {
                    Ok(()) => debug!(txn = %txn_id, "Transaction rolled back"),
                    Err(rollback_err) => {
                        warn!(txn = %txn_id, error = %rollback_err, "Rollback failed")
                    }
                }
                Err(err)
            }
        }
    }
}

/// The active transaction handed to a unit of work.
pub struct TxnScope<'a> {
    txn: Box<dyn KvTransaction + 'a>,
}

impl<'a> TxnScope<'a> {
    pub fn id(&self) -> TransactionId {
        self.txn.id()
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.txn.get(key)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> Result<()> {
        self.txn.put(key, value, overwrite)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.txn.delete(key)
    }

    pub fn scan(&mut self, range: &KvRangeScan) -> Result<Vec<KvPair>> {
        self.txn.scan(range)
    }

    pub fn delete_range(&mut self, range: &KvRangeScan) -> Result<usize> {
        self.txn.delete_range(range)
    }

    pub fn guard_key(&mut self, key: &[u8]) -> Result<()> {
        self.txn.guard_key(key)
    }

    pub fn guard_range(&mut self, range: &KvRangeScan) -> Result<()> {
        self.txn.guard_range(range)
    }

    /// Nested unit of work. Runs in this scope's transaction; its outcome
    /// is decided by the outermost call.
    pub fn execute_in_transaction<R, E, F>(&mut self, work: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut TxnScope<'a>) -> std::result::Result<R, E>,
    {
        work(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MvccKvBackend;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn coordinator() -> TransactionCoordinator {
        TransactionCoordinator::new(Arc::new(MvccKvBackend::in_memory()))
    }

    #[test]
    fn test_commit_on_ok() {
        let coordinator = coordinator();
        let value = coordinator
            .execute_in_transaction(|scope| {
                scope.put(b"a", b"1", false)?;
                scope.put(b"b", b"2", false)?;
                Ok::<_, DbError>(7)
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(coordinator.backend().get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(coordinator.backend().transaction_stats().committed, 1);
    }

    #[test]
    fn test_rollback_returns_original_error() {
        let coordinator = coordinator();
        let err = coordinator
            .execute_in_transaction(|scope| {
                scope.put(b"a", b"1", false)?;
                Err::<(), _>(DbError::InvalidArgument("boom".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(ref msg) if msg == "boom"));
        assert_eq!(coordinator.backend().get(b"a").unwrap(), None);
    }

    #[derive(Debug)]
    enum AppError {
        Db(DbError),
        Rejected,
    }

    impl From<DbError> for AppError {
        fn from(e: DbError) -> Self {
            AppError::Db(e)
        }
    }

    #[test]
    fn test_caller_error_type_passes_through() {
        let coordinator = coordinator();
        let err = coordinator
            .execute_in_transaction(|scope| {
                scope.put(b"a", b"1", false)?;
                Err::<(), _>(AppError::Rejected)
            })
            .unwrap_err();
        assert!(matches!(err, AppError::Rejected));

        let err = coordinator
            .execute_in_transaction(|scope| {
                scope.put(b"k", b"1", false)?;
                scope.put(b"k", b"2", false)?;
                Ok::<_, AppError>(())
            })
            .unwrap_err();
        assert!(matches!(err, AppError::Db(DbError::AlreadyExists(_))));
    }

    #[test]
    fn test_panic_rolls_back() {
        let coordinator = coordinator();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            coordinator.execute_in_transaction(|scope| -> Result<()> {
                scope.put(b"a", b"1", false)?;
                panic!("work failed");
            })
        }));
        assert!(outcome.is_err());
        assert_eq!(coordinator.backend().get(b"a").unwrap(), None);
        assert_eq!(coordinator.backend().transaction_stats().aborted, 1);
    }

    #[test]
    fn test_nested_call_reuses_outer_scope() {
        let coordinator = coordinator();
        let err = coordinator
            .execute_in_transaction(|scope| {
                let outer = scope.id();
                scope.execute_in_transaction(|inner| {
                    assert_eq!(inner.id(), outer);
                    inner.put(b"inner", b"1", false)
                })?;
                assert_eq!(scope.get(b"inner")?, Some(b"1".to_vec()));
                Err::<(), _>(DbError::InvalidArgument("outer failed".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(_)));
        assert_eq!(coordinator.backend().get(b"inner").unwrap(), None);
    }
}
