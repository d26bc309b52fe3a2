// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Snapshot isolation over the key-value backend:
// - `TransactionManager` hands out ids and tracks active snapshots
// - `TransactionCoordinator` runs a unit of work in one transaction
// - `RetryPolicy` retries work that lost an optimistic race
//
// ============================================================================

pub mod coordinator;
pub mod manager;
pub mod retry;
pub mod state;

pub use coordinator::{TransactionCoordinator, TxnScope};
pub use manager::{TransactionManager, TransactionStats};
pub use retry::RetryPolicy;
pub use state::{Transaction, TransactionId, TransactionState};
