pub mod concurrency;

// Public exports
pub use concurrency::{
    AbortReason, IsolationLevel, LockManager, Transaction, TransactionAbort, TransactionManager,
    TransactionState,
};
