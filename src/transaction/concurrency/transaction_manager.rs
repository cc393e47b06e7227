use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

/// Transaction manager - creates and tracks transactions and releases
/// their locks on commit or abort.
pub struct TransactionManager {
    /// Next transaction ID to assign; ids order transactions by age.
    next_txn_id: AtomicU32,

    lock_manager: Arc<LockManager>,

    /// Active transactions map (txn_id -> Transaction)
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(0),
            lock_manager,
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions
            .lock()
            .insert(txn_id, Arc::clone(&txn));
        txn
    }

    /// Commit a transaction, releasing every lock it still holds.
    pub fn commit(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Committed);
        self.release_all_locks(txn);
        self.active_transactions.lock().remove(&txn.id());
    }

    /// Abort a transaction, releasing every lock it still holds.
    pub fn abort(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Aborted);
        self.release_all_locks(txn);
        self.active_transactions.lock().remove(&txn.id());
    }

    /// Get a transaction by ID
    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    /// Get all active transaction IDs
    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_transactions.lock().keys().copied().collect()
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    fn release_all_locks(&self, txn: &Arc<Transaction>) {
        // Snapshot first: unlock edits the sets as it goes. A wounded
        // request may already be gone from its queue, so the sets are
        // cleared explicitly afterwards.
        let shared: Vec<Rid> = txn.shared_lock_set().lock().iter().copied().collect();
        let exclusive: Vec<Rid> = txn.exclusive_lock_set().lock().iter().copied().collect();

        for rid in shared.into_iter().chain(exclusive) {
            self.lock_manager.unlock(txn, rid);
        }

        txn.shared_lock_set().lock().clear();
        txn.exclusive_lock_set().lock().clear();
    }
}
