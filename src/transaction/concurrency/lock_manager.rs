use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use log::debug;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Why a lock call aborted its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Deadlock,
    LockSharedOnReadUncommitted,
    LockOnShrinking,
    UpgradeConflict,
}

/// Returned by lock calls that abort their transaction. The state has
/// already been set to `Aborted` when this value is constructed, so the
/// caller only has to unwind.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason:?}")]
pub struct TransactionAbort {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    granted: bool,
}

impl LockRequest {
    fn new(txn: Arc<Transaction>, mode: LockMode) -> Self {
        Self {
            txn,
            mode,
            granted: false,
        }
    }
}

#[derive(Default)]
struct RequestQueue {
    queue: VecDeque<LockRequest>,
    /// Transaction currently performing an S -> X upgrade on this row,
    /// if any. At most one upgrade may be in flight per row.
    upgrading: Option<TxnId>,
}

struct RowLock {
    requests: Mutex<RequestQueue>,
    cv: Condvar,
}

impl RowLock {
    fn new() -> Self {
        Self {
            requests: Mutex::new(RequestQueue::default()),
            cv: Condvar::new(),
        }
    }
}

/// Row-level lock manager implementing strict two-phase locking with
/// wound-wait deadlock prevention.
///
/// Each locked row carries a FIFO queue of requests guarded by its own
/// mutex, with a condition variable for grant/abort wakeups. A request
/// waits behind every conflicting request from an older transaction and
/// wounds (aborts and dequeues) every conflicting request from a
/// younger one, so a cycle of waiters can never form.
pub struct LockManager {
    latch: Mutex<HashMap<Rid, Arc<RowLock>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            latch: Mutex::new(HashMap::new()),
        }
    }

    fn row_lock(&self, rid: Rid) -> Arc<RowLock> {
        self.latch
            .lock()
            .entry(rid)
            .or_insert_with(|| Arc::new(RowLock::new()))
            .clone()
    }

    fn abort(txn: &Transaction, reason: AbortReason) -> TransactionAbort {
        txn.set_state(TransactionState::Aborted);
        TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }

    /// Acquire a shared lock on `rid`.
    pub fn lock_shared(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionAbort> {
        if txn.is_exclusive_locked(&rid) || txn.is_shared_locked(&rid) {
            return Ok(true);
        }
        if txn.state() == TransactionState::Aborted {
            return Err(TransactionAbort {
                txn_id: txn.id(),
                reason: AbortReason::Deadlock,
            });
        }
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                return Err(Self::abort(txn, AbortReason::LockSharedOnReadUncommitted));
            }
            IsolationLevel::RepeatableRead if txn.state() == TransactionState::Shrinking => {
                return Err(Self::abort(txn, AbortReason::LockOnShrinking));
            }
            _ => {}
        }

        let row = self.row_lock(rid);
        let mut queue = row.requests.lock();
        queue
            .queue
            .push_back(LockRequest::new(Arc::clone(txn), LockMode::Shared));

        Self::wound_shared(&mut queue, txn.id(), &row.cv);
        row.cv.notify_all();

        loop {
            if txn.state() == TransactionState::Aborted {
                return Err(TransactionAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
            if Self::shared_grantable(&queue, txn.id()) {
                break;
            }
            row.cv.wait(&mut queue);
        }

        if let Some(request) = queue
            .queue
            .iter_mut()
            .find(|r| r.txn.id() == txn.id() && r.mode == LockMode::Shared && !r.granted)
        {
            request.granted = true;
        }
        txn.shared_lock_set().lock().insert(rid);
        Ok(true)
    }

    /// Acquire an exclusive lock on `rid`.
    pub fn lock_exclusive(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionAbort> {
        if txn.is_exclusive_locked(&rid) {
            return Ok(true);
        }
        if txn.state() == TransactionState::Aborted {
            return Err(TransactionAbort {
                txn_id: txn.id(),
                reason: AbortReason::Deadlock,
            });
        }
        if txn.state() == TransactionState::Shrinking {
            return Err(Self::abort(txn, AbortReason::LockOnShrinking));
        }

        let row = self.row_lock(rid);
        let mut queue = row.requests.lock();
        queue
            .queue
            .push_back(LockRequest::new(Arc::clone(txn), LockMode::Exclusive));

        Self::wound_exclusive(&mut queue, txn.id(), &row.cv);
        row.cv.notify_all();

        loop {
            if txn.state() == TransactionState::Aborted {
                return Err(TransactionAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
            if Self::exclusive_grantable(&queue, txn.id()) {
                break;
            }
            row.cv.wait(&mut queue);
        }

        if let Some(front) = queue.queue.front_mut() {
            front.granted = true;
        }
        txn.exclusive_lock_set().lock().insert(rid);
        Ok(true)
    }

    /// Upgrade a held shared lock to exclusive. Returns Ok(false) under
    /// READ_UNCOMMITTED, where no shared lock can exist to upgrade.
    pub fn lock_upgrade(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionAbort> {
        if txn.is_exclusive_locked(&rid) {
            return Ok(true);
        }
        if txn.state() == TransactionState::Aborted {
            return Err(TransactionAbort {
                txn_id: txn.id(),
                reason: AbortReason::Deadlock,
            });
        }
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            return Ok(false);
        }
        if txn.state() == TransactionState::Shrinking {
            return Err(Self::abort(txn, AbortReason::LockOnShrinking));
        }

        let row = self.row_lock(rid);
        let mut queue = row.requests.lock();

        if queue.upgrading.is_some() {
            return Err(Self::abort(txn, AbortReason::UpgradeConflict));
        }
        queue.upgrading = Some(txn.id());

        // Trade the shared request for an exclusive one placed ahead of
        // every other writer.
        if let Some(pos) = queue.queue.iter().position(|r| r.txn.id() == txn.id()) {
            queue.queue.remove(pos);
        }
        let request = LockRequest::new(Arc::clone(txn), LockMode::Exclusive);
        match queue.queue.iter().position(|r| r.mode == LockMode::Exclusive) {
            Some(pos) => queue.queue.insert(pos, request),
            None => queue.queue.push_back(request),
        }

        Self::wound_exclusive(&mut queue, txn.id(), &row.cv);
        row.cv.notify_all();

        loop {
            if txn.state() == TransactionState::Aborted {
                queue.upgrading = None;
                return Err(TransactionAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
            if Self::exclusive_grantable(&queue, txn.id()) {
                break;
            }
            row.cv.wait(&mut queue);
        }
        queue.upgrading = None;

        if let Some(front) = queue.queue.front_mut() {
            front.granted = true;
        }
        txn.shared_lock_set().lock().remove(&rid);
        txn.exclusive_lock_set().lock().insert(rid);
        Ok(true)
    }

    /// Release the lock held by `txn` on `rid`. Always succeeds; an
    /// aborted transaction releases without further state changes.
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let row = match self.latch.lock().get(&rid) {
            Some(row) => Arc::clone(row),
            None => return true,
        };

        let mut queue = row.requests.lock();
        if let Some(pos) = queue.queue.iter().position(|r| r.txn.id() == txn.id()) {
            let mode = queue.queue[pos].mode;
            queue.queue.remove(pos);

            // First unlock flips growing to shrinking. Under READ_COMMITTED
            // only an exclusive release does; shared locks there are
            // short-duration by design of the level.
            let transitions = match txn.isolation_level() {
                IsolationLevel::RepeatableRead | IsolationLevel::ReadUncommitted => true,
                IsolationLevel::ReadCommitted => mode == LockMode::Exclusive,
            };
            if transitions && txn.state() == TransactionState::Growing {
                txn.set_state(TransactionState::Shrinking);
            }

            match mode {
                LockMode::Shared => {
                    txn.shared_lock_set().lock().remove(&rid);
                }
                LockMode::Exclusive => {
                    txn.exclusive_lock_set().lock().remove(&rid);
                }
            }
        }

        row.cv.notify_all();
        true
    }

    /// Wound phase for a shared request: abort and dequeue every younger
    /// writer queued ahead of our request. An older writer ahead means
    /// we wait.
    fn wound_shared(queue: &mut RequestQueue, me: TxnId, cv: &Condvar) {
        let mut i = 0;
        while i < queue.queue.len() {
            let request = &queue.queue[i];
            if request.txn.id() == me && request.mode == LockMode::Shared && !request.granted {
                break;
            }
            if request.mode == LockMode::Exclusive && request.txn.id() > me {
                debug!("txn {} wounds txn {}", me, request.txn.id());
                request.txn.set_state(TransactionState::Aborted);
                queue.queue.remove(i);
                cv.notify_all();
            } else {
                i += 1;
            }
        }
    }

    /// Wound phase for an exclusive request: abort and dequeue every
    /// younger transaction queued ahead of our request, whatever its
    /// mode.
    fn wound_exclusive(queue: &mut RequestQueue, me: TxnId, cv: &Condvar) {
        let mut i = 0;
        while i < queue.queue.len() {
            let request = &queue.queue[i];
            if request.txn.id() == me && request.mode == LockMode::Exclusive && !request.granted {
                break;
            }
            if request.txn.id() > me {
                debug!("txn {} wounds txn {}", me, request.txn.id());
                request.txn.set_state(TransactionState::Aborted);
                queue.queue.remove(i);
                cv.notify_all();
            } else {
                i += 1;
            }
        }
    }

    /// A shared request is grantable when no exclusive request sits
    /// ahead of it in the queue.
    fn shared_grantable(queue: &RequestQueue, me: TxnId) -> bool {
        for request in &queue.queue {
            if request.txn.id() == me && request.mode == LockMode::Shared && !request.granted {
                return true;
            }
            if request.mode == LockMode::Exclusive {
                return false;
            }
        }
        false
    }

    /// An exclusive request is grantable only at the head of the queue.
    fn exclusive_grantable(queue: &RequestQueue, me: TxnId) -> bool {
        match queue.queue.front() {
            Some(request) => {
                request.txn.id() == me && request.mode == LockMode::Exclusive && !request.granted
            }
            None => false,
        }
    }
}
