use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use burrowdb::common::types::Rid;
use burrowdb::transaction::concurrency::{
    AbortReason, IsolationLevel, LockManager, TransactionManager, TransactionState,
};

fn setup() -> (Arc<LockManager>, TransactionManager) {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = TransactionManager::new(Arc::clone(&lock_manager));
    (lock_manager, txn_manager)
}

#[test]
fn test_shared_locks_do_not_conflict() {
    let (lock_manager, txn_manager) = setup();
    let rid = Rid::new(0, 0);

    let txn_a = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn_b = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_shared(&txn_a, rid).unwrap());
    assert!(lock_manager.lock_shared(&txn_b, rid).unwrap());

    assert!(lock_manager.unlock(&txn_a, rid));
    assert!(lock_manager.unlock(&txn_b, rid));
    txn_manager.commit(&txn_a);
    txn_manager.commit(&txn_b);
}

#[test]
fn test_many_threads_shared_locking() {
    let (lock_manager, txn_manager) = setup();
    let txn_manager = Arc::new(txn_manager);

    let rids: Vec<Rid> = (0..10).map(|i| Rid::new(i, i as u32)).collect();
    let mut handles = Vec::new();

    for _ in 0..10 {
        let lock_manager = Arc::clone(&lock_manager);
        let txn_manager = Arc::clone(&txn_manager);
        let rids = rids.clone();
        handles.push(thread::spawn(move || {
            let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
            for &rid in &rids {
                assert!(lock_manager.lock_shared(&txn, rid).unwrap());
                assert_eq!(txn.state(), TransactionState::Growing);
            }
            assert_eq!(txn.shared_lock_set().lock().len(), rids.len());
            for &rid in &rids {
                assert!(lock_manager.unlock(&txn, rid));
                assert_eq!(txn.state(), TransactionState::Shrinking);
            }
            txn_manager.commit(&txn);
            assert_eq!(txn.state(), TransactionState::Committed);
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

// Strict two-phase locking: the first unlock ends the growing phase and
// any later lock attempt aborts the transaction.
#[test]
fn test_two_phase_locking() {
    let (lock_manager, txn_manager) = setup();
    let rid0 = Rid::new(0, 0);
    let rid1 = Rid::new(0, 1);

    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    assert_eq!(txn.id(), 0);

    assert!(lock_manager.lock_shared(&txn, rid0).unwrap());
    assert_eq!(txn.state(), TransactionState::Growing);
    assert_eq!(txn.shared_lock_set().lock().len(), 1);

    assert!(lock_manager.lock_exclusive(&txn, rid1).unwrap());
    assert_eq!(txn.state(), TransactionState::Growing);
    assert_eq!(txn.exclusive_lock_set().lock().len(), 1);

    assert!(lock_manager.unlock(&txn, rid0));
    assert_eq!(txn.state(), TransactionState::Shrinking);
    assert_eq!(txn.shared_lock_set().lock().len(), 0);

    let err = lock_manager.lock_shared(&txn, rid0).unwrap_err();
    assert_eq!(err.reason, AbortReason::LockOnShrinking);
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert_eq!(txn.shared_lock_set().lock().len(), 0);
    assert_eq!(txn.exclusive_lock_set().lock().len(), 1);

    txn_manager.abort(&txn);
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert!(txn.shared_lock_set().lock().is_empty());
    assert!(txn.exclusive_lock_set().lock().is_empty());
}

#[test]
fn test_shared_lock_forbidden_on_read_uncommitted() {
    let (lock_manager, txn_manager) = setup();
    let rid = Rid::new(0, 0);

    let txn = txn_manager.begin(IsolationLevel::ReadUncommitted);
    let err = lock_manager.lock_shared(&txn, rid).unwrap_err();
    assert_eq!(err.reason, AbortReason::LockSharedOnReadUncommitted);
    assert_eq!(txn.state(), TransactionState::Aborted);
    txn_manager.abort(&txn);
}

// Releasing a shared lock under READ_COMMITTED keeps the growing phase
// open; only an exclusive release starts shrinking.
#[test]
fn test_read_committed_shared_unlock_keeps_growing() {
    let (lock_manager, txn_manager) = setup();
    let rid0 = Rid::new(0, 0);
    let rid1 = Rid::new(0, 1);

    let txn = txn_manager.begin(IsolationLevel::ReadCommitted);

    assert!(lock_manager.lock_shared(&txn, rid0).unwrap());
    assert!(lock_manager.unlock(&txn, rid0));
    assert_eq!(txn.state(), TransactionState::Growing);

    // still allowed to grow
    assert!(lock_manager.lock_exclusive(&txn, rid1).unwrap());
    assert!(lock_manager.unlock(&txn, rid1));
    assert_eq!(txn.state(), TransactionState::Shrinking);

    txn_manager.commit(&txn);
}

// An older transaction wanting an exclusive lock wounds the younger
// holder instead of waiting for it.
#[test]
fn test_wound_wait() {
    let (lock_manager, txn_manager) = setup();
    let txn_manager = Arc::new(txn_manager);
    let rid = Rid::new(0, 0);

    let txn_old = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn_young = txn_manager.begin(IsolationLevel::RepeatableRead);
    assert_eq!(txn_old.id(), 0);
    assert_eq!(txn_young.id(), 1);

    let (locked_tx, locked_rx) = mpsc::channel();

    let young_thread = {
        let lock_manager = Arc::clone(&lock_manager);
        let txn_manager = Arc::clone(&txn_manager);
        let txn_young = Arc::clone(&txn_young);
        thread::spawn(move || {
            // younger transaction takes the lock first
            assert!(lock_manager.lock_exclusive(&txn_young, rid).unwrap());
            assert_eq!(txn_young.exclusive_lock_set().lock().len(), 1);
            locked_tx.send(()).unwrap();

            // the older transaction's request should wound us
            thread::sleep(Duration::from_millis(300));
            assert_eq!(txn_young.state(), TransactionState::Aborted);
            txn_manager.abort(&txn_young);
        })
    };

    locked_rx.recv().unwrap();

    // wounds txn_young and acquires the lock without deadlocking
    assert!(lock_manager.lock_exclusive(&txn_old, rid).unwrap());
    young_thread.join().unwrap();

    assert_eq!(txn_old.state(), TransactionState::Growing);
    txn_manager.commit(&txn_old);
    assert_eq!(txn_old.state(), TransactionState::Committed);
}

// A younger transaction requesting against an older holder waits
// instead of wounding.
#[test]
fn test_younger_waits_for_older() {
    let (lock_manager, txn_manager) = setup();
    let txn_manager = Arc::new(txn_manager);
    let rid = Rid::new(0, 0);

    let txn_old = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn_young = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_exclusive(&txn_old, rid).unwrap());

    let young_thread = {
        let lock_manager = Arc::clone(&lock_manager);
        let txn_manager = Arc::clone(&txn_manager);
        let txn_young = Arc::clone(&txn_young);
        thread::spawn(move || {
            // blocks until the older transaction releases
            assert!(lock_manager.lock_exclusive(&txn_young, rid).unwrap());
            assert_eq!(txn_young.state(), TransactionState::Growing);
            txn_manager.commit(&txn_young);
        })
    };

    thread::sleep(Duration::from_millis(200));
    assert_eq!(txn_young.state(), TransactionState::Growing);

    txn_manager.commit(&txn_old);
    young_thread.join().unwrap();
    assert_eq!(txn_young.state(), TransactionState::Committed);
}

#[test]
fn test_lock_upgrade() {
    let (lock_manager, txn_manager) = setup();
    let rid = Rid::new(0, 0);

    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_shared(&txn, rid).unwrap());
    assert_eq!(txn.shared_lock_set().lock().len(), 1);

    assert!(lock_manager.lock_upgrade(&txn, rid).unwrap());
    assert_eq!(txn.shared_lock_set().lock().len(), 0);
    assert_eq!(txn.exclusive_lock_set().lock().len(), 1);
    assert_eq!(txn.state(), TransactionState::Growing);

    assert!(lock_manager.unlock(&txn, rid));
    assert_eq!(txn.state(), TransactionState::Shrinking);

    txn_manager.commit(&txn);
    assert_eq!(txn.state(), TransactionState::Committed);
}

#[test]
fn test_upgrade_returns_false_on_read_uncommitted() {
    let (lock_manager, txn_manager) = setup();
    let rid = Rid::new(0, 0);

    let txn = txn_manager.begin(IsolationLevel::ReadUncommitted);
    assert!(!lock_manager.lock_upgrade(&txn, rid).unwrap());
    assert_eq!(txn.state(), TransactionState::Growing);
    txn_manager.commit(&txn);
}

// Only one upgrade may be in flight per row; the second upgrader
// aborts with UPGRADE_CONFLICT.
#[test]
fn test_upgrade_conflict() {
    let (lock_manager, txn_manager) = setup();
    let txn_manager = Arc::new(txn_manager);
    let rid = Rid::new(0, 0);

    let txn_old = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn_young = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_shared(&txn_old, rid).unwrap());
    assert!(lock_manager.lock_shared(&txn_young, rid).unwrap());

    let young_thread = {
        let lock_manager = Arc::clone(&lock_manager);
        let txn_manager = Arc::clone(&txn_manager);
        let txn_young = Arc::clone(&txn_young);
        thread::spawn(move || {
            // waits behind the older shared holder
            assert!(lock_manager.lock_upgrade(&txn_young, rid).unwrap());
            assert_eq!(txn_young.exclusive_lock_set().lock().len(), 1);
            txn_manager.commit(&txn_young);
        })
    };

    // let the younger upgrade claim the row's upgrade slot
    thread::sleep(Duration::from_millis(200));

    let err = lock_manager.lock_upgrade(&txn_old, rid).unwrap_err();
    assert_eq!(err.reason, AbortReason::UpgradeConflict);
    assert_eq!(txn_old.state(), TransactionState::Aborted);

    // aborting the older holder releases its shared lock and unblocks
    // the younger upgrader
    txn_manager.abort(&txn_old);
    young_thread.join().unwrap();
    assert_eq!(txn_young.state(), TransactionState::Committed);
}
