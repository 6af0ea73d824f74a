//! Tuple-grain lock manager: shared/exclusive locks under two-phase
//! locking, with wait-die deadlock prevention.
//!
//! One mutex guards the table of per-RID wait lists; waiters block on
//! a one-shot channel outside the mutex and are signalled by the
//! unlocker. Wait-die keeps the wait-for graph acyclic: a requester
//! younger than the oldest granted-or-waiting transaction on the
//! entry aborts instead of waiting.

use crate::transaction::{Transaction, TransactionState};
use log::debug;
use marrow_common::{Rid, TxnId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

/// Requested or granted lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A suspended lock request.
struct Waiter {
    txn_id: TxnId,
    mode: LockMode,
    grant_tx: SyncSender<bool>,
}

/// Per-RID wait list: the granted group and the FIFO queue behind it.
struct WaitList {
    /// Mode of the granted group (meaningful while `granted` is
    /// non-empty).
    mode: LockMode,
    granted: HashSet<TxnId>,
    queue: VecDeque<Waiter>,
    /// Transaction currently waiting to convert shared -> exclusive.
    upgrading: Option<TxnId>,
}

impl WaitList {
    fn new(txn_id: TxnId, mode: LockMode) -> Self {
        let mut granted = HashSet::new();
        granted.insert(txn_id);
        Self {
            mode,
            granted,
            queue: VecDeque::new(),
            upgrading: None,
        }
    }

    /// Smallest (oldest) granted-or-waiting transaction id.
    fn oldest(&self) -> Option<TxnId> {
        self.granted
            .iter()
            .copied()
            .chain(self.queue.iter().map(|w| w.txn_id))
            .min()
    }

    /// Oldest id excluding `txn_id` (for upgrades).
    fn oldest_other(&self, txn_id: TxnId) -> Option<TxnId> {
        self.granted
            .iter()
            .copied()
            .filter(|&id| id != txn_id)
            .chain(self.queue.iter().map(|w| w.txn_id))
            .min()
    }

    fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.queue.is_empty()
    }

    /// Grants the queue head while it is runnable, then any
    /// immediately following compatible shared waiters.
    fn grant_runnable(&mut self) {
        while let Some(front) = self.queue.front() {
            let compatible = self.granted.is_empty()
                || (self.mode == LockMode::Shared && front.mode == LockMode::Shared);
            if !compatible {
                break;
            }
            let waiter = self.queue.pop_front().expect("front checked above");
            self.mode = waiter.mode;
            self.granted.insert(waiter.txn_id);
            if self.upgrading == Some(waiter.txn_id) {
                self.upgrading = None;
            }
            let exclusive = waiter.mode == LockMode::Exclusive;
            // A dropped receiver means the waiter is gone; the grant
            // is simply lost with it.
            let _ = waiter.grant_tx.send(true);
            if exclusive {
                break;
            }
        }
    }
}

/// Lock manager over per-record wait lists.
pub struct LockManager {
    strict_two_phase_locking: bool,
    table: Mutex<HashMap<Rid, WaitList>>,
}

impl LockManager {
    /// Creates a lock manager; `strict` forbids releasing locks
    /// before the owning transaction reaches a terminal state.
    pub fn new(strict: bool) -> Self {
        Self {
            strict_two_phase_locking: strict,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if strict 2PL is enforced.
    pub fn is_strict(&self) -> bool {
        self.strict_two_phase_locking
    }

    /// Validates the transaction may acquire locks. A request in
    /// SHRINKING violates 2PL and aborts the transaction.
    fn admissible(txn: &Transaction) -> bool {
        match txn.state() {
            TransactionState::Growing => true,
            TransactionState::Shrinking => {
                txn.set_state(TransactionState::Aborted);
                false
            }
            TransactionState::Committed | TransactionState::Aborted => false,
        }
    }

    /// Wait-die: a requester younger than the oldest transaction on
    /// the entry dies. Returns true if the requester must abort.
    fn dies(txn: &Transaction, oldest: Option<TxnId>) -> bool {
        match oldest {
            Some(oldest) => txn.id() > oldest,
            None => false,
        }
    }

    /// Enqueues a waiter and returns the receiver to block on.
    fn enqueue(list: &mut WaitList, txn_id: TxnId, mode: LockMode) -> Receiver<bool> {
        let (tx, rx) = sync_channel(1);
        list.queue.push_back(Waiter {
            txn_id,
            mode,
            grant_tx: tx,
        });
        rx
    }

    /// Acquires a shared lock on `rid`, blocking until granted.
    ///
    /// Returns false if the request dies under wait-die or the
    /// transaction may not acquire locks; the transaction is then
    /// ABORTED where the protocol requires it.
    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> bool {
        if !Self::admissible(txn) {
            return false;
        }

        let rx = {
            let mut table = self.table.lock();
            match table.get_mut(&rid) {
                None => {
                    table.insert(rid, WaitList::new(txn.id(), LockMode::Shared));
                    txn.add_shared_lock(rid);
                    return true;
                }
                Some(list) => {
                    if list.mode == LockMode::Shared && list.queue.is_empty() {
                        list.granted.insert(txn.id());
                        txn.add_shared_lock(rid);
                        return true;
                    }
                    if Self::dies(txn, list.oldest()) {
                        debug!("{} dies waiting for shared {}", txn.id(), rid);
                        txn.set_state(TransactionState::Aborted);
                        return false;
                    }
                    Self::enqueue(list, txn.id(), LockMode::Shared)
                }
            }
        };

        match rx.recv() {
            Ok(true) => {
                txn.add_shared_lock(rid);
                true
            }
            _ => false,
        }
    }

    /// Acquires an exclusive lock on `rid`, blocking until granted.
    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> bool {
        if !Self::admissible(txn) {
            return false;
        }

        let rx = {
            let mut table = self.table.lock();
            match table.get_mut(&rid) {
                None => {
                    table.insert(rid, WaitList::new(txn.id(), LockMode::Exclusive));
                    txn.add_exclusive_lock(rid);
                    return true;
                }
                Some(list) => {
                    // Any existing hold is incompatible with exclusive.
                    if Self::dies(txn, list.oldest()) {
                        debug!("{} dies waiting for exclusive {}", txn.id(), rid);
                        txn.set_state(TransactionState::Aborted);
                        return false;
                    }
                    Self::enqueue(list, txn.id(), LockMode::Exclusive)
                }
            }
        };

        match rx.recv() {
            Ok(true) => {
                txn.add_exclusive_lock(rid);
                true
            }
            _ => false,
        }
    }

    /// Converts a held shared lock into an exclusive one.
    ///
    /// The sole shared holder converts in place. With other holders
    /// the upgrader goes through wait-die and, if it survives, waits
    /// at the queue head; a second concurrent upgrade fails outright.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> bool {
        if !Self::admissible(txn) {
            return false;
        }

        let rx = {
            let mut table = self.table.lock();
            let Some(list) = table.get_mut(&rid) else {
                return false;
            };
            if !list.granted.contains(&txn.id()) || list.mode != LockMode::Shared {
                return false;
            }

            if list.granted.len() == 1 {
                list.mode = LockMode::Exclusive;
                txn.shared_to_exclusive(rid);
                return true;
            }

            if list.upgrading.is_some() {
                return false;
            }
            if Self::dies(txn, list.oldest_other(txn.id())) {
                debug!("{} dies upgrading {}", txn.id(), rid);
                txn.set_state(TransactionState::Aborted);
                return false;
            }

            list.granted.remove(&txn.id());
            txn.remove_lock(rid);
            list.upgrading = Some(txn.id());
            let (tx, rx) = sync_channel(1);
            list.queue.push_front(Waiter {
                txn_id: txn.id(),
                mode: LockMode::Exclusive,
                grant_tx: tx,
            });
            rx
        };

        match rx.recv() {
            Ok(true) => {
                txn.add_exclusive_lock(rid);
                true
            }
            _ => false,
        }
    }

    /// Releases the lock `txn` holds on `rid`.
    ///
    /// Under strict 2PL this succeeds only once the transaction is
    /// COMMITTED or ABORTED; otherwise the first unlock moves a
    /// GROWING transaction to SHRINKING. Returns false if the lock
    /// is not held.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        let mut table = self.table.lock();

        let state = txn.state();
        if self.strict_two_phase_locking {
            if !matches!(
                state,
                TransactionState::Committed | TransactionState::Aborted
            ) {
                return false;
            }
        } else if state == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }

        let Some(list) = table.get_mut(&rid) else {
            return false;
        };
        if !list.granted.remove(&txn.id()) {
            return false;
        }
        txn.remove_lock(rid);

        list.grant_runnable();
        if list.is_empty() {
            table.remove(&rid);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use marrow_common::PageId;

    fn rid(slot: u32) -> Rid {
        Rid::new(PageId(0), slot)
    }

    #[test]
    fn test_shared_locks_are_compatible() {
        let lm = LockManager::new(false);
        let t0 = Transaction::new(TxnId(0));
        let t1 = Transaction::new(TxnId(1));

        assert!(lm.lock_shared(&t0, rid(0)));
        assert!(lm.lock_shared(&t1, rid(0)));
        assert_eq!(t0.state(), TransactionState::Growing);
        assert_eq!(t1.state(), TransactionState::Growing);
    }

    #[test]
    fn test_younger_requester_dies_on_conflict() {
        let lm = LockManager::new(false);
        let older = Transaction::new(TxnId(0));
        let younger = Transaction::new(TxnId(1));

        assert!(lm.lock_exclusive(&older, rid(0)));
        assert!(!lm.lock_shared(&younger, rid(0)));
        assert_eq!(younger.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_older_requester_waits_for_younger_holder() {
        let lm = Arc::new(LockManager::new(false));
        let younger = Arc::new(Transaction::new(TxnId(1)));
        let older = Arc::new(Transaction::new(TxnId(0)));

        assert!(lm.lock_shared(&younger, rid(0)));

        let waiter = {
            let lm = Arc::clone(&lm);
            let older = Arc::clone(&older);
            thread::spawn(move || lm.lock_exclusive(&older, rid(0)))
        };

        // Give the older transaction time to block.
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        assert!(lm.unlock(&younger, rid(0)));
        assert!(waiter.join().unwrap());
        assert!(older.holds_exclusive(rid(0)));
    }

    #[test]
    fn test_exclusive_excludes_exclusive() {
        let lm = LockManager::new(false);
        let older = Transaction::new(TxnId(0));
        let younger = Transaction::new(TxnId(5));

        assert!(lm.lock_exclusive(&older, rid(3)));
        assert!(!lm.lock_exclusive(&younger, rid(3)));
        assert_eq!(younger.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_unlock_transitions_growing_to_shrinking() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(TxnId(0));

        assert!(lm.lock_shared(&txn, rid(0)));
        assert!(lm.unlock(&txn, rid(0)));
        assert_eq!(txn.state(), TransactionState::Shrinking);
    }

    #[test]
    fn test_lock_in_shrinking_aborts() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(TxnId(0));

        assert!(lm.lock_shared(&txn, rid(0)));
        assert!(lm.unlock(&txn, rid(0)));
        assert!(!lm.lock_shared(&txn, rid(1)));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_strict_mode_rejects_early_unlock() {
        let lm = LockManager::new(true);
        let txn = Transaction::new(TxnId(0));

        assert!(lm.lock_shared(&txn, rid(0)));
        assert!(!lm.unlock(&txn, rid(0)));
        assert_eq!(txn.state(), TransactionState::Growing);

        // Further acquisitions still work before the terminal state.
        assert!(lm.lock_shared(&txn, rid(1)));

        txn.set_state(TransactionState::Committed);
        assert!(lm.unlock(&txn, rid(0)));
        assert!(lm.unlock(&txn, rid(1)));
        assert!(!lm.unlock(&txn, rid(0)));
    }

    #[test]
    fn test_unlock_unheld_rid() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(TxnId(0));
        assert!(!lm.unlock(&txn, rid(9)));
    }

    #[test]
    fn test_upgrade_sole_holder_converts_in_place() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(TxnId(0));

        assert!(lm.lock_shared(&txn, rid(0)));
        assert!(lm.lock_upgrade(&txn, rid(0)));
        assert!(txn.holds_exclusive(rid(0)));
        assert!(!txn.holds_shared(rid(0)));
        assert_eq!(txn.state(), TransactionState::Growing);
    }

    #[test]
    fn test_upgrade_without_shared_hold_fails() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(TxnId(0));
        assert!(!lm.lock_upgrade(&txn, rid(0)));
    }

    #[test]
    fn test_upgrade_waits_for_other_shared_holders() {
        let lm = Arc::new(LockManager::new(false));
        let older = Arc::new(Transaction::new(TxnId(0)));
        let younger = Arc::new(Transaction::new(TxnId(1)));

        assert!(lm.lock_shared(&older, rid(0)));
        assert!(lm.lock_shared(&younger, rid(0)));

        let upgrader = {
            let lm = Arc::clone(&lm);
            let older = Arc::clone(&older);
            thread::spawn(move || lm.lock_upgrade(&older, rid(0)))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!upgrader.is_finished());

        assert!(lm.unlock(&younger, rid(0)));
        assert!(upgrader.join().unwrap());
        assert!(older.holds_exclusive(rid(0)));
    }

    #[test]
    fn test_younger_upgrader_dies() {
        let lm = LockManager::new(false);
        let older = Transaction::new(TxnId(0));
        let younger = Transaction::new(TxnId(1));

        assert!(lm.lock_shared(&older, rid(0)));
        assert!(lm.lock_shared(&younger, rid(0)));
        assert!(!lm.lock_upgrade(&younger, rid(0)));
        assert_eq!(younger.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_fifo_grant_after_exclusive_release() {
        let lm = Arc::new(LockManager::new(false));
        let holder = Arc::new(Transaction::new(TxnId(2)));
        assert!(lm.lock_exclusive(&holder, rid(0)));

        // Two older transactions queue up as shared waiters.
        let waiters: Vec<_> = (0..2)
            .map(|i| {
                let lm = Arc::clone(&lm);
                thread::spawn(move || {
                    let txn = Transaction::new(TxnId(i));
                    lm.lock_shared(&txn, rid(0))
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert!(lm.unlock(&holder, rid(0)));

        // Both shared waiters are granted together.
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[test]
    fn test_entry_reclaimed_when_empty() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(TxnId(0));

        assert!(lm.lock_exclusive(&txn, rid(0)));
        assert!(lm.unlock(&txn, rid(0)));
        assert!(lm.table.lock().is_empty());
    }

    #[test]
    fn test_no_lost_grants_under_contention() {
        // Many older transactions hammer one RID; every lock_shared
        // that returns true must eventually unlock. Ids count down so
        // later requesters are older and wait rather than die.
        let lm = Arc::new(LockManager::new(false));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let lm = Arc::clone(&lm);
                thread::spawn(move || {
                    let txn = Transaction::new(TxnId(100 - i));
                    if lm.lock_exclusive(&txn, rid(0)) {
                        thread::sleep(Duration::from_millis(5));
                        txn.set_state(TransactionState::Committed);
                        assert!(lm.unlock(&txn, rid(0)));
                        true
                    } else {
                        false
                    }
                })
            })
            .collect();

        let granted = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert!(granted >= 1);
        assert!(lm.table.lock().is_empty());
    }
}
