//! Transaction state and per-transaction bookkeeping.

use marrow_common::{Lsn, Result, Rid, Tuple, TxnId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Lifecycle of a transaction under two-phase locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Acquiring locks.
    Growing,
    /// Has released a lock; may release but not acquire.
    Shrinking,
    /// Terminal: effects durable.
    Committed,
    /// Terminal: effects rolled back.
    Aborted,
}

/// Kind of mutation recorded in the write set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Insert,
    Update,
    Delete,
}

/// Seam to the tuple storage the write set points back into.
///
/// Implemented by the table heap; keeps this crate independent of the
/// storage layer while commit/abort drain the write set.
pub trait UndoTarget: Send + Sync {
    /// Physically removes the tuple at `rid`.
    fn apply_delete(&self, rid: Rid, txn: &Transaction) -> Result<()>;

    /// Clears the delete mark on the tuple at `rid`.
    fn rollback_delete(&self, rid: Rid, txn: &Transaction) -> Result<()>;

    /// Writes `tuple` back at `rid`.
    fn update_tuple(&self, rid: Rid, tuple: &Tuple, txn: &Transaction) -> Result<()>;
}

/// One undo entry: enough to invert a mutation on abort or finish a
/// deferred delete on commit.
pub struct WriteRecord {
    /// Address of the affected tuple.
    pub rid: Rid,
    /// Kind of mutation performed.
    pub wtype: WriteType,
    /// Previous tuple image (empty for inserts).
    pub tuple: Tuple,
    /// Table the mutation happened in.
    pub target: Arc<dyn UndoTarget>,
}

/// A single transaction.
///
/// Shared across threads behind an `Arc`; all fields use interior
/// mutability so the lock manager and table heap can update them
/// through a shared reference.
pub struct Transaction {
    id: TxnId,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    write_set: Mutex<Vec<WriteRecord>>,
    /// LSN of this transaction's latest log record.
    prev_lsn: AtomicI32,
}

impl Transaction {
    /// Creates a transaction in the GROWING state.
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            write_set: Mutex::new(Vec::new()),
            prev_lsn: AtomicI32::new(Lsn::INVALID.0),
        }
    }

    /// Returns the transaction id. Smaller ids are older.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Returns the current state.
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Sets the state.
    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// LSN of this transaction's latest log record.
    pub fn prev_lsn(&self) -> Lsn {
        Lsn(self.prev_lsn.load(Ordering::Acquire))
    }

    /// Records the LSN of this transaction's latest log record.
    pub fn set_prev_lsn(&self, lsn: Lsn) {
        self.prev_lsn.store(lsn.0, Ordering::Release);
    }

    /// Returns true if this transaction holds a shared lock on `rid`.
    pub fn holds_shared(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    /// Returns true if this transaction holds an exclusive lock on `rid`.
    pub fn holds_exclusive(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    pub(crate) fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub(crate) fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub(crate) fn shared_to_exclusive(&self, rid: Rid) {
        self.shared_lock_set.lock().remove(&rid);
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().remove(&rid);
        self.exclusive_lock_set.lock().remove(&rid);
    }

    /// Snapshot of every RID this transaction holds a lock on.
    pub fn locked_rids(&self) -> HashSet<Rid> {
        let mut rids: HashSet<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }

    /// Appends an undo entry to the write set.
    pub fn push_write_record(&self, record: WriteRecord) {
        self.write_set.lock().push(record);
    }

    /// Drains the write set, oldest entry first.
    pub fn take_write_set(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut self.write_set.lock())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("prev_lsn", &self.prev_lsn())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrow_common::PageId;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(TxnId(1));
        assert_eq!(txn.id(), TxnId(1));
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.prev_lsn(), Lsn::INVALID);
    }

    #[test]
    fn test_state_transitions() {
        let txn = Transaction::new(TxnId(1));
        txn.set_state(TransactionState::Shrinking);
        assert_eq!(txn.state(), TransactionState::Shrinking);
        txn.set_state(TransactionState::Aborted);
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_lock_set_bookkeeping() {
        let txn = Transaction::new(TxnId(1));
        let rid = Rid::new(PageId(1), 0);

        txn.add_shared_lock(rid);
        assert!(txn.holds_shared(rid));
        assert!(!txn.holds_exclusive(rid));

        txn.shared_to_exclusive(rid);
        assert!(!txn.holds_shared(rid));
        assert!(txn.holds_exclusive(rid));

        txn.remove_lock(rid);
        assert!(txn.locked_rids().is_empty());
    }

    #[test]
    fn test_prev_lsn_chain() {
        let txn = Transaction::new(TxnId(1));
        txn.set_prev_lsn(Lsn(3));
        assert_eq!(txn.prev_lsn(), Lsn(3));
        txn.set_prev_lsn(Lsn(9));
        assert_eq!(txn.prev_lsn(), Lsn(9));
    }

    #[test]
    fn test_take_write_set_drains() {
        struct NoopTarget;
        impl UndoTarget for NoopTarget {
            fn apply_delete(&self, _rid: Rid, _txn: &Transaction) -> Result<()> {
                Ok(())
            }
            fn rollback_delete(&self, _rid: Rid, _txn: &Transaction) -> Result<()> {
                Ok(())
            }
            fn update_tuple(&self, _rid: Rid, _t: &Tuple, _txn: &Transaction) -> Result<()> {
                Ok(())
            }
        }

        let txn = Transaction::new(TxnId(1));
        let target: Arc<dyn UndoTarget> = Arc::new(NoopTarget);
        txn.push_write_record(WriteRecord {
            rid: Rid::new(PageId(1), 0),
            wtype: WriteType::Insert,
            tuple: Tuple::empty(),
            target: Arc::clone(&target),
        });
        txn.push_write_record(WriteRecord {
            rid: Rid::new(PageId(1), 1),
            wtype: WriteType::Delete,
            tuple: Tuple::new(&b"old"[..]),
            target,
        });

        let drained = txn.take_write_set();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].wtype, WriteType::Insert);
        assert!(txn.take_write_set().is_empty());
    }
}
