//! Transaction manager: begin, commit, and abort, integrating the
//! lock manager and the write-ahead log.

use crate::lock_manager::LockManager;
use crate::transaction::{Transaction, TransactionState, WriteType};
use log::debug;
use marrow_common::{Result, TxnId};
use marrow_wal::{LogManager, LogPayload, LogRecord};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Creates transactions and drives them to a terminal state.
pub struct TransactionManager {
    lock_manager: Arc<LockManager>,
    /// Present when logging is enabled.
    log_manager: Option<Arc<LogManager>>,
    next_txn_id: AtomicI32,
}

impl TransactionManager {
    /// Creates a transaction manager. `log_manager` is None when
    /// logging is disabled.
    pub fn new(lock_manager: Arc<LockManager>, log_manager: Option<Arc<LogManager>>) -> Self {
        Self {
            lock_manager,
            log_manager,
            next_txn_id: AtomicI32::new(0),
        }
    }

    /// Returns the lock manager.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Starts a new transaction and logs its BEGIN record.
    pub fn begin(&self) -> Arc<Transaction> {
        let id = TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        let txn = Arc::new(Transaction::new(id));

        if let Some(log) = &self.log_manager {
            let mut record = LogRecord::new(id, txn.prev_lsn(), LogPayload::Begin);
            let lsn = log.append(&mut record);
            txn.set_prev_lsn(lsn);
        }
        txn
    }

    /// Commits the transaction: finishes deferred deletes, makes the
    /// COMMIT record durable, then releases every lock.
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        txn.set_state(TransactionState::Committed);

        // Mark-deleted tuples become true deletes before the commit
        // record is written.
        let write_set = txn.take_write_set();
        for record in write_set.iter().rev() {
            if record.wtype == WriteType::Delete {
                record.target.apply_delete(record.rid, txn)?;
            }
        }

        if let Some(log) = &self.log_manager {
            let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Commit);
            let lsn = log.append(&mut record);
            txn.set_prev_lsn(lsn);
            log.force_flush(lsn);
        }

        self.release_locks(txn);
        debug!("{} committed", txn.id());
        Ok(())
    }

    /// Aborts the transaction: undoes the write set in reverse order,
    /// logs ABORT, then releases every lock.
    pub fn abort(&self, txn: &Transaction) -> Result<()> {
        txn.set_state(TransactionState::Aborted);

        let write_set = txn.take_write_set();
        for record in write_set.iter().rev() {
            match record.wtype {
                WriteType::Insert => record.target.apply_delete(record.rid, txn)?,
                WriteType::Delete => record.target.rollback_delete(record.rid, txn)?,
                WriteType::Update => {
                    record.target.update_tuple(record.rid, &record.tuple, txn)?
                }
            }
        }

        if let Some(log) = &self.log_manager {
            let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Abort);
            let lsn = log.append(&mut record);
            txn.set_prev_lsn(lsn);
            log.force_flush(lsn);
        }

        self.release_locks(txn);
        debug!("{} aborted", txn.id());
        Ok(())
    }

    /// Releases every lock the transaction holds, exactly once each.
    fn release_locks(&self, txn: &Transaction) {
        for rid in txn.locked_rids() {
            self.lock_manager.unlock(txn, rid);
        }
    }
}
