//! Table heap: a chain of slotted pages plus the lock -> log -> page
//! discipline every tuple mutation follows.

use crate::table_page::{TablePage, TablePageRef};
use log::debug;
use marrow_buffer::BufferPoolManager;
use marrow_common::{MarrowError, PageId, Result, Rid, Tuple};
use marrow_txn::{LockManager, Transaction, TransactionState, UndoTarget, WriteRecord, WriteType};
use marrow_wal::{LogManager, LogPayload, LogRecord};
use std::sync::Arc;

/// A page-chained tuple heap.
///
/// Every mutating operation acquires the record lock, appends its log
/// record while holding the page latch, stamps the page LSN, and
/// records an undo entry in the transaction's write set.
pub struct TableHeap {
    pool: Arc<BufferPoolManager>,
    lock_manager: Arc<LockManager>,
    log_manager: Option<Arc<LogManager>>,
    first_page_id: PageId,
}

impl TableHeap {
    /// Creates a heap with one empty page, logging its allocation.
    pub fn create(
        pool: Arc<BufferPoolManager>,
        lock_manager: Arc<LockManager>,
        log_manager: Option<Arc<LogManager>>,
        txn: &Transaction,
    ) -> Result<Arc<Self>> {
        let page = pool.new_page()?;
        let first_page_id = page.page_id();
        {
            let mut guard = page.write_latch();
            let mut table_page = TablePage::init(&mut guard[..], first_page_id, PageId::INVALID);
            if let Some(log) = &log_manager {
                let mut record = LogRecord::new(
                    txn.id(),
                    txn.prev_lsn(),
                    LogPayload::NewPage {
                        prev_page_id: PageId::INVALID,
                        page_id: first_page_id,
                    },
                );
                let lsn = log.append(&mut record);
                txn.set_prev_lsn(lsn);
                table_page.set_lsn(lsn);
                page.set_lsn(lsn);
            }
        }
        pool.unpin_page(first_page_id, true);

        Ok(Arc::new(Self {
            pool,
            lock_manager,
            log_manager,
            first_page_id,
        }))
    }

    /// Opens an existing heap rooted at `first_page_id`.
    pub fn open(
        pool: Arc<BufferPoolManager>,
        lock_manager: Arc<LockManager>,
        log_manager: Option<Arc<LogManager>>,
        first_page_id: PageId,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            lock_manager,
            log_manager,
            first_page_id,
        })
    }

    /// Returns the first page of the heap chain.
    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    fn aborted<T>(&self, txn: &Transaction, what: &str) -> Result<T> {
        Err(MarrowError::TransactionAborted(format!(
            "{} lock denied for {}",
            what,
            txn.id()
        )))
    }

    /// Takes (or upgrades to) the exclusive lock on `rid`.
    fn acquire_exclusive(&self, txn: &Transaction, rid: Rid) -> Result<()> {
        let granted = if txn.holds_exclusive(rid) {
            true
        } else if txn.holds_shared(rid) {
            self.lock_manager.lock_upgrade(txn, rid)
        } else {
            self.lock_manager.lock_exclusive(txn, rid)
        };
        if granted {
            Ok(())
        } else {
            self.aborted(txn, "exclusive")
        }
    }

    /// Appends a data log record and stamps both page LSN mirrors.
    ///
    /// No-op when logging is disabled.
    fn log_mutation(
        &self,
        txn: &Transaction,
        payload: LogPayload,
        table_page: &mut TablePage<'_>,
        frame: &marrow_buffer::Page,
    ) {
        if let Some(log) = &self.log_manager {
            let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), payload);
            let lsn = log.append(&mut record);
            txn.set_prev_lsn(lsn);
            table_page.set_lsn(lsn);
            frame.set_lsn(lsn);
        }
    }

    /// Inserts a tuple, returning its RID.
    ///
    /// Walks the page chain for space, extending it with a logged
    /// NEWPAGE when every page is full.
    pub fn insert_tuple(self: &Arc<Self>, txn: &Transaction, tuple: &Tuple) -> Result<Rid> {
        if tuple.serialized_size() > marrow_common::PAGE_SIZE / 2 {
            return Err(MarrowError::TupleTooLarge { size: tuple.len() });
        }

        let mut page_id = self.first_page_id;
        let rid = loop {
            let page = self.pool.fetch_page(page_id)?;
            let mut guard = page.write_latch();
            let mut table_page = TablePage::new(&mut guard[..]);

            if let Some(slot) = table_page.insert_tuple(tuple) {
                let rid = Rid::new(page_id, slot);
                self.log_mutation(
                    txn,
                    LogPayload::Insert {
                        rid,
                        tuple: tuple.clone(),
                    },
                    &mut table_page,
                    &page,
                );
                drop(guard);
                self.pool.unpin_page(page_id, true);
                break rid;
            }

            let next = table_page.next_page_id();
            if next.is_valid() {
                drop(guard);
                self.pool.unpin_page(page_id, false);
                page_id = next;
                continue;
            }

            // Chain exhausted: append a fresh page.
            let new_page = match self.pool.new_page() {
                Ok(p) => p,
                Err(e) => {
                    drop(guard);
                    self.pool.unpin_page(page_id, false);
                    return Err(e);
                }
            };
            let new_page_id = new_page.page_id();
            {
                let mut new_guard = new_page.write_latch();
                let mut new_table_page =
                    TablePage::init(&mut new_guard[..], new_page_id, page_id);
                self.log_mutation(
                    txn,
                    LogPayload::NewPage {
                        prev_page_id: page_id,
                        page_id: new_page_id,
                    },
                    &mut new_table_page,
                    &new_page,
                );
            }
            table_page.set_next_page_id(new_page_id);
            drop(guard);
            self.pool.unpin_page(page_id, true);
            self.pool.unpin_page(new_page_id, true);
            page_id = new_page_id;
        };

        self.acquire_exclusive(txn, rid)?;
        if txn.state() == TransactionState::Growing {
            txn.push_write_record(WriteRecord {
                rid,
                wtype: WriteType::Insert,
                tuple: Tuple::empty(),
                target: Arc::clone(self) as Arc<dyn UndoTarget>,
            });
        }
        debug!("{} inserted {}", txn.id(), rid);
        Ok(rid)
    }

    /// Marks the tuple at `rid` deleted; the physical delete happens
    /// at commit. Returns false if no visible tuple is there.
    pub fn mark_delete(self: &Arc<Self>, txn: &Transaction, rid: Rid) -> Result<bool> {
        self.acquire_exclusive(txn, rid)?;

        let page = self.pool.fetch_page(rid.page_id)?;
        let mut guard = page.write_latch();
        let mut table_page = TablePage::new(&mut guard[..]);

        let Some(old) = table_page.get_tuple(rid.slot) else {
            drop(guard);
            self.pool.unpin_page(rid.page_id, false);
            return Ok(false);
        };
        if !table_page.mark_delete(rid.slot) {
            drop(guard);
            self.pool.unpin_page(rid.page_id, false);
            return Ok(false);
        }
        self.log_mutation(txn, LogPayload::MarkDelete { rid }, &mut table_page, &page);
        drop(guard);
        self.pool.unpin_page(rid.page_id, true);

        if txn.state() == TransactionState::Growing {
            txn.push_write_record(WriteRecord {
                rid,
                wtype: WriteType::Delete,
                tuple: old,
                target: Arc::clone(self) as Arc<dyn UndoTarget>,
            });
        }
        Ok(true)
    }

    /// Replaces the tuple at `rid`. Returns false when the page
    /// cannot hold the new image; the caller should abort.
    pub fn update_tuple(self: &Arc<Self>, txn: &Transaction, rid: Rid, tuple: &Tuple) -> Result<bool> {
        self.acquire_exclusive(txn, rid)?;

        let page = self.pool.fetch_page(rid.page_id)?;
        let mut guard = page.write_latch();
        let mut table_page = TablePage::new(&mut guard[..]);

        let Some(old) = table_page.get_tuple(rid.slot) else {
            drop(guard);
            self.pool.unpin_page(rid.page_id, false);
            return Ok(false);
        };
        if !table_page.update_tuple(rid.slot, tuple) {
            drop(guard);
            self.pool.unpin_page(rid.page_id, false);
            return Ok(false);
        }
        self.log_mutation(
            txn,
            LogPayload::Update {
                rid,
                old: old.clone(),
                new: tuple.clone(),
            },
            &mut table_page,
            &page,
        );
        drop(guard);
        self.pool.unpin_page(rid.page_id, true);

        if txn.state() == TransactionState::Growing {
            txn.push_write_record(WriteRecord {
                rid,
                wtype: WriteType::Update,
                tuple: old,
                target: Arc::clone(self) as Arc<dyn UndoTarget>,
            });
        }
        Ok(true)
    }

    /// Reads the tuple at `rid` under a shared lock.
    pub fn get_tuple(&self, txn: &Transaction, rid: Rid) -> Result<Option<Tuple>> {
        if !txn.holds_shared(rid) && !txn.holds_exclusive(rid) {
            if !self.lock_manager.lock_shared(txn, rid) {
                return self.aborted(txn, "shared");
            }
        }

        let page = self.pool.fetch_page(rid.page_id)?;
        let guard = page.read_latch();
        let tuple = TablePageRef::new(&guard[..]).get_tuple(rid.slot);
        drop(guard);
        self.pool.unpin_page(rid.page_id, false);
        Ok(tuple)
    }
}

impl UndoTarget for TableHeap {
    /// Physically removes the tuple (commit of a delete, or rollback
    /// of an insert). The caller already holds the exclusive lock.
    fn apply_delete(&self, rid: Rid, txn: &Transaction) -> Result<()> {
        let page = self.pool.fetch_page(rid.page_id)?;
        let mut guard = page.write_latch();
        let mut table_page = TablePage::new(&mut guard[..]);

        let Some(old) = table_page.apply_delete(rid.slot) else {
            drop(guard);
            self.pool.unpin_page(rid.page_id, false);
            return Err(MarrowError::TupleNotFound {
                rid: rid.to_string(),
            });
        };
        if let Some(log) = &self.log_manager {
            let mut record = LogRecord::new(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::ApplyDelete { rid, tuple: old },
            );
            let lsn = log.append(&mut record);
            txn.set_prev_lsn(lsn);
            table_page.set_lsn(lsn);
            page.set_lsn(lsn);
        }
        drop(guard);
        self.pool.unpin_page(rid.page_id, true);
        Ok(())
    }

    /// Clears a delete mark (abort of a mark-delete).
    fn rollback_delete(&self, rid: Rid, txn: &Transaction) -> Result<()> {
        let page = self.pool.fetch_page(rid.page_id)?;
        let mut guard = page.write_latch();
        let mut table_page = TablePage::new(&mut guard[..]);

        if !table_page.rollback_delete(rid.slot) {
            drop(guard);
            self.pool.unpin_page(rid.page_id, false);
            return Err(MarrowError::TupleNotFound {
                rid: rid.to_string(),
            });
        }
        if let Some(log) = &self.log_manager {
            let mut record =
                LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::RollbackDelete { rid });
            let lsn = log.append(&mut record);
            txn.set_prev_lsn(lsn);
            table_page.set_lsn(lsn);
            page.set_lsn(lsn);
        }
        drop(guard);
        self.pool.unpin_page(rid.page_id, true);
        Ok(())
    }

    /// Writes a previous image back (abort of an update). Logged as an
    /// UPDATE so redo replays the rollback.
    fn update_tuple(&self, rid: Rid, tuple: &Tuple, txn: &Transaction) -> Result<()> {
        let page = self.pool.fetch_page(rid.page_id)?;
        let mut guard = page.write_latch();
        let mut table_page = TablePage::new(&mut guard[..]);

        let Some(current) = table_page.get_tuple(rid.slot) else {
            drop(guard);
            self.pool.unpin_page(rid.page_id, false);
            return Err(MarrowError::TupleNotFound {
                rid: rid.to_string(),
            });
        };
        if !table_page.update_tuple(rid.slot, tuple) {
            drop(guard);
            self.pool.unpin_page(rid.page_id, false);
            return Err(MarrowError::Internal(format!(
                "rollback update failed at {}",
                rid
            )));
        }
        if let Some(log) = &self.log_manager {
            let mut record = LogRecord::new(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::Update {
                    rid,
                    old: current,
                    new: tuple.clone(),
                },
            );
            let lsn = log.append(&mut record);
            txn.set_prev_lsn(lsn);
            table_page.set_lsn(lsn);
            page.set_lsn(lsn);
        }
        drop(guard);
        self.pool.unpin_page(rid.page_id, true);
        Ok(())
    }
}
