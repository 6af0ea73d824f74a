//! ARIES-style crash recovery: a redo pass over the whole log,
//! followed by an undo pass over every transaction still active at
//! the crash.

use log::{debug, info, warn};
use marrow_buffer::{BufferPoolManager, DiskManager};
use marrow_common::{Lsn, PageId, Result, Rid, TxnId};
use marrow_table::{TablePage, TablePageRef};
use marrow_wal::{LogPayload, LogRecord, LOG_BUFFER_SIZE};
use std::collections::HashMap;
use std::sync::Arc;

/// Replays the log after a crash.
///
/// `redo` scans the log from byte 0 in `LOG_BUFFER_SIZE` chunks,
/// re-applying every record a page has not seen (`page.lsn <
/// record.lsn`) while building the active-transaction table and the
/// LSN -> file offset map. `undo` then walks each loser's prev-LSN
/// chain backwards, inverting its effects exactly once.
pub struct LogRecovery {
    disk: Arc<DiskManager>,
    pool: Arc<BufferPoolManager>,
    /// Last LSN seen per still-active transaction.
    active_txn: HashMap<TxnId, Lsn>,
    /// Byte offset of each record in the log file.
    lsn_mapping: HashMap<Lsn, u64>,
}

impl LogRecovery {
    /// Creates a recovery pass over the given log and pool.
    pub fn new(disk: Arc<DiskManager>, pool: Arc<BufferPoolManager>) -> Self {
        Self {
            disk,
            pool,
            active_txn: HashMap::new(),
            lsn_mapping: HashMap::new(),
        }
    }

    /// Transactions with no COMMIT/ABORT in the log (the losers).
    pub fn active_transactions(&self) -> &HashMap<TxnId, Lsn> {
        &self.active_txn
    }

    /// Scans the log forward, re-applying effects pages have not seen.
    pub fn redo(&mut self) -> Result<()> {
        let mut buffer = vec![0u8; LOG_BUFFER_SIZE];
        let mut file_offset: u64 = 0;
        let mut replayed = 0usize;

        loop {
            let available = self.disk.read_log(&mut buffer, file_offset)?;
            if available == 0 {
                break;
            }

            let mut pos = 0;
            while let Some(record) = LogRecord::deserialize(&buffer[pos..available]) {
                self.lsn_mapping.insert(record.lsn, file_offset + pos as u64);
                self.redo_record(&record)?;
                pos += record.serialized_size();
                replayed += 1;
            }
            if pos == 0 {
                // Nothing parseable: a torn tail from the crash.
                break;
            }
            // A record cut off at the chunk boundary is re-read from
            // its own offset on the next pass.
            file_offset += pos as u64;
        }

        info!(
            "redo replayed {} records, {} transactions still active",
            replayed,
            self.active_txn.len()
        );
        Ok(())
    }

    fn redo_record(&mut self, record: &LogRecord) -> Result<()> {
        match &record.payload {
            LogPayload::Begin => {
                self.active_txn.insert(record.txn_id, record.lsn);
            }
            LogPayload::Commit | LogPayload::Abort => {
                self.active_txn.remove(&record.txn_id);
            }
            LogPayload::Insert { rid, tuple } => {
                self.active_txn.insert(record.txn_id, record.lsn);
                self.redo_on_page(*rid, record.lsn, |page, slot| {
                    if !page.insert_tuple_at(slot, tuple) {
                        warn!("redo: cannot re-insert at {}", rid);
                    }
                })?;
            }
            LogPayload::ApplyDelete { rid, .. } => {
                self.active_txn.insert(record.txn_id, record.lsn);
                self.redo_on_page(*rid, record.lsn, |page, slot| {
                    page.apply_delete(slot);
                })?;
            }
            LogPayload::MarkDelete { rid } => {
                self.active_txn.insert(record.txn_id, record.lsn);
                self.redo_on_page(*rid, record.lsn, |page, slot| {
                    page.mark_delete(slot);
                })?;
            }
            LogPayload::RollbackDelete { rid } => {
                self.active_txn.insert(record.txn_id, record.lsn);
                self.redo_on_page(*rid, record.lsn, |page, slot| {
                    page.rollback_delete(slot);
                })?;
            }
            LogPayload::Update { rid, new, .. } => {
                self.active_txn.insert(record.txn_id, record.lsn);
                self.redo_on_page(*rid, record.lsn, |page, slot| {
                    if !page.update_tuple(slot, new) {
                        warn!("redo: cannot re-update at {}", rid);
                    }
                })?;
            }
            LogPayload::NewPage {
                prev_page_id,
                page_id,
            } => {
                self.active_txn.insert(record.txn_id, record.lsn);
                self.redo_new_page(*prev_page_id, *page_id, record.lsn)?;
            }
        }
        Ok(())
    }

    /// Applies `mutate` to the target page unless the page already
    /// carries the record's effect (`page.lsn >= record.lsn`).
    fn redo_on_page<F>(&self, rid: Rid, lsn: Lsn, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut TablePage<'_>, u32),
    {
        self.disk.ensure_allocated(rid.page_id);
        let page = self.pool.fetch_page(rid.page_id)?;
        let mut guard = page.write_latch();
        let mut table_page = if TablePageRef::new(&guard[..]).is_initialized() {
            TablePage::new(&mut guard[..])
        } else {
            // The NEWPAGE record for this page is missing or torn.
            warn!("redo: formatting uninitialized {}", rid.page_id);
            TablePage::init(&mut guard[..], rid.page_id, PageId::INVALID)
        };

        if table_page.lsn() >= lsn {
            drop(guard);
            self.pool.unpin_page(rid.page_id, false);
            return Ok(());
        }

        mutate(&mut table_page, rid.slot);
        table_page.set_lsn(lsn);
        page.set_lsn(lsn);
        drop(guard);
        self.pool.unpin_page(rid.page_id, true);
        Ok(())
    }

    /// Re-initialises an appended page and relinks its predecessor.
    fn redo_new_page(&self, prev_page_id: PageId, page_id: PageId, lsn: Lsn) -> Result<()> {
        self.disk.ensure_allocated(page_id);
        let page = self.pool.fetch_page(page_id)?;
        {
            let mut guard = page.write_latch();
            let view = TablePage::new(&mut guard[..]);
            if view.lsn() >= lsn {
                drop(guard);
                self.pool.unpin_page(page_id, false);
                return Ok(());
            }
            let mut table_page = TablePage::init(&mut guard[..], page_id, prev_page_id);
            table_page.set_lsn(lsn);
            page.set_lsn(lsn);
        }
        self.pool.unpin_page(page_id, true);

        if prev_page_id.is_valid() {
            let prev = self.pool.fetch_page(prev_page_id)?;
            let mut guard = prev.write_latch();
            let mut prev_page = TablePage::new(&mut guard[..]);
            if !prev_page.next_page_id().is_valid() {
                prev_page.set_next_page_id(page_id);
                drop(guard);
                self.pool.unpin_page(prev_page_id, true);
            } else {
                drop(guard);
                self.pool.unpin_page(prev_page_id, false);
            }
        }
        Ok(())
    }

    /// Rolls back every loser by walking its prev-LSN chain.
    pub fn undo(&mut self) -> Result<()> {
        let mut buffer = vec![0u8; LOG_BUFFER_SIZE];
        let losers: Vec<(TxnId, Lsn)> =
            self.active_txn.iter().map(|(t, l)| (*t, *l)).collect();

        for (txn_id, last_lsn) in losers {
            debug!("undoing {} from {}", txn_id, last_lsn);
            let mut lsn = last_lsn;
            while lsn.is_valid() {
                let Some(&offset) = self.lsn_mapping.get(&lsn) else {
                    warn!("undo: no offset recorded for {}", lsn);
                    break;
                };
                let read = self.disk.read_log(&mut buffer, offset)?;
                let Some(record) = LogRecord::deserialize(&buffer[..read]) else {
                    warn!("undo: cannot read record at offset {}", offset);
                    break;
                };
                self.undo_record(&record)?;
                lsn = record.prev_lsn;
            }
        }
        Ok(())
    }

    fn undo_record(&self, record: &LogRecord) -> Result<()> {
        match &record.payload {
            LogPayload::Insert { rid, .. } => {
                self.undo_on_page(*rid, |page, slot| {
                    page.apply_delete(slot);
                })?;
            }
            LogPayload::MarkDelete { rid } => {
                self.undo_on_page(*rid, |page, slot| {
                    page.rollback_delete(slot);
                })?;
            }
            LogPayload::Update { rid, old, .. } => {
                let old = old.clone();
                self.undo_on_page(*rid, move |page, slot| {
                    if !page.update_tuple(slot, &old) {
                        warn!("undo: cannot restore tuple at slot {}", slot);
                    }
                })?;
            }
            // BEGIN ends the chain; the remaining kinds have no
            // inverse at this level.
            _ => {}
        }
        Ok(())
    }

    fn undo_on_page<F>(&self, rid: Rid, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut TablePage<'_>, u32),
    {
        let page = self.pool.fetch_page(rid.page_id)?;
        {
            let mut guard = page.write_latch();
            let mut table_page = TablePage::new(&mut guard[..]);
            mutate(&mut table_page, rid.slot);
        }
        self.pool.unpin_page(rid.page_id, true);
        Ok(())
    }
}

/// Scans the log for the LSN its last complete record carries.
pub fn last_logged_lsn(disk: &DiskManager) -> Result<Lsn> {
    let mut buffer = vec![0u8; LOG_BUFFER_SIZE];
    let mut file_offset: u64 = 0;
    let mut last = Lsn::INVALID;

    loop {
        let available = disk.read_log(&mut buffer, file_offset)?;
        if available == 0 {
            break;
        }
        let mut pos = 0;
        while let Some(record) = LogRecord::deserialize(&buffer[pos..available]) {
            last = record.lsn;
            pos += record.serialized_size();
        }
        if pos == 0 {
            break;
        }
        file_offset += pos as u64;
    }
    Ok(last)
}
