//! Engine facade: wires the disk manager, buffer pool, log manager,
//! lock manager, and transaction manager into one database handle.

use crate::recovery::{last_logged_lsn, LogRecovery};
use log::info;
use marrow_buffer::{BufferPoolManager, DiskManager};
use marrow_common::{EngineConfig, Lsn, MarrowError, PageId, Result};
use marrow_index::BPlusTree;
use marrow_table::{HeaderPage, TableHeap};
use marrow_txn::{LockManager, Transaction, TransactionManager};
use marrow_wal::LogManager;
use std::sync::Arc;

/// An embedded MarrowDB instance.
///
/// One database file (page 0 is the header page) plus one log file.
/// Dropping the handle stops the flush thread but does not flush the
/// buffer pool; call `shutdown` for a clean close, or `recover` after
/// reopening an unclean one.
pub struct Database {
    config: EngineConfig,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPoolManager>,
    lock_manager: Arc<LockManager>,
    log_manager: Option<Arc<LogManager>>,
    txn_manager: TransactionManager,
}

impl Database {
    /// Opens (or creates) a database with the given configuration.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let disk = Arc::new(DiskManager::new(&config.db_path, &config.log_path)?);
        let pool = Arc::new(BufferPoolManager::new(
            config.buffer_pool_frames,
            Arc::clone(&disk),
            config.hash_bucket_size,
        ));

        // First open: format the header page.
        if disk.num_pages() == 0 {
            let page = pool.new_page()?;
            if page.page_id() != PageId::HEADER {
                return Err(MarrowError::Internal(
                    "header page must be page 0".to_string(),
                ));
            }
            {
                let mut guard = page.write_latch();
                HeaderPage::init(&mut guard[..]);
            }
            pool.unpin_page(PageId::HEADER, true);
            pool.flush_page(PageId::HEADER)?;
        }

        let log_manager = if config.logging_enabled {
            let last = last_logged_lsn(&disk)?;
            let next = if last.is_valid() { Lsn(last.0 + 1) } else { Lsn(1) };
            let manager = LogManager::new(Arc::clone(&disk), next);
            manager.run_flush_thread();
            pool.set_wal(Arc::clone(&manager) as Arc<dyn marrow_buffer::WalFlush>);
            Some(manager)
        } else {
            None
        };

        let lock_manager = Arc::new(LockManager::new(config.strict_two_phase_locking));
        let txn_manager =
            TransactionManager::new(Arc::clone(&lock_manager), log_manager.clone());

        info!(
            "opened database at {} ({} pages, logging {})",
            config.db_path.display(),
            disk.num_pages(),
            if config.logging_enabled { "on" } else { "off" },
        );

        Ok(Self {
            config,
            disk,
            pool,
            lock_manager,
            log_manager,
            txn_manager,
        })
    }

    /// The configuration this instance was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The buffer pool.
    pub fn pool(&self) -> &Arc<BufferPoolManager> {
        &self.pool
    }

    /// The lock manager.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// The log manager (None when logging is disabled).
    pub fn log_manager(&self) -> Option<&Arc<LogManager>> {
        self.log_manager.as_ref()
    }

    /// The transaction manager.
    pub fn txn_manager(&self) -> &TransactionManager {
        &self.txn_manager
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Arc<Transaction> {
        self.txn_manager.begin()
    }

    /// Commits a transaction.
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        self.txn_manager.commit(txn)
    }

    /// Aborts a transaction.
    pub fn abort(&self, txn: &Transaction) -> Result<()> {
        self.txn_manager.abort(txn)
    }

    /// Creates a table heap and registers it in the header page.
    pub fn create_table(&self, name: &str, txn: &Transaction) -> Result<Arc<TableHeap>> {
        let heap = TableHeap::create(
            Arc::clone(&self.pool),
            Arc::clone(&self.lock_manager),
            self.log_manager.clone(),
            txn,
        )?;

        let page = self.pool.fetch_page(PageId::HEADER)?;
        let registered = {
            let mut guard = page.write_latch();
            HeaderPage::new(&mut guard[..]).insert_record(name, heap.first_page_id())
        };
        self.pool.unpin_page(PageId::HEADER, true);
        if !registered {
            return Err(MarrowError::Internal(format!(
                "cannot register table {:?}",
                name
            )));
        }
        // Catalog records are written through eagerly rather than
        // logged; recovery relies on finding them in place.
        self.pool.flush_page(PageId::HEADER)?;
        Ok(heap)
    }

    /// Opens a table heap registered in the header page.
    pub fn open_table(&self, name: &str) -> Result<Arc<TableHeap>> {
        let page = self.pool.fetch_page(PageId::HEADER)?;
        let first_page_id = {
            let mut guard = page.write_latch();
            HeaderPage::new(&mut guard[..]).get_root(name)
        };
        self.pool.unpin_page(PageId::HEADER, false);

        let first_page_id =
            first_page_id.ok_or_else(|| MarrowError::IndexNotFound(name.to_string()))?;
        Ok(TableHeap::open(
            Arc::clone(&self.pool),
            Arc::clone(&self.lock_manager),
            self.log_manager.clone(),
            first_page_id,
        ))
    }

    /// Opens (or creates) a B+ tree index registered in the header
    /// page.
    pub fn open_index<const N: usize>(&self, name: &str) -> Result<BPlusTree<N>> {
        BPlusTree::new(name, Arc::clone(&self.pool))
    }

    /// Runs crash recovery: redo the whole log, then undo every
    /// transaction without a terminal record, then flush.
    pub fn recover(&self) -> Result<()> {
        let mut recovery = LogRecovery::new(Arc::clone(&self.disk), Arc::clone(&self.pool));
        recovery.redo()?;
        recovery.undo()?;
        self.pool.flush_all()?;
        Ok(())
    }

    /// Flushes all dirty pages and stops the log flush thread.
    pub fn shutdown(&self) -> Result<()> {
        self.pool.flush_all()?;
        if let Some(log) = &self.log_manager {
            log.stop_flush_thread();
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(log) = &self.log_manager {
            log.stop_flush_thread();
        }
    }
}
