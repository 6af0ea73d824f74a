//! MarrowDB: an embedded, single-node storage engine.
//!
//! The engine is built from four tightly coupled subsystems:
//!
//! - an extendible hash directory serving as the buffer pool's page
//!   table ([`marrow_buffer`]),
//! - a latch-crabbing B+ tree index ([`marrow_index`]),
//! - a tuple-grain lock manager with wait-die deadlock prevention
//!   ([`marrow_txn`]),
//! - a write-ahead log with group flush and ARIES-style recovery
//!   ([`marrow_wal`], [`LogRecovery`]).
//!
//! [`Database`] wires them together over a single page file and a
//! log file.

mod engine;
mod recovery;

pub use engine::Database;
pub use recovery::{last_logged_lsn, LogRecovery};

pub use marrow_buffer::{BufferPoolManager, DiskManager, ExtendibleHashTable};
pub use marrow_common::{EngineConfig, Lsn, MarrowError, PageId, Result, Rid, Tuple, TxnId};
pub use marrow_index::{BPlusTree, GenericKey};
pub use marrow_table::{HeaderPage, TableHeap, TablePage, TablePageRef};
pub use marrow_txn::{LockManager, Transaction, TransactionManager, TransactionState};
pub use marrow_wal::{LogManager, LogPayload, LogRecord};
