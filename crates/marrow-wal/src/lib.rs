//! Write-ahead logging for MarrowDB.
//!
//! Records are serialized into an in-memory buffer in LSN order and
//! drained to the log file by a background flush thread; commit
//! durability and the buffer pool's WAL rule both go through
//! `force_flush`.

mod manager;
mod record;

pub use manager::{LogManager, LOG_BUFFER_SIZE, LOG_TIMEOUT};
pub use record::{LogPayload, LogRecord, LogRecordType};
