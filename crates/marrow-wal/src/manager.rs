//! Log manager: serial append into an in-memory buffer, drained to
//! disk by a background flush thread.

use crate::record::LogRecord;
use log::debug;
use marrow_buffer::{DiskManager, WalFlush};
use marrow_common::Lsn;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Capacity of each in-memory log buffer.
pub const LOG_BUFFER_SIZE: usize = 32 * 1024;

/// Interval between unprompted background flushes.
pub const LOG_TIMEOUT: Duration = Duration::from_millis(300);

/// Active log buffer state, behind the log latch.
struct LogBuffer {
    /// Serialized records not yet handed to the flush thread.
    data: Vec<u8>,
    /// LSN of the last record in `data`.
    last_lsn: Lsn,
    /// Shutdown flag for the flush thread.
    stop: bool,
}

/// Write-ahead log manager.
///
/// `append` serializes records into the active buffer under the log
/// latch, so byte order equals LSN order. The flush thread swaps the
/// active buffer out, writes it via the disk manager, and advances
/// `persistent_lsn`; appenders that find the buffer full block until
/// a swap makes room, and committers block in `force_flush` until
/// their records are durable.
pub struct LogManager {
    disk: Arc<DiskManager>,
    buffer: Mutex<LogBuffer>,
    /// Next LSN to assign.
    next_lsn: AtomicI32,
    /// All records with LSN <= this are on stable storage.
    persistent_lsn: AtomicI32,
    /// Wakes the flush thread ahead of its timeout.
    flush_request: Condvar,
    /// Broadcast after each swap and after each durable write.
    flushed: Condvar,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    /// Creates a log manager appending through the given disk manager.
    ///
    /// `next_lsn` continues after any records already in the log
    /// file. LSN 0 is never assigned: a page that was never written
    /// reads back with a zeroed LSN field, and redo must see it as
    /// older than every record.
    pub fn new(disk: Arc<DiskManager>, next_lsn: Lsn) -> Arc<Self> {
        let first = if next_lsn.is_valid() { next_lsn.0.max(1) } else { 1 };
        Arc::new(Self {
            disk,
            buffer: Mutex::new(LogBuffer {
                data: Vec::with_capacity(LOG_BUFFER_SIZE),
                last_lsn: Lsn::INVALID,
                stop: false,
            }),
            next_lsn: AtomicI32::new(first),
            persistent_lsn: AtomicI32::new(first - 1),
            flush_request: Condvar::new(),
            flushed: Condvar::new(),
            flush_thread: Mutex::new(None),
        })
    }

    /// Returns the next LSN that will be assigned.
    pub fn next_lsn(&self) -> Lsn {
        Lsn(self.next_lsn.load(Ordering::SeqCst))
    }

    /// Returns the LSN through which the log is durable.
    pub fn persistent_lsn(&self) -> Lsn {
        Lsn(self.persistent_lsn.load(Ordering::SeqCst))
    }

    /// Starts the background flush thread.
    pub fn run_flush_thread(self: &Arc<Self>) {
        let mut handle = self.flush_thread.lock();
        if handle.is_some() {
            return;
        }
        self.buffer.lock().stop = false;
        let manager = Arc::clone(self);
        *handle = Some(std::thread::spawn(move || manager.flush_loop()));
    }

    /// Stops and joins the flush thread, draining pending records.
    pub fn stop_flush_thread(&self) {
        let handle = {
            let mut handle = self.flush_thread.lock();
            let Some(handle) = handle.take() else {
                return;
            };
            self.buffer.lock().stop = true;
            self.flush_request.notify_all();
            handle
        };
        let _ = handle.join();
    }

    fn flush_loop(&self) {
        let mut flush_buffer: Vec<u8> = Vec::with_capacity(LOG_BUFFER_SIZE);
        loop {
            let last_lsn = {
                let mut buffer = self.buffer.lock();
                if buffer.data.is_empty() && !buffer.stop {
                    let _ = self.flush_request.wait_for(&mut buffer, LOG_TIMEOUT);
                }
                if buffer.data.is_empty() {
                    if buffer.stop {
                        return;
                    }
                    continue;
                }
                flush_buffer.clear();
                std::mem::swap(&mut buffer.data, &mut flush_buffer);
                let last = buffer.last_lsn;
                buffer.last_lsn = Lsn::INVALID;
                // Room is available again; wake blocked appenders.
                self.flushed.notify_all();
                last
            };

            // Write outside the log latch so appends keep flowing.
            if let Err(e) = self.disk.write_log(&flush_buffer) {
                // Durability cannot continue without the log device.
                panic!("log flush failed: {}", e);
            }
            debug!("flushed log through {}", last_lsn);

            if last_lsn.is_valid() {
                self.persistent_lsn.store(last_lsn.0, Ordering::SeqCst);
            }
            let _buffer = self.buffer.lock();
            self.flushed.notify_all();
        }
    }

    /// Appends a record, assigning its LSN. Blocks while the active
    /// buffer cannot fit the record.
    pub fn append(&self, record: &mut LogRecord) -> Lsn {
        let size = record.serialized_size();
        assert!(size <= LOG_BUFFER_SIZE, "log record exceeds log buffer");

        let mut buffer = self.buffer.lock();
        while buffer.data.len() + size > LOG_BUFFER_SIZE {
            self.flush_request.notify_all();
            let _ = self.flushed.wait_for(&mut buffer, LOG_TIMEOUT);
        }

        let lsn = Lsn(self.next_lsn.fetch_add(1, Ordering::SeqCst));
        record.lsn = lsn;
        record.serialize_into(&mut buffer.data);
        buffer.last_lsn = lsn;
        lsn
    }

    /// Blocks until the log is durable through `lsn`.
    pub fn force_flush(&self, lsn: Lsn) {
        if !lsn.is_valid() {
            return;
        }
        let mut buffer = self.buffer.lock();
        while self.persistent_lsn() < lsn {
            self.flush_request.notify_all();
            let _ = self.flushed.wait_for(&mut buffer, LOG_TIMEOUT);
        }
    }
}

impl WalFlush for LogManager {
    fn persistent_lsn(&self) -> Lsn {
        LogManager::persistent_lsn(self)
    }

    fn flush_to(&self, lsn: Lsn) {
        self.force_flush(lsn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogPayload, LogRecord};
    use marrow_common::{PageId, Rid, Tuple, TxnId};
    use tempfile::tempdir;

    fn create_manager() -> (tempfile::TempDir, Arc<DiskManager>, Arc<LogManager>) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(
            DiskManager::new(dir.path().join("test.db"), dir.path().join("test.log"))
                .unwrap(),
        );
        let manager = LogManager::new(Arc::clone(&disk), Lsn(0));
        (dir, disk, manager)
    }

    #[test]
    fn test_append_assigns_increasing_lsns() {
        let (_dir, _disk, manager) = create_manager();

        let mut r0 = LogRecord::new(TxnId(0), Lsn::INVALID, LogPayload::Begin);
        let mut r1 = LogRecord::new(TxnId(0), Lsn(1), LogPayload::Commit);
        assert_eq!(manager.append(&mut r0), Lsn(1));
        assert_eq!(manager.append(&mut r1), Lsn(2));
        assert_eq!(manager.next_lsn(), Lsn(3));
    }

    #[test]
    fn test_force_flush_makes_records_durable() {
        let (_dir, disk, manager) = create_manager();
        manager.run_flush_thread();

        let mut record = LogRecord::new(TxnId(1), Lsn::INVALID, LogPayload::Begin);
        let lsn = manager.append(&mut record);
        manager.force_flush(lsn);

        assert!(manager.persistent_lsn() >= lsn);
        assert_eq!(disk.log_size().unwrap() as usize, record.serialized_size());

        manager.stop_flush_thread();
    }

    #[test]
    fn test_records_durable_in_lsn_order() {
        let (_dir, disk, manager) = create_manager();
        manager.run_flush_thread();

        let mut last = Lsn::INVALID;
        for i in 0..20 {
            let mut record = LogRecord::new(
                TxnId(1),
                last,
                LogPayload::Insert {
                    rid: Rid::new(PageId(1), i),
                    tuple: Tuple::new(vec![i as u8; 16]),
                },
            );
            last = manager.append(&mut record);
        }
        manager.force_flush(last);
        manager.stop_flush_thread();

        let mut buf = vec![0u8; LOG_BUFFER_SIZE];
        let n = disk.read_log(&mut buf, 0).unwrap();
        let mut offset = 0;
        let mut expected = 1;
        while offset < n {
            let record = LogRecord::deserialize(&buf[offset..n]).unwrap();
            assert_eq!(record.lsn, Lsn(expected));
            offset += record.serialized_size();
            expected += 1;
        }
        assert_eq!(expected, 21);
    }

    #[test]
    fn test_full_buffer_blocks_and_drains() {
        let (_dir, _disk, manager) = create_manager();
        manager.run_flush_thread();

        // Well over one buffer's worth of records.
        let payload = vec![7u8; 1024];
        let mut last = Lsn::INVALID;
        for i in 0..(2 * LOG_BUFFER_SIZE / 1024) {
            let mut record = LogRecord::new(
                TxnId(1),
                last,
                LogPayload::Insert {
                    rid: Rid::new(PageId(1), i as u32),
                    tuple: Tuple::new(payload.clone()),
                },
            );
            last = manager.append(&mut record);
        }
        manager.force_flush(last);
        assert!(manager.persistent_lsn() >= last);

        manager.stop_flush_thread();
    }

    #[test]
    fn test_stop_drains_pending_records() {
        let (_dir, disk, manager) = create_manager();
        manager.run_flush_thread();

        let mut record = LogRecord::new(TxnId(1), Lsn::INVALID, LogPayload::Begin);
        manager.append(&mut record);
        manager.stop_flush_thread();

        assert_eq!(disk.log_size().unwrap() as usize, record.serialized_size());
    }

    #[test]
    fn test_next_lsn_continues_after_reopen() {
        let (_dir, disk, _old) = create_manager();
        let manager = LogManager::new(disk, Lsn(42));
        assert_eq!(manager.next_lsn(), Lsn(42));
        assert_eq!(manager.persistent_lsn(), Lsn(41));
    }
}
