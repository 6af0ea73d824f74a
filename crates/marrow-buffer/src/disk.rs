//! Disk manager: page-granular database file I/O and log file access.

use marrow_common::{PageId, Result, PAGE_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

/// Manages reading and writing fixed-size pages in the database file
/// and append/read access to the write-ahead log file.
pub struct DiskManager {
    /// Database file handle.
    db_file: Mutex<File>,
    /// Log file handle.
    log_file: Mutex<File>,
    /// Next page number to hand out.
    next_page_id: AtomicI32,
    /// Path to the database file.
    db_path: PathBuf,
}

impl DiskManager {
    /// Opens (or creates) the database and log files.
    pub fn new(db_path: impl AsRef<Path>, log_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&db_path)?;
        let log_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(log_path.as_ref())?;

        let db_size = db_file.metadata()?.len();
        let next_page_id = (db_size / PAGE_SIZE as u64) as i32;

        Ok(Self {
            db_file: Mutex::new(db_file),
            log_file: Mutex::new(log_file),
            next_page_id: AtomicI32::new(next_page_id),
            db_path,
        })
    }

    /// Returns the path to the database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Allocates a fresh page number.
    pub fn allocate_page(&self) -> PageId {
        PageId(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Releases a page number.
    ///
    /// Freed pages are not recycled; the id simply becomes unreachable.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Advances the allocator past `page_id` (recovery replays pages
    /// the allocator has not seen when the file tail was never
    /// written).
    pub fn ensure_allocated(&self, page_id: PageId) {
        if page_id.is_valid() {
            self.next_page_id.fetch_max(page_id.0 + 1, Ordering::SeqCst);
        }
    }

    /// Returns the number of pages allocated so far.
    pub fn num_pages(&self) -> i32 {
        self.next_page_id.load(Ordering::SeqCst)
    }

    /// Reads a page from the database file.
    ///
    /// A page that was allocated but never written reads back as zeroes.
    pub fn read_page(&self, page_id: PageId) -> Result<Box<[u8; PAGE_SIZE]>> {
        let mut buffer = Box::new([0u8; PAGE_SIZE]);
        let mut file = self.db_file.lock();

        let file_len = file.metadata()?.len();
        if page_id.offset() >= file_len {
            return Ok(buffer);
        }

        file.seek(SeekFrom::Start(page_id.offset()))?;
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = file.read(&mut buffer[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(buffer)
    }

    /// Writes a page to the database file.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(page_id.offset()))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Appends bytes to the log file and syncs them to stable storage.
    pub fn write_log(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut file = self.log_file.lock();
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Reads log bytes starting at the given offset.
    ///
    /// Returns the number of bytes read; 0 signals end of log.
    pub fn read_log(&self, buffer: &mut [u8], offset: u64) -> Result<usize> {
        let mut file = self.log_file.lock();
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(0);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buffer.len() {
            let n = file.read(&mut buffer[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    /// Returns the size of the log file in bytes.
    pub fn log_size(&self) -> Result<u64> {
        Ok(self.log_file.lock().metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_disk() -> (tempfile::TempDir, DiskManager) {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(dir.path().join("test.db"), dir.path().join("test.log"))
            .unwrap();
        (dir, disk)
    }

    #[test]
    fn test_allocate_pages() {
        let (_dir, disk) = create_disk();

        assert_eq!(disk.allocate_page(), PageId(0));
        assert_eq!(disk.allocate_page(), PageId(1));
        assert_eq!(disk.num_pages(), 2);
    }

    #[test]
    fn test_page_roundtrip() {
        let (_dir, disk) = create_disk();

        let page_id = disk.allocate_page();
        let mut data = Box::new([0u8; PAGE_SIZE]);
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xCD;
        disk.write_page(page_id, &data).unwrap();

        let read = disk.read_page(page_id).unwrap();
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn test_read_unwritten_page_is_zeroed() {
        let (_dir, disk) = create_disk();

        let page_id = disk.allocate_page();
        let read = disk.read_page(page_id).unwrap();
        assert!(read.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_allocation_survives_reopen() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        let log = dir.path().join("test.log");

        {
            let disk = DiskManager::new(&db, &log).unwrap();
            let p0 = disk.allocate_page();
            let p1 = disk.allocate_page();
            disk.write_page(p0, &[1u8; PAGE_SIZE]).unwrap();
            disk.write_page(p1, &[2u8; PAGE_SIZE]).unwrap();
        }

        let disk = DiskManager::new(&db, &log).unwrap();
        assert_eq!(disk.num_pages(), 2);
        assert_eq!(disk.allocate_page(), PageId(2));
    }

    #[test]
    fn test_log_append_and_read() {
        let (_dir, disk) = create_disk();

        disk.write_log(b"hello ").unwrap();
        disk.write_log(b"world").unwrap();
        assert_eq!(disk.log_size().unwrap(), 11);

        let mut buf = [0u8; 32];
        let n = disk.read_log(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello world");

        let n = disk.read_log(&mut buf, 6).unwrap();
        assert_eq!(&buf[..n], b"world");

        assert_eq!(disk.read_log(&mut buf, 11).unwrap(), 0);
    }
}
