//! Buffer pool manager.

use crate::disk::DiskManager;
use crate::hash_table::ExtendibleHashTable;
use crate::page::{FrameId, Page};
use crate::replacer::{LruReplacer, Replacer};
use log::trace;
use marrow_common::{Lsn, MarrowError, PageId, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Bucket capacity for the page table when none is configured.
pub const DEFAULT_PAGE_TABLE_BUCKET_SIZE: usize = 64;

/// Seam to the log manager for the WAL rule: a dirty page must not
/// reach disk before every log record it reflects is durable.
pub trait WalFlush: Send + Sync {
    /// LSN up to which the log is known durable.
    fn persistent_lsn(&self) -> Lsn;

    /// Blocks until the log is durable through `lsn`.
    fn flush_to(&self, lsn: Lsn);
}

/// Buffer pool manager.
///
/// Owns a fixed set of frames, maps resident pages through an
/// extendible hash page table, hands out pinned pages, and evicts
/// unpinned pages in LRU order, honoring the WAL rule on dirty
/// write-back.
pub struct BufferPoolManager {
    /// Fixed array of frames.
    frames: Vec<Arc<Page>>,
    /// Page table: resident page id -> frame id.
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// Frames never used or freed by delete_page.
    free_list: Mutex<Vec<FrameId>>,
    /// Eviction policy over unpinned frames.
    replacer: LruReplacer,
    /// Backing storage.
    disk: Arc<DiskManager>,
    /// Log manager hook, installed once logging is up.
    wal: RwLock<Option<Arc<dyn WalFlush>>>,
    /// Serializes structural changes (frame <-> page bindings).
    latch: Mutex<()>,
}

impl BufferPoolManager {
    /// Creates a pool with the given number of frames.
    pub fn new(num_frames: usize, disk: Arc<DiskManager>, bucket_size: usize) -> Self {
        let frames: Vec<_> = (0..num_frames).map(|_| Arc::new(Page::new())).collect();
        let free_list: Vec<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        Self {
            frames,
            page_table: ExtendibleHashTable::new(bucket_size),
            free_list: Mutex::new(free_list),
            replacer: LruReplacer::new(num_frames),
            disk,
            wal: RwLock::new(None),
            latch: Mutex::new(()),
        }
    }

    /// Installs the log manager hook enforcing the WAL rule.
    pub fn set_wal(&self, wal: Arc<dyn WalFlush>) {
        *self.wal.write() = Some(wal);
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the backing disk manager.
    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Writes a frame's content to disk, flushing the log first if the
    /// page carries effects beyond the durable LSN.
    fn write_back(&self, frame: &Page) -> Result<()> {
        let page_lsn = frame.lsn();
        if page_lsn.is_valid() {
            let wal = self.wal.read().clone();
            if let Some(wal) = wal {
                if page_lsn > wal.persistent_lsn() {
                    trace!("forcing log to {} before writing {}", page_lsn, frame.page_id());
                    wal.flush_to(page_lsn);
                }
            }
        }
        let data = frame.read_latch();
        self.disk.write_page(frame.page_id(), &data)?;
        Ok(())
    }

    /// Claims a frame for a new binding: free list first, else evict.
    ///
    /// Caller must hold the pool latch.
    fn claim_frame(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop() {
            return Ok(frame_id);
        }

        let victim_id = self.replacer.evict().ok_or(MarrowError::BufferPoolFull)?;
        let frame = &self.frames[victim_id.0 as usize];
        debug_assert!(!frame.is_pinned());

        if frame.is_dirty() {
            self.write_back(frame)?;
        }
        self.page_table.remove(&frame.page_id());
        frame.reset();
        Ok(victim_id)
    }

    /// Fetches a page, reading it from disk if not resident.
    ///
    /// The returned page is pinned; callers must balance with
    /// `unpin_page`.
    pub fn fetch_page(&self, page_id: PageId) -> Result<Arc<Page>> {
        debug_assert!(page_id.is_valid());
        let _guard = self.latch.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.set_evictable(frame_id, false);
            return Ok(Arc::clone(frame));
        }

        let frame_id = self.claim_frame()?;
        let frame = &self.frames[frame_id.0 as usize];

        let data = self.disk.read_page(page_id)?;
        frame.write_latch().copy_from_slice(&data[..]);
        frame.set_page_id(page_id);
        frame.pin();
        self.page_table.insert(page_id, frame_id);
        Ok(Arc::clone(frame))
    }

    /// Allocates a fresh page and pins a zeroed frame for it.
    pub fn new_page(&self) -> Result<Arc<Page>> {
        let _guard = self.latch.lock();

        let frame_id = self.claim_frame()?;
        let frame = &self.frames[frame_id.0 as usize];

        let page_id = self.disk.allocate_page();
        frame.set_page_id(page_id);
        frame.pin();
        self.page_table.insert(page_id, frame_id);
        Ok(Arc::clone(frame))
    }

    /// Releases one pin on a page, optionally marking it dirty.
    ///
    /// Returns false if the page is not resident.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _guard = self.latch.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if is_dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Flushes a page to disk if resident and dirty.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let _guard = self.latch.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[frame_id.0 as usize];
        if !frame.is_dirty() {
            return Ok(false);
        }
        self.write_back(frame)?;
        frame.set_dirty(false);
        Ok(true)
    }

    /// Flushes every dirty resident page. Returns the count flushed.
    pub fn flush_all(&self) -> Result<usize> {
        let _guard = self.latch.lock();

        let mut resident = Vec::new();
        self.page_table.for_each(|_, frame_id| {
            resident.push(*frame_id);
        });

        let mut flushed = 0;
        for frame_id in resident {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                self.write_back(frame)?;
                frame.set_dirty(false);
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Drops a page from the pool and deallocates it.
    ///
    /// Returns false if the page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let _guard = self.latch.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            // Not resident; only the allocator needs to know.
            self.disk.deallocate_page(page_id);
            return Ok(true);
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.is_pinned() {
            return Ok(false);
        }

        self.page_table.remove(&page_id);
        self.replacer.remove(frame_id);
        frame.reset();
        self.free_list.lock().push(frame_id);
        self.disk.deallocate_page(page_id);
        Ok(true)
    }
}
