//! In-memory page frames.

use marrow_common::{Lsn, PageId, PAGE_SIZE};
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

/// Unique identifier for a frame in the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// The raw byte content of a page.
pub type PageData = Box<[u8; PAGE_SIZE]>;

/// Owned shared latch on a page's data.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, PageData>;

/// Owned exclusive latch on a page's data.
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, PageData>;

/// A buffer pool frame holding one page.
///
/// The reader/writer latch lives on the data itself; latch guards are
/// owned (`Arc`-backed) so an index operation can hold latches on a
/// whole root-to-leaf path at once. The pin count keeps the frame from
/// being evicted while any such guard may still be taken.
pub struct Page {
    /// Page currently held by this frame.
    page_id: AtomicI32,
    /// Page content, behind the page latch.
    data: Arc<RwLock<PageData>>,
    /// Number of users currently holding this page.
    pin_count: AtomicU32,
    /// Whether the content diverges from disk.
    is_dirty: AtomicBool,
    /// LSN of the latest log record applied to this page.
    lsn: AtomicI32,
}

impl Page {
    /// Creates a new empty frame.
    pub fn new() -> Self {
        Self {
            page_id: AtomicI32::new(PageId::INVALID.0),
            data: Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            lsn: AtomicI32::new(Lsn::INVALID.0),
        }
    }

    /// Returns the page held by this frame.
    pub fn page_id(&self) -> PageId {
        PageId(self.page_id.load(Ordering::Acquire))
    }

    pub(crate) fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.0, Ordering::Release);
    }

    /// Returns the current pin count.
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Returns true if any user holds this page.
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the pin count, returning the new value.
    pub(crate) fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Underflow protection: restore to 0.
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    /// Returns true if the page content diverges from disk.
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// Marks the page dirty or clean.
    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Returns the LSN of the latest log record applied to this page.
    pub fn lsn(&self) -> Lsn {
        Lsn(self.lsn.load(Ordering::Acquire))
    }

    /// Records the LSN of the latest log record applied to this page.
    pub fn set_lsn(&self, lsn: Lsn) {
        self.lsn.store(lsn.0, Ordering::Release);
    }

    /// Acquires the page latch in shared mode.
    pub fn read_latch(&self) -> PageReadGuard {
        self.data.read_arc()
    }

    /// Acquires the page latch in exclusive mode.
    pub fn write_latch(&self) -> PageWriteGuard {
        self.data.write_arc()
    }

    /// Resets the frame for reuse.
    ///
    /// Caller must hold the pool latch and ensure the frame is unpinned.
    pub(crate) fn reset(&self) {
        self.page_id.store(PageId::INVALID.0, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.lsn.store(Lsn::INVALID.0, Ordering::Release);
        self.data.write().fill(0);
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .field("lsn", &self.lsn())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_page_is_empty() {
        let page = Page::new();
        assert_eq!(page.page_id(), PageId::INVALID);
        assert_eq!(page.pin_count(), 0);
        assert!(!page.is_dirty());
        assert_eq!(page.lsn(), Lsn::INVALID);
    }

    #[test]
    fn test_pin_unpin() {
        let page = Page::new();

        page.pin();
        page.pin();
        assert_eq!(page.pin_count(), 2);
        assert!(page.is_pinned());

        assert_eq!(page.unpin(), 1);
        assert_eq!(page.unpin(), 0);
        assert!(!page.is_pinned());

        // Underflow stays at 0.
        assert_eq!(page.unpin(), 0);
        assert_eq!(page.pin_count(), 0);
    }

    #[test]
    fn test_latch_roundtrip() {
        let page = Page::new();

        {
            let mut guard = page.write_latch();
            guard[0] = 0xAB;
            guard[100] = 0xCD;
        }

        let guard = page.read_latch();
        assert_eq!(guard[0], 0xAB);
        assert_eq!(guard[100], 0xCD);
    }

    #[test]
    fn test_concurrent_readers() {
        let page = Page::new();
        let g1 = page.read_latch();
        let g2 = page.read_latch();
        assert_eq!(g1[0], g2[0]);
    }

    #[test]
    fn test_reset_clears_state() {
        let page = Page::new();
        page.set_page_id(PageId(9));
        page.pin();
        page.set_dirty(true);
        page.set_lsn(Lsn(42));
        page.write_latch()[0] = 0xFF;

        page.reset();

        assert_eq!(page.page_id(), PageId::INVALID);
        assert_eq!(page.pin_count(), 0);
        assert!(!page.is_dirty());
        assert_eq!(page.lsn(), Lsn::INVALID);
        assert_eq!(page.read_latch()[0], 0);
    }
}
