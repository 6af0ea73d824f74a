//! Slotted page layout for tuple storage.
//!
//! Layout:
//! ```text
//! +--------------------------------------------------+ 0
//! | page_id(i32) | lsn(i32) | prev(i32) | next(i32)  |
//! | free_space_pointer(u32) | slot_count(u32)        |
//! +--------------------------------------------------+ 24
//! | slot array: [offset(u32), size(u32)] * n         |  -> grows forward
//! +--------------------------------------------------+
//! |                free space                        |
//! +--------------------------------------------------+ free_space_pointer
//! | tuple data                                       |  -> grows backward
//! +--------------------------------------------------+ PAGE_SIZE
//! ```
//!
//! A mark-deleted tuple keeps its bytes but carries the delete bit in
//! its slot size; a free slot has offset 0 and may be reused.

use marrow_common::{Lsn, PageId, Tuple, PAGE_SIZE};

/// Byte offset of the slot array.
const HEADER_SIZE: usize = 24;

/// Bytes per slot entry.
const SLOT_SIZE: usize = 8;

/// Delete mark carried in the slot size.
const DELETE_MASK: u32 = 1 << 31;

/// Read-only view over the bytes of one slotted tuple page.
#[derive(Clone, Copy)]
pub struct TablePageRef<'a> {
    data: &'a [u8],
}

impl<'a> TablePageRef<'a> {
    /// Wraps existing page bytes for reading.
    pub fn new(data: &'a [u8]) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    fn read_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    /// Page id stored in the header.
    pub fn page_id(&self) -> PageId {
        PageId(self.read_i32(0))
    }

    /// LSN of the latest log record applied to this page.
    pub fn lsn(&self) -> Lsn {
        Lsn(self.read_i32(4))
    }

    /// Previous page in the heap chain.
    pub fn prev_page_id(&self) -> PageId {
        PageId(self.read_i32(8))
    }

    /// Next page in the heap chain.
    pub fn next_page_id(&self) -> PageId {
        PageId(self.read_i32(12))
    }

    fn free_space_pointer(&self) -> u32 {
        self.read_u32(16)
    }

    /// Number of slots, free slots included.
    pub fn slot_count(&self) -> u32 {
        self.read_u32(20)
    }

    fn slot_offset(slot: u32) -> usize {
        HEADER_SIZE + slot as usize * SLOT_SIZE
    }

    fn slot(&self, slot: u32) -> (u32, u32) {
        let base = Self::slot_offset(slot);
        (self.read_u32(base), self.read_u32(base + 4))
    }

    /// Bytes free between the slot array and the tuple data.
    pub fn free_space(&self) -> usize {
        let slots_end = HEADER_SIZE + self.slot_count() as usize * SLOT_SIZE;
        self.free_space_pointer() as usize - slots_end
    }

    /// Returns true if the bytes have been formatted as a table page
    /// (a never-written page reads back all zeroes).
    pub fn is_initialized(&self) -> bool {
        self.free_space_pointer() as usize >= HEADER_SIZE
    }

    /// Returns true if the slot carries the delete mark.
    pub fn is_marked_deleted(&self, slot: u32) -> bool {
        if slot >= self.slot_count() {
            return false;
        }
        let (offset, size) = self.slot(slot);
        offset != 0 && size & DELETE_MASK != 0
    }

    /// Reads the visible tuple at a slot (None if free or marked).
    pub fn get_tuple(&self, slot: u32) -> Option<Tuple> {
        if slot >= self.slot_count() {
            return None;
        }
        let (offset, size) = self.slot(slot);
        if offset == 0 || size & DELETE_MASK != 0 {
            return None;
        }
        let start = offset as usize;
        Some(Tuple::new(self.data[start..start + size as usize].to_vec()))
    }

    /// Reads the tuple at a slot even if it is mark-deleted.
    pub fn raw_tuple(&self, slot: u32) -> Option<Tuple> {
        if slot >= self.slot_count() {
            return None;
        }
        let (offset, size) = self.slot(slot);
        if offset == 0 {
            return None;
        }
        let start = offset as usize;
        let len = (size & !DELETE_MASK) as usize;
        Some(Tuple::new(self.data[start..start + len].to_vec()))
    }
}

/// Mutable view over the bytes of one slotted tuple page.
pub struct TablePage<'a> {
    data: &'a mut [u8],
}

impl<'a> TablePage<'a> {
    /// Wraps existing page bytes.
    pub fn new(data: &'a mut [u8]) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    /// Formats the bytes as an empty page.
    pub fn init(data: &'a mut [u8], page_id: PageId, prev_page_id: PageId) -> Self {
        data.fill(0);
        let mut page = Self::new(data);
        page.write_i32(0, page_id.0);
        page.write_i32(4, Lsn::INVALID.0);
        page.write_i32(8, prev_page_id.0);
        page.write_i32(12, PageId::INVALID.0);
        page.write_u32(16, PAGE_SIZE as u32);
        page.write_u32(20, 0);
        page
    }

    /// Read-only view of the same bytes.
    pub fn view(&self) -> TablePageRef<'_> {
        TablePageRef { data: self.data }
    }

    fn write_i32(&mut self, offset: usize, value: i32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Page id stored in the header.
    pub fn page_id(&self) -> PageId {
        self.view().page_id()
    }

    /// LSN of the latest log record applied to this page.
    pub fn lsn(&self) -> Lsn {
        self.view().lsn()
    }

    /// Stamps the page LSN.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.write_i32(4, lsn.0);
    }

    /// Previous page in the heap chain.
    pub fn prev_page_id(&self) -> PageId {
        self.view().prev_page_id()
    }

    /// Next page in the heap chain.
    pub fn next_page_id(&self) -> PageId {
        self.view().next_page_id()
    }

    /// Links the next page in the heap chain.
    pub fn set_next_page_id(&mut self, page_id: PageId) {
        self.write_i32(12, page_id.0);
    }

    fn free_space_pointer(&self) -> u32 {
        self.view().free_space_pointer()
    }

    fn set_free_space_pointer(&mut self, value: u32) {
        self.write_u32(16, value);
    }

    /// Returns true if the bytes have been formatted as a table page.
    pub fn is_initialized(&self) -> bool {
        self.view().is_initialized()
    }

    /// Number of slots, free slots included.
    pub fn slot_count(&self) -> u32 {
        self.view().slot_count()
    }

    fn set_slot_count(&mut self, value: u32) {
        self.write_u32(20, value);
    }

    fn slot(&self, slot: u32) -> (u32, u32) {
        self.view().slot(slot)
    }

    fn set_slot(&mut self, slot: u32, offset: u32, size: u32) {
        let base = TablePageRef::slot_offset(slot);
        self.write_u32(base, offset);
        self.write_u32(base + 4, size);
    }

    /// Bytes free between the slot array and the tuple data.
    pub fn free_space(&self) -> usize {
        self.view().free_space()
    }

    fn find_free_slot(&self) -> Option<u32> {
        (0..self.slot_count()).find(|&s| self.slot(s).0 == 0)
    }

    /// Returns true if the slot carries the delete mark.
    pub fn is_marked_deleted(&self, slot: u32) -> bool {
        self.view().is_marked_deleted(slot)
    }

    /// Reads the visible tuple at a slot (None if free or marked).
    pub fn get_tuple(&self, slot: u32) -> Option<Tuple> {
        self.view().get_tuple(slot)
    }

    /// Reads the tuple at a slot even if it is mark-deleted.
    pub fn raw_tuple(&self, slot: u32) -> Option<Tuple> {
        self.view().raw_tuple(slot)
    }

    /// Inserts a tuple, reusing a free slot when one exists.
    ///
    /// Returns the slot, or None if the page lacks space.
    pub fn insert_tuple(&mut self, tuple: &Tuple) -> Option<u32> {
        let reuse = self.find_free_slot();
        let needed = tuple.len() + if reuse.is_some() { 0 } else { SLOT_SIZE };
        if self.free_space() < needed {
            return None;
        }

        let slot = match reuse {
            Some(slot) => slot,
            None => {
                let slot = self.slot_count();
                self.set_slot_count(slot + 1);
                slot
            }
        };
        self.place(slot, tuple);
        Some(slot)
    }

    /// Inserts a tuple at a specific slot (recovery redo), extending
    /// the slot array as needed.
    pub fn insert_tuple_at(&mut self, slot: u32, tuple: &Tuple) -> bool {
        let new_slots = (slot + 1).saturating_sub(self.slot_count()) as usize;
        if self.free_space() < tuple.len() + new_slots * SLOT_SIZE {
            return false;
        }
        if new_slots > 0 {
            let old_count = self.slot_count();
            self.set_slot_count(slot + 1);
            for s in old_count..slot {
                self.set_slot(s, 0, 0);
            }
        } else if self.slot(slot).0 != 0 {
            return false;
        }
        self.place(slot, tuple);
        true
    }

    fn place(&mut self, slot: u32, tuple: &Tuple) {
        let fsp = self.free_space_pointer() as usize - tuple.len();
        self.data[fsp..fsp + tuple.len()].copy_from_slice(tuple.data());
        self.set_free_space_pointer(fsp as u32);
        self.set_slot(slot, fsp as u32, tuple.len() as u32);
    }

    /// Sets the delete mark on a tuple. False if free or already marked.
    pub fn mark_delete(&mut self, slot: u32) -> bool {
        if slot >= self.slot_count() {
            return false;
        }
        let (offset, size) = self.slot(slot);
        if offset == 0 || size & DELETE_MASK != 0 {
            return false;
        }
        self.set_slot(slot, offset, size | DELETE_MASK);
        true
    }

    /// Clears the delete mark. False if the slot is free or unmarked.
    pub fn rollback_delete(&mut self, slot: u32) -> bool {
        if slot >= self.slot_count() {
            return false;
        }
        let (offset, size) = self.slot(slot);
        if offset == 0 || size & DELETE_MASK == 0 {
            return false;
        }
        self.set_slot(slot, offset, size & !DELETE_MASK);
        true
    }

    /// Physically removes the tuple, compacting the data region and
    /// freeing the slot. Returns the removed image.
    pub fn apply_delete(&mut self, slot: u32) -> Option<Tuple> {
        if slot >= self.slot_count() {
            return None;
        }
        let (offset, raw_size) = self.slot(slot);
        if offset == 0 {
            return None;
        }
        let size = raw_size & !DELETE_MASK;
        let removed = self.raw_tuple(slot)?;

        self.compact_out(offset, size);
        self.set_slot(slot, 0, 0);
        Some(removed)
    }

    /// Overwrites the tuple at a slot. False when the page cannot
    /// hold the new image.
    pub fn update_tuple(&mut self, slot: u32, tuple: &Tuple) -> bool {
        if slot >= self.slot_count() {
            return false;
        }
        let (offset, raw_size) = self.slot(slot);
        if offset == 0 || raw_size & DELETE_MASK != 0 {
            return false;
        }
        let size = raw_size & !DELETE_MASK;

        if tuple.len() as u32 <= size {
            // Keep the region end fixed; the slack becomes a hole at
            // the region start and is compacted away.
            let slack = size - tuple.len() as u32;
            let start = (offset + slack) as usize;
            self.data[start..start + tuple.len()].copy_from_slice(tuple.data());
            self.compact_out(offset, slack);
            self.set_slot(slot, offset + slack, tuple.len() as u32);
            return true;
        }

        let growth = tuple.len() - size as usize;
        if self.free_space() < growth {
            return false;
        }
        self.compact_out(offset, size);
        self.place(slot, tuple);
        true
    }

    /// Shifts the data region to close a hole `[offset, offset+size)`,
    /// fixing affected slot offsets.
    fn compact_out(&mut self, offset: u32, size: u32) {
        if size == 0 {
            return;
        }
        let fsp = self.free_space_pointer();
        let hole_start = offset as usize;
        self.data
            .copy_within(fsp as usize..hole_start, fsp as usize + size as usize);
        self.set_free_space_pointer(fsp + size);

        for s in 0..self.slot_count() {
            let (s_offset, s_size) = self.slot(s);
            if s_offset != 0 && s_offset < offset {
                self.set_slot(s, s_offset + size, s_size);
            }
        }
    }
}
