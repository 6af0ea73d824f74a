//! Core identifier and value types shared across MarrowDB components.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4 * 1024;

/// Unique identifier for a page within the database file.
///
/// Page 0 is the header page; data and index pages follow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PageId(pub i32);

impl PageId {
    /// Invalid/unallocated page ID.
    pub const INVALID: PageId = PageId(-1);

    /// The header page holding (index name -> root page id) records.
    pub const HEADER: PageId = PageId(0);

    /// Returns true if this is a valid page ID.
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }

    /// Byte offset of this page within the database file.
    pub fn offset(&self) -> u64 {
        debug_assert!(self.is_valid());
        self.0 as u64 * PAGE_SIZE as u64
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page:{}", self.0)
    }
}

/// Log sequence number: monotonically increasing log record identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsn(pub i32);

impl Lsn {
    /// Invalid/uninitialized LSN.
    pub const INVALID: Lsn = Lsn(-1);

    /// Returns true if this is a valid LSN.
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// Transaction identifier. Strictly increasing; a smaller id is an
/// older transaction, which is what the wait-die rule compares.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxnId(pub i32);

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Record identifier: (page, slot) address of a tuple.
///
/// Used as the lock key in the lock manager and as the leaf value
/// type in indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    /// Page containing the tuple.
    pub page_id: PageId,
    /// Slot number within the page.
    pub slot: u32,
}

impl Rid {
    /// Serialized size on disk: page_id(i32) | slot(u32).
    pub const SERIALIZED_SIZE: usize = 8;

    /// Creates a new record ID.
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }

    /// Invalid record ID.
    pub const INVALID: Rid = Rid {
        page_id: PageId::INVALID,
        slot: u32::MAX,
    };

    /// Returns true if this is a valid record ID.
    pub fn is_valid(&self) -> bool {
        self.page_id.is_valid()
    }

    /// Serializes this RID into the buffer.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.page_id.0);
        buf.put_u32_le(self.slot);
    }

    /// Deserializes a RID from the front of the buffer.
    pub fn deserialize_from(buf: &mut &[u8]) -> Option<Self> {
        if buf.len() < Self::SERIALIZED_SIZE {
            return None;
        }
        let page_id = PageId(buf.get_i32_le());
        let slot = buf.get_u32_le();
        Some(Self { page_id, slot })
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_id.0, self.slot)
    }
}

/// A tuple (row) payload.
///
/// The engine treats tuple contents as opaque bytes; on the wire a
/// tuple is a 4-byte length prefix followed by its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    data: Bytes,
}

impl Tuple {
    /// Creates a tuple from raw bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// An empty tuple.
    pub fn empty() -> Self {
        Self { data: Bytes::new() }
    }

    /// Returns the tuple data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the length of the tuple data in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the tuple has no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Serialized size on disk: length prefix plus data.
    pub fn serialized_size(&self) -> usize {
        4 + self.data.len()
    }

    /// Serializes this tuple (length-prefixed) into the buffer.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    /// Deserializes a length-prefixed tuple from the front of the buffer.
    pub fn deserialize_from(buf: &mut &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        let len = buf.get_u32_le() as usize;
        if buf.len() < len {
            return None;
        }
        let data = Bytes::copy_from_slice(&buf[..len]);
        buf.advance(len);
        Some(Self { data })
    }
}
