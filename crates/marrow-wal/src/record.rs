//! Log record wire format.
//!
//! Every record starts with a 20-byte little-endian header:
//! `size(i32) | lsn(i32) | txn_id(i32) | prev_lsn(i32) | type(i32)`,
//! followed by a type-specific payload. Tuples are serialized with a
//! 4-byte length prefix; RIDs as `page_id(i32) | slot(u32)`.

use bytes::{Buf, BufMut};
use marrow_common::{Lsn, PageId, Rid, Tuple, TxnId};

/// Record types, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LogRecordType {
    Invalid = 0,
    Insert = 1,
    MarkDelete = 2,
    ApplyDelete = 3,
    RollbackDelete = 4,
    Update = 5,
    Begin = 6,
    Commit = 7,
    Abort = 8,
    NewPage = 9,
}

impl LogRecordType {
    fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Invalid),
            1 => Some(Self::Insert),
            2 => Some(Self::MarkDelete),
            3 => Some(Self::ApplyDelete),
            4 => Some(Self::RollbackDelete),
            5 => Some(Self::Update),
            6 => Some(Self::Begin),
            7 => Some(Self::Commit),
            8 => Some(Self::Abort),
            9 => Some(Self::NewPage),
            _ => None,
        }
    }
}

/// Type-specific record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    Insert { rid: Rid, tuple: Tuple },
    ApplyDelete { rid: Rid, tuple: Tuple },
    MarkDelete { rid: Rid },
    RollbackDelete { rid: Rid },
    Update { rid: Rid, old: Tuple, new: Tuple },
    NewPage { prev_page_id: PageId, page_id: PageId },
}

impl LogPayload {
    fn record_type(&self) -> LogRecordType {
        match self {
            LogPayload::Begin => LogRecordType::Begin,
            LogPayload::Commit => LogRecordType::Commit,
            LogPayload::Abort => LogRecordType::Abort,
            LogPayload::Insert { .. } => LogRecordType::Insert,
            LogPayload::ApplyDelete { .. } => LogRecordType::ApplyDelete,
            LogPayload::MarkDelete { .. } => LogRecordType::MarkDelete,
            LogPayload::RollbackDelete { .. } => LogRecordType::RollbackDelete,
            LogPayload::Update { .. } => LogRecordType::Update,
            LogPayload::NewPage { .. } => LogRecordType::NewPage,
        }
    }

    fn serialized_size(&self) -> usize {
        match self {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => 0,
            LogPayload::Insert { tuple, .. } | LogPayload::ApplyDelete { tuple, .. } => {
                Rid::SERIALIZED_SIZE + tuple.serialized_size()
            }
            LogPayload::MarkDelete { .. } | LogPayload::RollbackDelete { .. } => {
                Rid::SERIALIZED_SIZE
            }
            LogPayload::Update { old, new, .. } => {
                Rid::SERIALIZED_SIZE + old.serialized_size() + new.serialized_size()
            }
            LogPayload::NewPage { .. } => 8,
        }
    }
}

/// A single write-ahead log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Assigned by the log manager on append.
    pub lsn: Lsn,
    /// Transaction this record belongs to.
    pub txn_id: TxnId,
    /// Previous record in this transaction's chain.
    pub prev_lsn: Lsn,
    /// Type-specific payload.
    pub payload: LogPayload,
}

impl LogRecord {
    /// Size of the record header in bytes.
    pub const HEADER_SIZE: usize = 20;

    /// Creates a record with an unassigned LSN.
    pub fn new(txn_id: TxnId, prev_lsn: Lsn, payload: LogPayload) -> Self {
        Self {
            lsn: Lsn::INVALID,
            txn_id,
            prev_lsn,
            payload,
        }
    }

    /// Returns this record's type code.
    pub fn record_type(&self) -> LogRecordType {
        self.payload.record_type()
    }

    /// Total serialized size, header included.
    pub fn serialized_size(&self) -> usize {
        Self::HEADER_SIZE + self.payload.serialized_size()
    }

    /// Serializes this record into the buffer.
    pub fn serialize_into(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.serialized_size() as i32);
        buf.put_i32_le(self.lsn.0);
        buf.put_i32_le(self.txn_id.0);
        buf.put_i32_le(self.prev_lsn.0);
        buf.put_i32_le(self.record_type() as i32);

        match &self.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => {}
            LogPayload::Insert { rid, tuple } | LogPayload::ApplyDelete { rid, tuple } => {
                buf.put_i32_le(rid.page_id.0);
                buf.put_u32_le(rid.slot);
                buf.put_u32_le(tuple.len() as u32);
                buf.put_slice(tuple.data());
            }
            LogPayload::MarkDelete { rid } | LogPayload::RollbackDelete { rid } => {
                buf.put_i32_le(rid.page_id.0);
                buf.put_u32_le(rid.slot);
            }
            LogPayload::Update { rid, old, new } => {
                buf.put_i32_le(rid.page_id.0);
                buf.put_u32_le(rid.slot);
                buf.put_u32_le(old.len() as u32);
                buf.put_slice(old.data());
                buf.put_u32_le(new.len() as u32);
                buf.put_slice(new.data());
            }
            LogPayload::NewPage {
                prev_page_id,
                page_id,
            } => {
                buf.put_i32_le(prev_page_id.0);
                buf.put_i32_le(page_id.0);
            }
        }
    }

    /// Deserializes one record from the front of the buffer.
    ///
    /// Returns None when the buffer holds no complete, valid record
    /// (truncated chunk, zeroed tail, or unknown type).
    pub fn deserialize(buf: &[u8]) -> Option<LogRecord> {
        if buf.len() < Self::HEADER_SIZE {
            return None;
        }
        let mut cursor = buf;
        let size = cursor.get_i32_le();
        if size < Self::HEADER_SIZE as i32 || size as usize > buf.len() {
            return None;
        }
        let lsn = Lsn(cursor.get_i32_le());
        let txn_id = TxnId(cursor.get_i32_le());
        let prev_lsn = Lsn(cursor.get_i32_le());
        let record_type = LogRecordType::from_i32(cursor.get_i32_le())?;

        let payload = match record_type {
            LogRecordType::Invalid => return None,
            LogRecordType::Begin => LogPayload::Begin,
            LogRecordType::Commit => LogPayload::Commit,
            LogRecordType::Abort => LogPayload::Abort,
            LogRecordType::Insert => {
                let rid = Rid::deserialize_from(&mut cursor)?;
                let tuple = Tuple::deserialize_from(&mut cursor)?;
                LogPayload::Insert { rid, tuple }
            }
            LogRecordType::ApplyDelete => {
                let rid = Rid::deserialize_from(&mut cursor)?;
                let tuple = Tuple::deserialize_from(&mut cursor)?;
                LogPayload::ApplyDelete { rid, tuple }
            }
            LogRecordType::MarkDelete => {
                let rid = Rid::deserialize_from(&mut cursor)?;
                LogPayload::MarkDelete { rid }
            }
            LogRecordType::RollbackDelete => {
                let rid = Rid::deserialize_from(&mut cursor)?;
                LogPayload::RollbackDelete { rid }
            }
            LogRecordType::Update => {
                let rid = Rid::deserialize_from(&mut cursor)?;
                let old = Tuple::deserialize_from(&mut cursor)?;
                let new = Tuple::deserialize_from(&mut cursor)?;
                LogPayload::Update { rid, old, new }
            }
            LogRecordType::NewPage => {
                if cursor.len() < 8 {
                    return None;
                }
                LogPayload::NewPage {
                    prev_page_id: PageId(cursor.get_i32_le()),
                    page_id: PageId(cursor.get_i32_le()),
                }
            }
        };

        let record = LogRecord {
            lsn,
            txn_id,
            prev_lsn,
            payload,
        };
        if record.serialized_size() != size as usize {
            return None;
        }
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(record: &LogRecord) -> LogRecord {
        let mut buf = BytesMut::new();
        record.serialize_into(&mut buf);
        assert_eq!(buf.len(), record.serialized_size());
        LogRecord::deserialize(&buf).expect("record should deserialize")
    }

    #[test]
    fn test_header_size_is_twenty_bytes() {
        let record = LogRecord::new(TxnId(1), Lsn::INVALID, LogPayload::Begin);
        assert_eq!(record.serialized_size(), 20);
    }

    #[test]
    fn test_begin_commit_abort_roundtrip() {
        for payload in [LogPayload::Begin, LogPayload::Commit, LogPayload::Abort] {
            let mut record = LogRecord::new(TxnId(3), Lsn(5), payload.clone());
            record.lsn = Lsn(6);
            let decoded = roundtrip(&record);
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn test_insert_roundtrip() {
        let mut record = LogRecord::new(
            TxnId(7),
            Lsn(1),
            LogPayload::Insert {
                rid: Rid::new(PageId(4), 2),
                tuple: Tuple::new(&b"row data"[..]),
            },
        );
        record.lsn = Lsn(2);
        assert_eq!(record.serialized_size(), 20 + 8 + 4 + 8);
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn test_mark_delete_carries_rid_only() {
        let mut record = LogRecord::new(
            TxnId(1),
            Lsn(0),
            LogPayload::MarkDelete {
                rid: Rid::new(PageId(9), 3),
            },
        );
        record.lsn = Lsn(1);
        assert_eq!(record.serialized_size(), 28);
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn test_update_roundtrip() {
        let mut record = LogRecord::new(
            TxnId(2),
            Lsn(10),
            LogPayload::Update {
                rid: Rid::new(PageId(1), 0),
                old: Tuple::new(&b"before"[..]),
                new: Tuple::new(&b"after!"[..]),
            },
        );
        record.lsn = Lsn(11);
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn test_new_page_roundtrip() {
        let mut record = LogRecord::new(
            TxnId(2),
            Lsn(0),
            LogPayload::NewPage {
                prev_page_id: PageId::INVALID,
                page_id: PageId(4),
            },
        );
        record.lsn = Lsn(1);
        assert_eq!(record.serialized_size(), 28);
        assert_eq!(roundtrip(&record), record);
    }

    #[test]
    fn test_deserialize_truncated_record() {
        let mut record = LogRecord::new(
            TxnId(1),
            Lsn(0),
            LogPayload::Insert {
                rid: Rid::new(PageId(1), 1),
                tuple: Tuple::new(&b"payload"[..]),
            },
        );
        record.lsn = Lsn(1);
        let mut buf = BytesMut::new();
        record.serialize_into(&mut buf);

        for cut in [1, LogRecord::HEADER_SIZE, buf.len() - 1] {
            assert!(LogRecord::deserialize(&buf[..cut]).is_none());
        }
    }

    #[test]
    fn test_deserialize_zeroed_tail() {
        assert!(LogRecord::deserialize(&[0u8; 64]).is_none());
    }

    #[test]
    fn test_sequential_records_in_buffer() {
        let mut buf = BytesMut::new();
        let mut records = Vec::new();
        for i in 0..3 {
            let mut record = LogRecord::new(TxnId(i), Lsn::INVALID, LogPayload::Begin);
            record.lsn = Lsn(i);
            record.serialize_into(&mut buf);
            records.push(record);
        }

        let mut offset = 0;
        for expected in &records {
            let decoded = LogRecord::deserialize(&buf[offset..]).unwrap();
            assert_eq!(&decoded, expected);
            offset += decoded.serialized_size();
        }
        assert_eq!(offset, buf.len());
    }
}
