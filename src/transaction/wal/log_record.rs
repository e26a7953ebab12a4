use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::common::types::{Lsn, PageId, Rid, TxnId, INVALID_LSN};

/// Types of log records in the write-ahead log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecordType {
    /// Marks the beginning of a transaction
    Begin = 1,
    /// Marks the successful completion of a transaction
    Commit = 2,
    /// Marks the rollback of a transaction
    Abort = 3,
    /// A tuple insert, with the after-image
    Insert = 4,
    /// A logical tuple delete, with the victim tuple
    MarkDelete = 5,
    /// A physical tuple delete, with the removed tuple
    ApplyDelete = 6,
    /// Reversal of a logical delete
    RollbackDelete = 7,
    /// A tuple update, with both images
    Update = 8,
    /// A fresh heap page linked after its predecessor
    NewPage = 9,
}

impl LogRecordType {
    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::Begin,
            2 => Self::Commit,
            3 => Self::Abort,
            4 => Self::Insert,
            5 => Self::MarkDelete,
            6 => Self::ApplyDelete,
            7 => Self::RollbackDelete,
            8 => Self::Update,
            9 => Self::NewPage,
            _ => return None,
        })
    }
}

/// Type-specific payload of a log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecordBody {
    /// BEGIN / COMMIT / ABORT carry only the header
    None,
    /// INSERT and the three DELETE flavors: the affected tuple
    TupleOp { rid: Rid, tuple: Vec<u8> },
    /// UPDATE: before- and after-images
    Update {
        rid: Rid,
        old_tuple: Vec<u8>,
        new_tuple: Vec<u8>,
    },
    /// NEWPAGE: the new page and its predecessor in the heap chain
    NewPage {
        prev_page_id: PageId,
        page_id: PageId,
    },
}

/// One write-ahead log record.
///
/// Wire format (little endian), header first:
///   size (4) | lsn (4) | txn_id (4) | prev_lsn (4) | type (4)
/// then the body: RID as page_id (4) + slot_num (4); tuples length-prefixed
/// with a 4-byte count; NEWPAGE as prev_page_id (4) + page_id (4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub size: u32,
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub record_type: LogRecordType,
    pub body: LogRecordBody,
}

pub const LOG_RECORD_HEADER_SIZE: usize = 20;

impl LogRecord {
    fn new(txn_id: TxnId, prev_lsn: Lsn, record_type: LogRecordType, body: LogRecordBody) -> Self {
        let body_size = match &body {
            LogRecordBody::None => 0,
            LogRecordBody::TupleOp { tuple, .. } => 8 + 4 + tuple.len(),
            LogRecordBody::Update {
                old_tuple,
                new_tuple,
                ..
            } => 8 + 4 + old_tuple.len() + 4 + new_tuple.len(),
            LogRecordBody::NewPage { .. } => 8,
        };
        Self {
            size: (LOG_RECORD_HEADER_SIZE + body_size) as u32,
            lsn: INVALID_LSN,
            txn_id,
            prev_lsn,
            record_type,
            body,
        }
    }

    pub fn new_begin(txn_id: TxnId) -> Self {
        Self::new(txn_id, INVALID_LSN, LogRecordType::Begin, LogRecordBody::None)
    }

    pub fn new_commit(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::Commit, LogRecordBody::None)
    }

    pub fn new_abort(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::Abort, LogRecordBody::None)
    }

    pub fn new_insert(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Vec<u8>) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::Insert,
            LogRecordBody::TupleOp { rid, tuple },
        )
    }

    pub fn new_mark_delete(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Vec<u8>) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::MarkDelete,
            LogRecordBody::TupleOp { rid, tuple },
        )
    }

    pub fn new_apply_delete(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Vec<u8>) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::ApplyDelete,
            LogRecordBody::TupleOp { rid, tuple },
        )
    }

    pub fn new_rollback_delete(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Vec<u8>) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::RollbackDelete,
            LogRecordBody::TupleOp { rid, tuple },
        )
    }

    pub fn new_update(
        txn_id: TxnId,
        prev_lsn: Lsn,
        rid: Rid,
        old_tuple: Vec<u8>,
        new_tuple: Vec<u8>,
    ) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::Update,
            LogRecordBody::Update {
                rid,
                old_tuple,
                new_tuple,
            },
        )
    }

    pub fn new_new_page(txn_id: TxnId, prev_lsn: Lsn, prev_page_id: PageId, page_id: PageId) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::NewPage,
            LogRecordBody::NewPage {
                prev_page_id,
                page_id,
            },
        )
    }

    /// Serialize to the wire format. `size` always matches the output
    /// length.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size as usize);
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.txn_id.to_le_bytes());
        buf.extend_from_slice(&self.prev_lsn.to_le_bytes());
        buf.extend_from_slice(&(self.record_type as u32).to_le_bytes());
        match &self.body {
            LogRecordBody::None => {}
            LogRecordBody::TupleOp { rid, tuple } => {
                buf.extend_from_slice(&rid.page_id.to_le_bytes());
                buf.extend_from_slice(&rid.slot_num.to_le_bytes());
                buf.extend_from_slice(&(tuple.len() as u32).to_le_bytes());
                buf.extend_from_slice(tuple);
            }
            LogRecordBody::Update {
                rid,
                old_tuple,
                new_tuple,
            } => {
                buf.extend_from_slice(&rid.page_id.to_le_bytes());
                buf.extend_from_slice(&rid.slot_num.to_le_bytes());
                buf.extend_from_slice(&(old_tuple.len() as u32).to_le_bytes());
                buf.extend_from_slice(old_tuple);
                buf.extend_from_slice(&(new_tuple.len() as u32).to_le_bytes());
                buf.extend_from_slice(new_tuple);
            }
            LogRecordBody::NewPage {
                prev_page_id,
                page_id,
            } => {
                buf.extend_from_slice(&prev_page_id.to_le_bytes());
                buf.extend_from_slice(&page_id.to_le_bytes());
            }
        }
        debug_assert_eq!(buf.len(), self.size as usize);
        buf
    }

    /// Parse one record from the front of `buf`. Returns `None` when the
    /// buffer holds no complete, well-formed record (the caller refills and
    /// retries).
    pub fn deserialize(buf: &[u8]) -> Option<LogRecord> {
        if buf.len() < LOG_RECORD_HEADER_SIZE {
            return None;
        }
        let size = LittleEndian::read_u32(&buf[0..]) as usize;
        if size < LOG_RECORD_HEADER_SIZE || size > buf.len() {
            return None;
        }
        let lsn = LittleEndian::read_u32(&buf[4..]);
        let txn_id = LittleEndian::read_u32(&buf[8..]);
        let prev_lsn = LittleEndian::read_u32(&buf[12..]);
        let record_type = LogRecordType::from_u32(LittleEndian::read_u32(&buf[16..]))?;

        let body_buf = &buf[LOG_RECORD_HEADER_SIZE..size];
        let body = match record_type {
            LogRecordType::Begin | LogRecordType::Commit | LogRecordType::Abort => {
                LogRecordBody::None
            }
            LogRecordType::Insert
            | LogRecordType::MarkDelete
            | LogRecordType::ApplyDelete
            | LogRecordType::RollbackDelete => {
                let (rid, rest) = read_rid(body_buf)?;
                let (tuple, rest) = read_tuple(rest)?;
                if !rest.is_empty() {
                    return None;
                }
                LogRecordBody::TupleOp { rid, tuple }
            }
            LogRecordType::Update => {
                let (rid, rest) = read_rid(body_buf)?;
                let (old_tuple, rest) = read_tuple(rest)?;
                let (new_tuple, rest) = read_tuple(rest)?;
                if !rest.is_empty() {
                    return None;
                }
                LogRecordBody::Update {
                    rid,
                    old_tuple,
                    new_tuple,
                }
            }
            LogRecordType::NewPage => {
                if body_buf.len() != 8 {
                    return None;
                }
                LogRecordBody::NewPage {
                    prev_page_id: LittleEndian::read_u32(&body_buf[0..]),
                    page_id: LittleEndian::read_u32(&body_buf[4..]),
                }
            }
        };
        Some(LogRecord {
            size: size as u32,
            lsn,
            txn_id,
            prev_lsn,
            record_type,
            body,
        })
    }

    /// The RID a tuple-level record refers to; `None` for transaction
    /// markers and NEWPAGE.
    pub fn rid(&self) -> Option<Rid> {
        match &self.body {
            LogRecordBody::TupleOp { rid, .. } | LogRecordBody::Update { rid, .. } => Some(*rid),
            _ => None,
        }
    }
}

fn read_rid(buf: &[u8]) -> Option<(Rid, &[u8])> {
    if buf.len() < 8 {
        return None;
    }
    let rid = Rid::new(
        LittleEndian::read_u32(&buf[0..]),
        LittleEndian::read_u32(&buf[4..]),
    );
    Some((rid, &buf[8..]))
}

fn read_tuple(buf: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    if buf.len() < 4 {
        return None;
    }
    let len = LittleEndian::read_u32(&buf[0..]) as usize;
    if buf.len() < 4 + len {
        return None;
    }
    Some((buf[4..4 + len].to_vec(), &buf[4 + len..]))
}
