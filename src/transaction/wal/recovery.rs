use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

use crate::common::types::{Lsn, Rid, TxnId, INVALID_LSN, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::disk::{DiskManager, DiskManagerError};
use crate::storage::page::table_page::TablePageError;
use crate::storage::page::TablePage;
use crate::transaction::wal::log_record::{LogRecord, LogRecordBody, LogRecordType};

/// Bytes of log streamed per refill during REDO.
const LOG_BUFFER_SIZE: usize = 4 * PAGE_SIZE;

/// Error type for recovery operations
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Disk error: {0}")]
    DiskError(#[from] DiskManagerError),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),

    #[error("Page error: {0}")]
    PageError(#[from] TablePageError),
}

/// Result type for recovery operations
pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Offline crash recovery over the write-ahead log: a REDO pass replays
/// history onto pages whose LSN is behind the log, then an UNDO pass walks
/// each still-active transaction's chain backwards reversing its effects.
/// Runs with logging disabled, before any new transaction starts.
pub struct LogRecovery {
    disk_manager: Arc<DiskManager>,
    buffer_pool: Arc<BufferPoolManager>,
    log_buffer: Vec<u8>,
    /// txn id -> last LSN seen, for transactions without COMMIT/ABORT.
    active_txn: HashMap<TxnId, Lsn>,
    /// LSN -> byte offset in the log file; built by REDO, consumed by UNDO.
    lsn_mapping: HashMap<Lsn, u64>,
}

impl LogRecovery {
    pub fn new(disk_manager: Arc<DiskManager>, buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            disk_manager,
            buffer_pool,
            log_buffer: vec![0u8; LOG_BUFFER_SIZE],
            active_txn: HashMap::new(),
            lsn_mapping: HashMap::new(),
        }
    }

    /// Which transactions were still active when the log ends. Available
    /// between the REDO and UNDO passes.
    pub fn active_transactions(&self) -> Vec<TxnId> {
        self.active_txn.keys().copied().collect()
    }

    /// REDO: stream the whole log from offset zero, replaying every record
    /// whose LSN is newer than its page, and build the transaction and
    /// offset tables. A record straddling the buffer end is carried to the
    /// front before the next refill.
    pub fn redo(&mut self) -> Result<()> {
        info!("recovery redo pass starting");
        self.active_txn.clear();
        self.lsn_mapping.clear();

        let mut file_offset: u64 = 0;
        let mut carry = 0usize;
        loop {
            let buffer = &mut self.log_buffer[carry..];
            if !self.disk_manager.read_log(buffer, file_offset)? {
                break;
            }
            // File offset corresponding to log_buffer[0].
            let chunk_base = file_offset - carry as u64;
            file_offset += (LOG_BUFFER_SIZE - carry) as u64;

            let mut pos = 0usize;
            while let Some(record) = LogRecord::deserialize(&self.log_buffer[pos..]) {
                self.lsn_mapping
                    .insert(record.lsn, chunk_base + pos as u64);
                self.active_txn.insert(record.txn_id, record.lsn);
                pos += record.size as usize;
                self.redo_record(&record)?;
            }
            if pos == 0 {
                // A full buffer with no parseable record: corruption, or
                // padding at the tail. Either way parsing stops here.
                break;
            }

            self.log_buffer.copy_within(pos.., 0);
            carry = LOG_BUFFER_SIZE - pos;
        }
        info!(
            "redo complete: {} active transactions, {} records mapped",
            self.active_txn.len(),
            self.lsn_mapping.len()
        );
        Ok(())
    }

    fn redo_record(&mut self, record: &LogRecord) -> Result<()> {
        match record.record_type {
            LogRecordType::Begin => {}
            LogRecordType::Commit | LogRecordType::Abort => {
                let removed = self.active_txn.remove(&record.txn_id);
                assert!(
                    removed.is_some(),
                    "commit/abort for unknown txn {} at lsn {}",
                    record.txn_id,
                    record.lsn
                );
            }
            LogRecordType::NewPage => {
                let (prev_page_id, page_id) = match record.body {
                    LogRecordBody::NewPage {
                        prev_page_id,
                        page_id,
                    } => (prev_page_id, page_id),
                    _ => unreachable!("NEWPAGE record without a page body"),
                };
                let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
                if record.lsn > TablePage::new(&mut guard).lsn() {
                    let mut page = TablePage::new(&mut guard);
                    page.init(prev_page_id);
                    page.set_lsn(record.lsn);
                    drop(guard);
                    if prev_page_id != INVALID_PAGE_ID {
                        let mut prev = self.buffer_pool.fetch_page_write(prev_page_id)?;
                        let mut prev_page = TablePage::new(&mut prev);
                        if prev_page.next_page_id() != page_id {
                            prev_page.set_next_page_id(page_id);
                        }
                    }
                }
            }
            _ => {
                let rid = record
                    .rid()
                    .expect("tuple-level record without a rid");
                let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
                let mut page = TablePage::new(&mut guard);
                if record.lsn > page.lsn() {
                    debug!("redo lsn {} on page {}", record.lsn, rid.page_id);
                    Self::apply_forward(&mut page, record, rid)?;
                    page.set_lsn(record.lsn);
                }
            }
        }
        Ok(())
    }

    fn apply_forward(page: &mut TablePage<'_>, record: &LogRecord, rid: Rid) -> Result<()> {
        match (&record.record_type, &record.body) {
            (LogRecordType::Insert, LogRecordBody::TupleOp { tuple, .. }) => {
                page.insert_tuple_at(rid.slot_num, tuple)?;
            }
            (LogRecordType::Update, LogRecordBody::Update { new_tuple, .. }) => {
                page.update_tuple(rid.slot_num, new_tuple)?;
            }
            (LogRecordType::MarkDelete, _) => page.mark_delete(rid.slot_num)?,
            (LogRecordType::ApplyDelete, _) => {
                page.apply_delete(rid.slot_num)?;
            }
            (LogRecordType::RollbackDelete, _) => page.rollback_delete(rid.slot_num)?,
            _ => unreachable!("malformed tuple-level record"),
        }
        Ok(())
    }

    /// UNDO: for every transaction still active at the end of the log,
    /// follow its `prev_lsn` chain backwards applying inverse operations.
    /// COMMIT/ABORT records cannot appear on these chains; BEGIN ends one.
    pub fn undo(&mut self) -> Result<()> {
        info!(
            "recovery undo pass starting for {} transactions",
            self.active_txn.len()
        );
        let chains: Vec<(TxnId, Lsn)> = self.active_txn.iter().map(|(&t, &l)| (t, l)).collect();
        let mut record_buffer = vec![0u8; PAGE_SIZE];

        for (txn_id, mut lsn) in chains {
            debug!("undoing txn {} from lsn {}", txn_id, lsn);
            while lsn != INVALID_LSN {
                let offset = *self
                    .lsn_mapping
                    .get(&lsn)
                    .unwrap_or_else(|| panic!("no log offset recorded for lsn {}", lsn));
                let read = self.disk_manager.read_log(&mut record_buffer, offset)?;
                assert!(read, "log truncated under an undo chain at lsn {}", lsn);
                let record = LogRecord::deserialize(&record_buffer)
                    .unwrap_or_else(|| panic!("corrupt log record at lsn {}", lsn));
                assert_eq!(record.lsn, lsn, "log offset map points at the wrong record");

                lsn = record.prev_lsn;
                self.undo_record(&record)?;
            }
        }
        self.active_txn.clear();
        self.lsn_mapping.clear();
        info!("undo complete");
        Ok(())
    }

    fn undo_record(&mut self, record: &LogRecord) -> Result<()> {
        match record.record_type {
            LogRecordType::Begin => {
                assert_eq!(
                    record.prev_lsn, INVALID_LSN,
                    "BEGIN must terminate an undo chain"
                );
            }
            LogRecordType::Commit | LogRecordType::Abort => {
                unreachable!("finished txn {} on an undo chain", record.txn_id)
            }
            LogRecordType::NewPage => {
                let (prev_page_id, page_id) = match record.body {
                    LogRecordBody::NewPage {
                        prev_page_id,
                        page_id,
                    } => (prev_page_id, page_id),
                    _ => unreachable!("NEWPAGE record without a page body"),
                };
                if !self.buffer_pool.delete_page(page_id)? {
                    self.disk_manager.deallocate_page(page_id)?;
                }
                if prev_page_id != INVALID_PAGE_ID {
                    let mut prev = self.buffer_pool.fetch_page_write(prev_page_id)?;
                    let mut prev_page = TablePage::new(&mut prev);
                    assert_eq!(
                        prev_page.next_page_id(),
                        page_id,
                        "undoing a NEWPAGE that is not at the chain tail"
                    );
                    prev_page.set_next_page_id(INVALID_PAGE_ID);
                }
            }
            _ => {
                let rid = record.rid().expect("tuple-level record without a rid");
                let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
                let mut page = TablePage::new(&mut guard);
                assert!(
                    page.lsn() >= record.lsn,
                    "undoing lsn {} on a page that never saw it",
                    record.lsn
                );
                match (&record.record_type, &record.body) {
                    (LogRecordType::Insert, _) => {
                        page.apply_delete(rid.slot_num)?;
                    }
                    (LogRecordType::Update, LogRecordBody::Update { old_tuple, new_tuple, .. }) => {
                        let undone = page.update_tuple(rid.slot_num, old_tuple)?;
                        debug_assert_eq!(
                            &undone, new_tuple,
                            "undo of an update found an unexpected after-image"
                        );
                    }
                    (LogRecordType::MarkDelete, _) => page.rollback_delete(rid.slot_num)?,
                    (LogRecordType::ApplyDelete, LogRecordBody::TupleOp { tuple, .. }) => {
                        page.insert_tuple_at(rid.slot_num, tuple)?;
                    }
                    (LogRecordType::RollbackDelete, _) => page.mark_delete(rid.slot_num)?,
                    _ => unreachable!("malformed tuple-level record"),
                }
            }
        }
        Ok(())
    }
}
