use std::sync::{Arc, Weak};

use log::debug;
use thiserror::Error;

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::page::table_page::TablePageError;
use crate::storage::page::{TablePage, TablePageView, WritePageGuard};
use crate::transaction::concurrency::transaction::{Transaction, WriteRecord};
use crate::transaction::wal::log_manager::LogManagerError;
use crate::transaction::wal::log_record::LogRecord;
use crate::transaction::wal::policy::LogPolicy;

/// Largest tuple a heap page can host (header plus one slot reserved).
const MAX_TUPLE_SIZE: usize = PAGE_SIZE - 20 - 8;

/// Error type for table heap operations
#[derive(Error, Debug)]
pub enum TableError {
    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),

    #[error("Page error: {0}")]
    PageError(#[from] TablePageError),

    #[error("Log error: {0}")]
    LogError(#[from] LogManagerError),

    #[error("No tuple at {0}")]
    TupleNotFound(Rid),

    #[error("Tuple of {0} bytes exceeds the page capacity")]
    TupleTooLarge(usize),
}

/// Result type for table heap operations
pub type Result<T> = std::result::Result<T, TableError>;

/// A linked chain of slotted pages holding one table's tuples. Every
/// mutation appends a log record through the injected policy, stamps the
/// page LSN, and (for user-initiated changes) registers a write-set entry
/// so the transaction can be rolled back.
pub struct TableHeap {
    buffer_pool: Arc<BufferPoolManager>,
    log_policy: Arc<dyn LogPolicy>,
    first_page_id: PageId,
    /// Handle to ourselves, recorded in write-set entries.
    self_ref: Weak<TableHeap>,
}

impl TableHeap {
    /// Create a heap with one fresh page, logged as NEWPAGE.
    pub fn new(
        buffer_pool: Arc<BufferPoolManager>,
        log_policy: Arc<dyn LogPolicy>,
        txn: &mut Transaction,
    ) -> Result<Arc<Self>> {
        let (mut guard, first_page_id) = buffer_pool.new_page_write()?;
        TablePage::new(&mut guard).init(INVALID_PAGE_ID);

        let heap = Arc::new_cyclic(|self_ref| Self {
            buffer_pool,
            log_policy,
            first_page_id,
            self_ref: self_ref.clone(),
        });
        let record = LogRecord::new_new_page(txn.id(), txn.prev_lsn(), INVALID_PAGE_ID, first_page_id);
        heap.log_op(txn, &mut guard, record)?;
        Ok(heap)
    }

    /// Reattach to an existing heap by its first page.
    pub fn open(
        buffer_pool: Arc<BufferPoolManager>,
        log_policy: Arc<dyn LogPolicy>,
        first_page_id: PageId,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            buffer_pool,
            log_policy,
            first_page_id,
            self_ref: self_ref.clone(),
        })
    }

    fn shared_handle(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("table heap used after its last Arc was dropped")
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    /// Read a tuple; `None` if the slot is empty or mark-deleted.
    pub fn get_tuple(&self, rid: Rid) -> Result<Option<Vec<u8>>> {
        let guard = self.buffer_pool.fetch_page_read(rid.page_id)?;
        Ok(TablePageView::new(&guard).get_tuple(rid.slot_num))
    }

    /// Insert a tuple into the first page with room, extending the chain
    /// with a logged NEWPAGE when every page is full.
    pub fn insert_tuple(&self, txn: &mut Transaction, tuple: &[u8]) -> Result<Rid> {
        if tuple.len() > MAX_TUPLE_SIZE {
            return Err(TableError::TupleTooLarge(tuple.len()));
        }
        let mut page_id = self.first_page_id;
        loop {
            let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
            let insert_result = TablePage::new(&mut guard).insert_tuple(tuple);
            match insert_result {
                Ok(slot) => {
                    let rid = Rid::new(page_id, slot);
                    let record =
                        LogRecord::new_insert(txn.id(), txn.prev_lsn(), rid, tuple.to_vec());
                    self.log_op(txn, &mut guard, record)?;
                    txn.push_write_record(WriteRecord::Insert {
                        table: self.shared_handle(),
                        rid,
                    });
                    return Ok(rid);
                }
                Err(TablePageError::OutOfSpace(_)) => {
                    let next = TablePage::new(&mut guard).next_page_id();
                    if next != INVALID_PAGE_ID {
                        drop(guard);
                        page_id = next;
                        continue;
                    }
                    // Chain exhausted: append a page.
                    let (mut new_guard, new_page_id) = self.buffer_pool.new_page_write()?;
                    TablePage::new(&mut new_guard).init(page_id);
                    TablePage::new(&mut guard).set_next_page_id(new_page_id);
                    let record = LogRecord::new_new_page(
                        txn.id(),
                        txn.prev_lsn(),
                        page_id,
                        new_page_id,
                    );
                    self.log_op(txn, &mut new_guard, record)?;
                    debug!("table heap grew with page {}", new_page_id);
                    drop(guard);
                    drop(new_guard);
                    page_id = new_page_id;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Logically delete a tuple; finalized at commit, reversed at abort.
    pub fn mark_delete(&self, txn: &mut Transaction, rid: Rid) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let tuple = {
            let mut page = TablePage::new(&mut guard);
            let tuple = page
                .get_tuple(rid.slot_num)
                .ok_or(TableError::TupleNotFound(rid))?;
            page.mark_delete(rid.slot_num)?;
            tuple
        };
        let record = LogRecord::new_mark_delete(txn.id(), txn.prev_lsn(), rid, tuple.clone());
        self.log_op(txn, &mut guard, record)?;
        txn.push_write_record(WriteRecord::Delete {
            table: self.shared_handle(),
            rid,
            tuple,
        });
        Ok(())
    }

    /// Replace a tuple's bytes, remembering the before-image for undo.
    pub fn update_tuple(&self, txn: &mut Transaction, rid: Rid, tuple: &[u8]) -> Result<()> {
        if tuple.len() > MAX_TUPLE_SIZE {
            return Err(TableError::TupleTooLarge(tuple.len()));
        }
        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let old_tuple = TablePage::new(&mut guard).update_tuple(rid.slot_num, tuple)?;
        let record = LogRecord::new_update(
            txn.id(),
            txn.prev_lsn(),
            rid,
            old_tuple.clone(),
            tuple.to_vec(),
        );
        self.log_op(txn, &mut guard, record)?;
        txn.push_write_record(WriteRecord::Update {
            table: self.shared_handle(),
            rid,
            old_tuple,
        });
        Ok(())
    }

    /// Physically remove a tuple. Used to finalize a mark-delete at commit
    /// and to erase a tentative insert at abort; never registers undo.
    pub fn apply_delete(&self, txn: &mut Transaction, rid: Rid) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let tuple = TablePage::new(&mut guard).apply_delete(rid.slot_num)?;
        let record = LogRecord::new_apply_delete(txn.id(), txn.prev_lsn(), rid, tuple);
        self.log_op(txn, &mut guard, record)
    }

    /// Reverse a mark-delete during abort; never registers undo.
    pub fn rollback_delete(&self, txn: &mut Transaction, rid: Rid) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let tuple = {
            let mut page = TablePage::new(&mut guard);
            page.rollback_delete(rid.slot_num)?;
            page.get_tuple(rid.slot_num)
                .ok_or(TableError::TupleNotFound(rid))?
        };
        let record = LogRecord::new_rollback_delete(txn.id(), txn.prev_lsn(), rid, tuple);
        self.log_op(txn, &mut guard, record)
    }

    /// Restore a before-image during abort, logged as a regular update
    /// with the images swapped; never registers undo.
    pub fn revert_update(&self, txn: &mut Transaction, rid: Rid, before: &[u8]) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(rid.page_id)?;
        let undone = TablePage::new(&mut guard).update_tuple(rid.slot_num, before)?;
        let record =
            LogRecord::new_update(txn.id(), txn.prev_lsn(), rid, undone, before.to_vec());
        self.log_op(txn, &mut guard, record)
    }

    /// Append a record through the policy, chain it into the transaction's
    /// undo list, and stamp the page with its LSN.
    fn log_op(
        &self,
        txn: &mut Transaction,
        guard: &mut WritePageGuard,
        mut record: LogRecord,
    ) -> Result<()> {
        if self.log_policy.is_enabled() {
            let lsn = self.log_policy.append(&mut record)?;
            txn.set_prev_lsn(lsn);
            TablePage::new(guard).set_lsn(lsn);
        }
        Ok(())
    }
}
