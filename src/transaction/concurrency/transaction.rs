use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::common::types::{Lsn, Rid, TxnId, INVALID_LSN};
use crate::storage::buffer::BufferPoolError;
use crate::storage::table::{TableError, TableHeap};
use crate::transaction::wal::log_manager::LogManagerError;

/// Transaction states under two-phase locking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Acquiring locks
    Growing,
    /// Released a lock; may not acquire more
    Shrinking,
    Committed,
    Aborted,
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} is not active")]
    NotActive(TxnId),

    #[error("Table error: {0}")]
    TableError(#[from] TableError),

    #[error("Failed to write to the log: {0}")]
    LogError(#[from] LogManagerError),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// One entry in a transaction's write set: enough to reverse (or, for
/// deferred deletes, finish) the operation. Abort replays these newest
/// first.
pub enum WriteRecord {
    /// A tentative insert; undo removes the tuple outright.
    Insert { table: Arc<TableHeap>, rid: Rid },
    /// An update, with the before-image to restore.
    Update {
        table: Arc<TableHeap>,
        rid: Rid,
        old_tuple: Vec<u8>,
    },
    /// A mark-delete; commit finalizes it, abort rolls it back.
    Delete {
        table: Arc<TableHeap>,
        rid: Rid,
        tuple: Vec<u8>,
    },
}

/// An active transaction: 2PL state, the undo chain head (`prev_lsn`),
/// the sets of held locks, and the write set.
///
/// A transaction is driven by a single thread; the lock manager and
/// transaction manager mutate it through `&mut` from that thread.
pub struct Transaction {
    id: TxnId,
    state: TransactionState,
    prev_lsn: Lsn,
    shared_lock_set: HashSet<Rid>,
    exclusive_lock_set: HashSet<Rid>,
    write_set: Vec<WriteRecord>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: TransactionState::Growing,
            prev_lsn: INVALID_LSN,
            shared_lock_set: HashSet::new(),
            exclusive_lock_set: HashSet::new(),
            write_set: Vec::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    /// LSN of the last log record this transaction produced.
    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn
    }

    pub fn set_prev_lsn(&mut self, lsn: Lsn) {
        self.prev_lsn = lsn;
    }

    pub fn shared_lock_set(&self) -> &HashSet<Rid> {
        &self.shared_lock_set
    }

    pub fn shared_lock_set_mut(&mut self) -> &mut HashSet<Rid> {
        &mut self.shared_lock_set
    }

    pub fn exclusive_lock_set(&self) -> &HashSet<Rid> {
        &self.exclusive_lock_set
    }

    pub fn exclusive_lock_set_mut(&mut self) -> &mut HashSet<Rid> {
        &mut self.exclusive_lock_set
    }

    /// True if this transaction holds any lock (of either mode) on `rid`.
    pub fn holds_lock(&self, rid: &Rid) -> bool {
        self.shared_lock_set.contains(rid) || self.exclusive_lock_set.contains(rid)
    }

    pub fn push_write_record(&mut self, record: WriteRecord) {
        self.write_set.push(record);
    }

    /// Pop the newest write-set entry (LIFO, for undo).
    pub fn pop_write_record(&mut self) -> Option<WriteRecord> {
        self.write_set.pop()
    }

    pub fn write_set_len(&self) -> usize {
        self.write_set.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(1);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.prev_lsn(), INVALID_LSN);
        assert!(txn.shared_lock_set().is_empty());
        assert!(txn.exclusive_lock_set().is_empty());
        assert_eq!(txn.write_set_len(), 0);
    }

    #[test]
    fn test_lock_sets() {
        let mut txn = Transaction::new(2);
        let rid = Rid::new(1, 4);
        txn.shared_lock_set_mut().insert(rid);
        assert!(txn.holds_lock(&rid));
        txn.shared_lock_set_mut().remove(&rid);
        txn.exclusive_lock_set_mut().insert(rid);
        assert!(txn.holds_lock(&rid));
        assert!(!txn.holds_lock(&Rid::new(1, 5)));
    }
}
