use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    Result, Transaction, TransactionState, WriteRecord,
};
use crate::transaction::wal::log_record::LogRecord;
use crate::transaction::wal::policy::LogPolicy;

/// Transaction manager: creates transactions, and drives commit and abort
/// through the strict-2PL protocol — finalize or undo the write set, make
/// the decision durable, and only then release every lock.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    log_policy: Arc<dyn LogPolicy>,
    active_txns: Mutex<HashSet<TxnId>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, log_policy: Arc<dyn LogPolicy>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            log_policy,
            active_txns: Mutex::new(HashSet::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Begin a new transaction, writing its BEGIN record when logging is
    /// enabled.
    pub fn begin(&self) -> Result<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let mut txn = Transaction::new(txn_id);

        if self.log_policy.is_enabled() {
            let mut record = LogRecord::new_begin(txn_id);
            let lsn = self.log_policy.append(&mut record)?;
            txn.set_prev_lsn(lsn);
        }

        self.active_txns.lock().insert(txn_id);
        debug!("txn {} began", txn_id);
        Ok(txn)
    }

    /// Commit: finalize deferred deletes, write COMMIT, wait for the log
    /// to become durable, then release all locks.
    pub fn commit(&self, txn: &mut Transaction) -> Result<()> {
        txn.set_state(TransactionState::Committed);

        // Mark-deletes become real deletions at commit time.
        while let Some(record) = txn.pop_write_record() {
            if let WriteRecord::Delete { table, rid, .. } = record {
                table.apply_delete(txn, rid)?;
            }
        }

        if self.log_policy.is_enabled() {
            let mut record = LogRecord::new_commit(txn.id(), txn.prev_lsn());
            let lsn = self.log_policy.append(&mut record)?;
            txn.set_prev_lsn(lsn);
            // The commit record must be durable before any lock is
            // released; the next scheduled flush is awaited rather than
            // forced.
            self.log_policy.flush(false)?;
        }

        self.release_all_locks(txn);
        self.active_txns.lock().remove(&txn.id());
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Abort: undo the write set newest-first, write ABORT, flush, then
    /// release all locks.
    pub fn abort(&self, txn: &mut Transaction) -> Result<()> {
        txn.set_state(TransactionState::Aborted);

        while let Some(record) = txn.pop_write_record() {
            match record {
                WriteRecord::Delete { table, rid, .. } => {
                    debug!("txn {} rolls back delete of {}", txn.id(), rid);
                    table.rollback_delete(txn, rid)?;
                }
                WriteRecord::Insert { table, rid } => {
                    debug!("txn {} rolls back insert of {}", txn.id(), rid);
                    table.apply_delete(txn, rid)?;
                }
                WriteRecord::Update {
                    table,
                    rid,
                    old_tuple,
                } => {
                    debug!("txn {} rolls back update of {}", txn.id(), rid);
                    table.revert_update(txn, rid, &old_tuple)?;
                }
            }
        }

        if self.log_policy.is_enabled() {
            let mut record = LogRecord::new_abort(txn.id(), txn.prev_lsn());
            let lsn = self.log_policy.append(&mut record)?;
            txn.set_prev_lsn(lsn);
            self.log_policy.flush(false)?;
        }

        self.release_all_locks(txn);
        self.active_txns.lock().remove(&txn.id());
        debug!("txn {} aborted", txn.id());
        Ok(())
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_txns.lock().iter().copied().collect()
    }

    fn release_all_locks(&self, txn: &mut Transaction) {
        let mut rids: Vec<Rid> = txn
            .shared_lock_set()
            .iter()
            .chain(txn.exclusive_lock_set().iter())
            .copied()
            .collect();
        rids.sort();
        rids.dedup();
        for rid in rids {
            self.lock_manager.unlock(txn, rid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::wal::policy::NoopLog;

    fn test_manager(strict: bool) -> TransactionManager {
        TransactionManager::new(Arc::new(LockManager::new(strict)), Arc::new(NoopLog))
    }

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let manager = test_manager(false);
        let t1 = manager.begin().unwrap();
        let t2 = manager.begin().unwrap();
        assert_eq!(t1.id(), 1);
        assert_eq!(t2.id(), 2);
        assert_eq!(t1.state(), TransactionState::Growing);
        assert_eq!(manager.active_transaction_ids().len(), 2);
    }

    #[test]
    fn test_commit_releases_locks() {
        let manager = test_manager(true);
        let mut txn = manager.begin().unwrap();
        let rid = Rid::new(1, 1);
        assert!(manager.lock_manager().lock_exclusive(&mut txn, rid));
        assert!(txn.holds_lock(&rid));

        manager.commit(&mut txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(!txn.holds_lock(&rid));
        assert!(manager.active_transaction_ids().is_empty());

        // The lock is free for the next transaction.
        let mut other = manager.begin().unwrap();
        assert!(manager.lock_manager().lock_shared(&mut other, rid));
    }

    #[test]
    fn test_abort_releases_locks() {
        let manager = test_manager(true);
        let mut txn = manager.begin().unwrap();
        let rid = Rid::new(2, 0);
        assert!(manager.lock_manager().lock_shared(&mut txn, rid));
        manager.abort(&mut txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(!txn.holds_lock(&rid));
    }
}
