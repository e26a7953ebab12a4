use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::transaction::concurrency::transaction::{Transaction, TransactionState};

/// Lock modes on a tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    /// A shared holder waiting to become exclusive; promoted on grant
    Upgrading,
}

/// Wakeup channel for one blocked request.
struct GrantGate {
    granted: Mutex<bool>,
    cv: Condvar,
}

impl GrantGate {
    fn new(granted: bool) -> Arc<Self> {
        Arc::new(Self {
            granted: Mutex::new(granted),
            cv: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut granted = self.granted.lock();
        while !*granted {
            self.cv.wait(&mut granted);
        }
    }

    fn open(&self) {
        let mut granted = self.granted.lock();
        *granted = true;
        self.cv.notify_one();
    }
}

struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
    gate: Arc<GrantGate>,
}

#[derive(Default)]
struct LockQueue {
    requests: Vec<LockRequest>,
    /// At most one upgrade may be in flight per RID.
    has_upgrading: bool,
}

impl LockQueue {
    /// A new request is granted immediately iff the queue is empty, or it
    /// is SHARED and the queue tail is a granted SHARED (the granted prefix
    /// is contiguous, so the tail speaks for it).
    fn can_grant(&self, mode: LockMode) -> bool {
        match self.requests.last() {
            None => true,
            Some(last) => mode == LockMode::Shared && last.granted && last.mode == LockMode::Shared,
        }
    }
}

/// Tuple-granularity lock manager with wait-die deadlock avoidance: a
/// requester finding an incompatible younger holder waits; one finding an
/// older holder aborts ("dies"). Transaction ids double as timestamps
/// (smaller id = older), so every wait edge points old -> young and no
/// cycle can form.
pub struct LockManager {
    strict_2pl: bool,
    table: Mutex<HashMap<Rid, Arc<Mutex<LockQueue>>>>,
}

impl LockManager {
    pub fn new(strict_2pl: bool) -> Self {
        Self {
            strict_2pl,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a shared lock. False means the transaction was aborted.
    pub fn lock_shared(&self, txn: &mut Transaction, rid: Rid) -> bool {
        self.lock(txn, rid, LockMode::Shared)
    }

    /// Acquire an exclusive lock. False means the transaction was aborted.
    pub fn lock_exclusive(&self, txn: &mut Transaction, rid: Rid) -> bool {
        self.lock(txn, rid, LockMode::Exclusive)
    }

    /// Upgrade a held shared lock to exclusive. False means the
    /// transaction was aborted (no shared lock held, a second concurrent
    /// upgrade, or wait-die).
    pub fn lock_upgrade(&self, txn: &mut Transaction, rid: Rid) -> bool {
        self.lock(txn, rid, LockMode::Upgrading)
    }

    fn lock(&self, txn: &mut Transaction, rid: Rid, mode: LockMode) -> bool {
        // 2PL: no new locks once the transaction started releasing.
        if txn.state() != TransactionState::Growing {
            txn.set_state(TransactionState::Aborted);
            return false;
        }

        let mut table = self.table.lock();
        let queue_arc = table.entry(rid).or_default().clone();
        let mut queue = queue_arc.lock();
        drop(table);

        if mode == LockMode::Upgrading {
            if queue.has_upgrading {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
            // The upgrader must currently hold a granted shared lock here.
            let pos = queue.requests.iter().position(|r| r.txn_id == txn.id());
            match pos {
                Some(i)
                    if queue.requests[i].mode == LockMode::Shared
                        && queue.requests[i].granted =>
                {
                    queue.requests.remove(i);
                    let removed = txn.shared_lock_set_mut().remove(&rid);
                    debug_assert!(removed, "upgrade without a tracked shared lock");
                }
                _ => {
                    txn.set_state(TransactionState::Aborted);
                    return false;
                }
            }
        }

        let can_grant = queue.can_grant(mode);
        if !can_grant {
            // Wait-die: only wait on younger holders (larger ids).
            let tail = queue.requests.last().expect("ungrantable empty queue");
            if tail.txn_id < txn.id() {
                debug!(
                    "txn {} dies waiting for older txn {} on {}",
                    txn.id(),
                    tail.txn_id,
                    rid
                );
                txn.set_state(TransactionState::Aborted);
                return false;
            }
        }

        // An upgrade granted on an empty queue is simply exclusive.
        let effective_mode = if mode == LockMode::Upgrading && can_grant {
            LockMode::Exclusive
        } else {
            mode
        };
        let gate = GrantGate::new(can_grant);
        queue.requests.push(LockRequest {
            txn_id: txn.id(),
            mode: effective_mode,
            granted: can_grant,
            gate: gate.clone(),
        });
        if !can_grant {
            queue.has_upgrading |= mode == LockMode::Upgrading;
            drop(queue);
            gate.wait();
        }

        if mode == LockMode::Shared {
            txn.shared_lock_set_mut().insert(rid);
        } else {
            txn.exclusive_lock_set_mut().insert(rid);
        }
        true
    }

    /// Release the lock held by `txn` on `rid`. Under plain 2PL this moves
    /// a growing transaction to SHRINKING; under strict 2PL it is only
    /// legal after commit or abort. Waiters at the queue head are granted.
    pub fn unlock(&self, txn: &mut Transaction, rid: Rid) -> bool {
        if self.strict_2pl {
            if txn.state() != TransactionState::Committed
                && txn.state() != TransactionState::Aborted
            {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
        } else if txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }

        let mut table = self.table.lock();
        let queue_arc = match table.get(&rid) {
            Some(q) => q.clone(),
            None => return false,
        };
        let mut queue = queue_arc.lock();

        let pos = match queue.requests.iter().position(|r| r.txn_id == txn.id()) {
            Some(pos) => pos,
            None => return false,
        };
        let removed = queue.requests.remove(pos);
        if removed.mode == LockMode::Shared {
            txn.shared_lock_set_mut().remove(&rid);
        } else {
            txn.exclusive_lock_set_mut().remove(&rid);
        }

        if queue.requests.is_empty() {
            table.remove(&rid);
            return true;
        }
        drop(table);

        // Grant from the head: every leading shared waiter; an upgrader is
        // promoted to exclusive; a head exclusive is granted alone.
        let queue = &mut *queue;
        for request in queue.requests.iter_mut() {
            if request.granted {
                break;
            }
            request.granted = true;
            request.gate.open();
            match request.mode {
                LockMode::Shared => continue,
                LockMode::Upgrading => {
                    queue.has_upgrading = false;
                    request.mode = LockMode::Exclusive;
                    break;
                }
                LockMode::Exclusive => break,
            }
        }
        true
    }
}
