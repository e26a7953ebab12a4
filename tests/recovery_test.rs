use std::sync::Arc;

use anyhow::Result;

use taigadb::storage::buffer::BufferPoolManager;
use taigadb::storage::table::TableHeap;
use taigadb::transaction::concurrency::{LockManager, TransactionManager};
use taigadb::transaction::wal::{LogRecovery, NoopLog};

mod common;
use common::{create_wal_environment, make_tuple, parse_tuple};

#[test]
fn test_redo_then_undo_after_crash() -> Result<()> {
    let (disk, buffer_pool, log_manager, policy, _dir) = create_wal_environment(64)?;
    let tm = TransactionManager::new(Arc::new(LockManager::new(true)), policy.clone());

    // T1 inserts a tuple and commits; T2 updates it and never finishes.
    let mut t1 = tm.begin()?;
    let heap = TableHeap::new(buffer_pool.clone(), policy.clone(), &mut t1)?;
    let first_page_id = heap.first_page_id();
    let tuple_a = make_tuple(1, "ada", 100);
    let rid = heap.insert_tuple(&mut t1, &tuple_a)?;
    tm.commit(&mut t1)?;
    let t2_id;
    {
        let mut t2 = tm.begin()?;
        t2_id = t2.id();
        heap.update_tuple(&mut t2, rid, &make_tuple(1, "ada", 999))?;
        // The update record reaches the disk, but no COMMIT ever does.
        log_manager.flush(true)?;
    }
    log_manager.stop_flush_thread();

    // Crash: all in-memory pages are gone; only the log survives.
    drop(heap);
    drop(buffer_pool);
    let buffer_pool = BufferPoolManager::new(64, disk.clone());
    let mut recovery = LogRecovery::new(disk.clone(), buffer_pool.clone());

    recovery.redo()?;
    // History replayed: the page reflects T2's update, and T2 is the one
    // transaction left without a COMMIT or ABORT.
    let heap = TableHeap::open(buffer_pool.clone(), Arc::new(NoopLog), first_page_id);
    let row = parse_tuple(&heap.get_tuple(rid)?.expect("tuple after redo"));
    assert_eq!(row.balance, 999);
    assert_eq!(recovery.active_transactions(), vec![t2_id]);

    recovery.undo()?;
    // T2's update is reversed; nothing is left to undo.
    let row = parse_tuple(&heap.get_tuple(rid)?.expect("tuple after undo"));
    assert_eq!(row.balance, 100);
    assert_eq!(row.name, "ada");
    assert!(recovery.active_transactions().is_empty());

    assert!(buffer_pool.check_all_unpinned());
    Ok(())
}

#[test]
fn test_recovery_is_idempotent() -> Result<()> {
    let (disk, buffer_pool, log_manager, policy, _dir) = create_wal_environment(64)?;
    let tm = TransactionManager::new(Arc::new(LockManager::new(true)), policy.clone());

    let mut t1 = tm.begin()?;
    let heap = TableHeap::new(buffer_pool.clone(), policy.clone(), &mut t1)?;
    let first_page_id = heap.first_page_id();
    let rid_a = heap.insert_tuple(&mut t1, &make_tuple(1, "ada", 100))?;
    let rid_b = heap.insert_tuple(&mut t1, &make_tuple(2, "bob", 200))?;
    tm.commit(&mut t1)?;

    let mut t2 = tm.begin()?;
    heap.update_tuple(&mut t2, rid_a, &make_tuple(1, "ada", -5))?;
    heap.mark_delete(&mut t2, rid_b)?;
    log_manager.flush(true)?;
    log_manager.stop_flush_thread();
    drop(heap);
    drop(buffer_pool);

    // First recovery, from a cold cache.
    let pool_one = BufferPoolManager::new(64, disk.clone());
    let mut recovery = LogRecovery::new(disk.clone(), pool_one.clone());
    recovery.redo()?;
    recovery.undo()?;
    let heap_one = TableHeap::open(pool_one.clone(), Arc::new(NoopLog), first_page_id);
    let row_a = parse_tuple(&heap_one.get_tuple(rid_a)?.expect("tuple a"));
    let row_b = parse_tuple(&heap_one.get_tuple(rid_b)?.expect("tuple b"));
    assert_eq!(row_a.balance, 100);
    assert_eq!(row_b.balance, 200);

    // Recover again from the same durable state (nothing was flushed, so
    // the disk still holds only the log): the second run must land on the
    // same page contents.
    drop(heap_one);
    drop(pool_one);

    let pool_two = BufferPoolManager::new(64, disk.clone());
    let mut recovery = LogRecovery::new(disk.clone(), pool_two.clone());
    recovery.redo()?;
    recovery.undo()?;
    let heap_two = TableHeap::open(pool_two.clone(), Arc::new(NoopLog), first_page_id);
    let row_a = parse_tuple(&heap_two.get_tuple(rid_a)?.expect("tuple a"));
    let row_b = parse_tuple(&heap_two.get_tuple(rid_b)?.expect("tuple b"));
    assert_eq!(row_a.balance, 100);
    assert_eq!(row_b.balance, 200);
    assert!(recovery.active_transactions().is_empty());
    Ok(())
}

#[test]
fn test_undo_removes_uncommitted_new_page() -> Result<()> {
    let (disk, buffer_pool, log_manager, policy, _dir) = create_wal_environment(64)?;
    let tm = TransactionManager::new(Arc::new(LockManager::new(true)), policy.clone());

    // The whole table — NEWPAGE included — belongs to a transaction that
    // never commits.
    let mut t1 = tm.begin()?;
    let heap = TableHeap::new(buffer_pool.clone(), policy.clone(), &mut t1)?;
    let first_page_id = heap.first_page_id();
    let rid = heap.insert_tuple(&mut t1, &make_tuple(1, "ghost", 0))?;
    log_manager.flush(true)?;
    log_manager.stop_flush_thread();
    drop(heap);
    drop(buffer_pool);

    let buffer_pool = BufferPoolManager::new(64, disk.clone());
    let mut recovery = LogRecovery::new(disk.clone(), buffer_pool.clone());
    recovery.redo()?;

    let heap = TableHeap::open(buffer_pool.clone(), Arc::new(NoopLog), first_page_id);
    assert!(heap.get_tuple(rid)?.is_some(), "redo rebuilt the insert");

    recovery.undo()?;
    // Insert undone, page deallocated: nothing readable remains.
    assert_eq!(heap.get_tuple(rid)?, None);
    assert!(recovery.active_transactions().is_empty());
    Ok(())
}

#[test]
fn test_committed_work_survives_an_abort_of_others() -> Result<()> {
    let (disk, buffer_pool, log_manager, policy, _dir) = create_wal_environment(64)?;
    let tm = TransactionManager::new(Arc::new(LockManager::new(true)), policy.clone());

    let mut t1 = tm.begin()?;
    let heap = TableHeap::new(buffer_pool.clone(), policy.clone(), &mut t1)?;
    let first_page_id = heap.first_page_id();
    let rid_a = heap.insert_tuple(&mut t1, &make_tuple(1, "ada", 100))?;
    tm.commit(&mut t1)?;

    // T2 aborts cleanly before the crash; T3 is in flight at the crash.
    let mut t2 = tm.begin()?;
    heap.update_tuple(&mut t2, rid_a, &make_tuple(1, "ada", 1))?;
    tm.abort(&mut t2)?;

    let mut t3 = tm.begin()?;
    let rid_c = heap.insert_tuple(&mut t3, &make_tuple(3, "cyn", 300))?;
    log_manager.flush(true)?;
    log_manager.stop_flush_thread();
    drop(heap);
    drop(buffer_pool);

    let buffer_pool = BufferPoolManager::new(64, disk.clone());
    let mut recovery = LogRecovery::new(disk.clone(), buffer_pool.clone());
    recovery.redo()?;
    assert_eq!(recovery.active_transactions(), vec![t3.id()]);
    recovery.undo()?;

    let heap = TableHeap::open(buffer_pool.clone(), Arc::new(NoopLog), first_page_id);
    // T1's tuple survives with T2's abort already rolled back in the log;
    // T3's insert is gone.
    let row = parse_tuple(&heap.get_tuple(rid_a)?.expect("committed tuple"));
    assert_eq!(row.balance, 100);
    assert_eq!(heap.get_tuple(rid_c)?, None);
    Ok(())
}
