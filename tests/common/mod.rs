use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use taigadb::storage::buffer::BufferPoolManager;
use taigadb::storage::disk::DiskManager;
use taigadb::transaction::wal::{LogManager, LogPolicy, WalLog};

// Surface `log` output (RUST_LOG=debug) from test runs
#[allow(dead_code)]
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Create a buffer pool over a temporary database file
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, TempDir)> {
    init_test_logging();
    let dir = TempDir::new()?;
    let disk = Arc::new(DiskManager::new(dir.path().join("test.db"))?);
    Ok((BufferPoolManager::new(pool_size, disk), dir))
}

// Create a full write-ahead-logged environment: disk, buffer pool, log
// manager, and the logging policy wired to it
#[allow(dead_code)]
pub fn create_wal_environment(
    pool_size: usize,
) -> Result<(
    Arc<DiskManager>,
    Arc<BufferPoolManager>,
    Arc<LogManager>,
    Arc<dyn LogPolicy>,
    TempDir,
)> {
    init_test_logging();
    let dir = TempDir::new()?;
    let disk = Arc::new(DiskManager::new(dir.path().join("test.db"))?);
    let buffer_pool = BufferPoolManager::new(pool_size, disk.clone());
    let log_manager = LogManager::new(disk.clone());
    let policy: Arc<dyn LogPolicy> = Arc::new(WalLog::new(log_manager.clone()));
    Ok((disk, buffer_pool, log_manager, policy, dir))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRow {
    pub id: u32,
    pub name: String,
    pub balance: i64,
}

// Serialize a test row the way the executor layer would hand tuples down
#[allow(dead_code)]
pub fn make_tuple(id: u32, name: &str, balance: i64) -> Vec<u8> {
    bincode::serialize(&TestRow {
        id,
        name: name.to_string(),
        balance,
    })
    .expect("test row serialization")
}

#[allow(dead_code)]
pub fn parse_tuple(bytes: &[u8]) -> TestRow {
    bincode::deserialize(bytes).expect("test row deserialization")
}
