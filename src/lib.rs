// Export public modules
pub mod common;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use index::btree::BPlusTree;
pub use storage::buffer::{BufferPoolError, BufferPoolManager};
pub use storage::disk::DiskManager;
pub use storage::table::TableHeap;
pub use transaction::concurrency::{LockManager, Transaction, TransactionManager};
pub use transaction::wal::{LogManager, LogRecovery};
