pub mod concurrency;
pub mod wal;

pub use concurrency::{LockManager, Transaction, TransactionManager, TransactionState};
pub use wal::{LogManager, LogRecord, LogRecordType, LogRecovery};
