use std::sync::Arc;

use crate::common::types::{Lsn, INVALID_LSN};
use crate::transaction::wal::log_manager::{LogManager, Result};
use crate::transaction::wal::log_record::LogRecord;

/// Injected logging policy: the mutating paths (table heap, transaction
/// manager) log through this seam instead of consulting a process-wide
/// switch. Recovery and latch-focused tests run with `NoopLog`; production
/// wires `WalLog`.
pub trait LogPolicy: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Append a record, assigning its LSN. Returns `INVALID_LSN` when
    /// logging is disabled.
    fn append(&self, record: &mut LogRecord) -> Result<Lsn>;

    /// Block until the log is durable. `force` kicks a flush rather than
    /// waiting for the next scheduled one.
    fn flush(&self, force: bool) -> Result<()>;
}

/// Logging disabled: appends vanish, flushes are immediate.
pub struct NoopLog;

impl LogPolicy for NoopLog {
    fn is_enabled(&self) -> bool {
        false
    }

    fn append(&self, _record: &mut LogRecord) -> Result<Lsn> {
        Ok(INVALID_LSN)
    }

    fn flush(&self, _force: bool) -> Result<()> {
        Ok(())
    }
}

/// Logging through a live write-ahead log manager.
pub struct WalLog {
    log_manager: Arc<LogManager>,
}

impl WalLog {
    pub fn new(log_manager: Arc<LogManager>) -> Self {
        Self { log_manager }
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log_manager
    }
}

impl LogPolicy for WalLog {
    fn is_enabled(&self) -> bool {
        true
    }

    fn append(&self, record: &mut LogRecord) -> Result<Lsn> {
        self.log_manager.append_log_record(record)
    }

    fn flush(&self, force: bool) -> Result<()> {
        self.log_manager.flush(force)
    }
}
