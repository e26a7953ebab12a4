use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::common::types::Lsn;
use crate::storage::disk::{DiskManager, DiskManagerError};
use crate::transaction::wal::log_record::LogRecord;

/// How long the flush thread sleeps before flushing whatever accumulated.
pub const LOG_TIMEOUT: Duration = Duration::from_millis(50);

/// Buffered log bytes that trigger an early flush.
const LOG_BUFFER_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Error type for log manager operations
#[derive(Error, Debug)]
pub enum LogManagerError {
    #[error("Disk error: {0}")]
    DiskError(#[from] DiskManagerError),

    #[error("Invalid log state: {0}")]
    InvalidState(String),
}

/// Result type for log manager operations
pub type Result<T> = std::result::Result<T, LogManagerError>;

struct LogBuffer {
    bytes: Vec<u8>,
    /// Last LSN serialized into `bytes`.
    last_lsn: Lsn,
}

/// Write-ahead log manager: assigns monotonically increasing LSNs, buffers
/// serialized records in memory, and persists them from a background flush
/// thread that runs on a timeout, on buffer pressure, or on demand.
pub struct LogManager {
    disk_manager: Arc<DiskManager>,
    buffer: Mutex<LogBuffer>,
    /// Wakes the flush thread (pressure, demand, shutdown).
    flush_request: Condvar,
    /// Signals waiters after each completed flush.
    flush_done: Condvar,
    next_lsn: AtomicU32,
    flushed_lsn: AtomicU32,
    shutting_down: AtomicBool,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    pub fn new(disk_manager: Arc<DiskManager>) -> Arc<Self> {
        let manager = Arc::new(Self {
            disk_manager,
            buffer: Mutex::new(LogBuffer {
                bytes: Vec::with_capacity(LOG_BUFFER_FLUSH_THRESHOLD),
                last_lsn: 0,
            }),
            flush_request: Condvar::new(),
            flush_done: Condvar::new(),
            next_lsn: AtomicU32::new(1),
            flushed_lsn: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
            flush_thread: Mutex::new(None),
        });
        manager.run_flush_thread()
    }

    /// Serialize a record into the log buffer, assigning its LSN. Thread
    /// safe; LSN order matches buffer order.
    pub fn append_log_record(&self, record: &mut LogRecord) -> Result<Lsn> {
        let mut buffer = self.buffer.lock();
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        record.lsn = lsn;
        buffer.bytes.extend_from_slice(&record.serialize());
        buffer.last_lsn = lsn;
        if buffer.bytes.len() >= LOG_BUFFER_FLUSH_THRESHOLD {
            self.flush_request.notify_one();
        }
        Ok(lsn)
    }

    /// The most recently assigned LSN.
    pub fn current_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst) - 1
    }

    /// The highest LSN known durable.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    /// Block until everything appended so far is durable. With
    /// `force = true` the flush thread is kicked immediately; otherwise
    /// this waits for the next scheduled (timeout or pressure) flush.
    pub fn flush(&self, force: bool) -> Result<()> {
        let target = self.current_lsn();
        if target == 0 {
            return Ok(());
        }
        let mut buffer = self.buffer.lock();
        while self.flushed_lsn.load(Ordering::SeqCst) < target {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(LogManagerError::InvalidState(
                    "log manager is shutting down".to_string(),
                ));
            }
            if force {
                self.flush_request.notify_one();
            }
            self.flush_done.wait_for(&mut buffer, LOG_TIMEOUT);
        }
        Ok(())
    }

    fn run_flush_thread(self: Arc<Self>) -> Arc<Self> {
        let manager = Arc::clone(&self);
        let handle = std::thread::spawn(move || manager.flush_loop());
        *self.flush_thread.lock() = Some(handle);
        self
    }

    /// Stop the flush thread after draining the buffer. Idempotent.
    pub fn stop_flush_thread(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.flush_request.notify_one();
        let handle = self.flush_thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("log flush thread panicked during shutdown");
            }
        }
    }

    fn flush_loop(&self) {
        let mut buffer = self.buffer.lock();
        loop {
            if buffer.bytes.is_empty() {
                if self.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                self.flush_request.wait_for(&mut buffer, LOG_TIMEOUT);
                continue;
            }
            let data = std::mem::take(&mut buffer.bytes);
            let up_to = buffer.last_lsn;
            drop(buffer);

            match self.disk_manager.append_log(&data) {
                Ok(()) => {
                    self.flushed_lsn.store(up_to, Ordering::SeqCst);
                    debug!("flushed log up to lsn {}", up_to);
                }
                Err(e) => {
                    // Put the bytes back so durability is never silently
                    // dropped; waiters keep blocking until a retry works.
                    warn!("log flush failed: {}", e);
                    let mut locked = self.buffer.lock();
                    let mut restored = data;
                    restored.extend_from_slice(&locked.bytes);
                    locked.bytes = restored;
                    drop(locked);
                }
            }

            buffer = self.buffer.lock();
            self.flush_done.notify_all();
        }
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        // The thread owns an Arc to self, so by the time this runs it has
        // already exited; this covers explicit-stop-free shutdown paths.
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Rid;
    use tempfile::TempDir;

    fn test_log_manager() -> (Arc<LogManager>, Arc<DiskManager>, TempDir) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().join("test.db")).unwrap());
        (LogManager::new(disk.clone()), disk, dir)
    }

    #[test]
    fn test_lsns_are_monotonic() {
        let (manager, _disk, _dir) = test_log_manager();
        let mut a = LogRecord::new_begin(1);
        let mut b = LogRecord::new_insert(1, 0, Rid::new(1, 0), b"t".to_vec());
        let lsn_a = manager.append_log_record(&mut a).unwrap();
        let lsn_b = manager.append_log_record(&mut b).unwrap();
        assert_eq!(lsn_a, 1);
        assert_eq!(lsn_b, 2);
        assert_eq!(a.lsn, 1);
        assert_eq!(b.lsn, 2);
        manager.stop_flush_thread();
    }

    #[test]
    fn test_forced_flush_is_durable() {
        let (manager, disk, _dir) = test_log_manager();
        let mut record = LogRecord::new_begin(1);
        manager.append_log_record(&mut record).unwrap();
        manager.flush(true).unwrap();

        assert_eq!(manager.flushed_lsn(), 1);
        let mut buf = vec![0u8; 64];
        assert!(disk.read_log(&mut buf, 0).unwrap());
        let parsed = LogRecord::deserialize(&buf).unwrap();
        assert_eq!(parsed, record);
        manager.stop_flush_thread();
    }

    #[test]
    fn test_timeout_flush_happens_without_force() {
        let (manager, _disk, _dir) = test_log_manager();
        let mut record = LogRecord::new_begin(3);
        manager.append_log_record(&mut record).unwrap();
        // No kick: the scheduled flush must pick it up.
        manager.flush(false).unwrap();
        assert_eq!(manager.flushed_lsn(), 1);
        manager.stop_flush_thread();
    }

    #[test]
    fn test_concurrent_appends_keep_order() {
        let (manager, disk, _dir) = test_log_manager();
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let manager = manager.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let mut record = LogRecord::new_begin(t);
                    manager.append_log_record(&mut record).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        manager.flush(true).unwrap();
        manager.stop_flush_thread();

        // Replay the file: LSNs must be strictly increasing from 1.
        let size = disk.log_size().unwrap() as usize;
        let mut buf = vec![0u8; size];
        assert!(disk.read_log(&mut buf, 0).unwrap());
        let mut offset = 0usize;
        let mut expected = 1;
        while let Some(record) = LogRecord::deserialize(&buf[offset..]) {
            assert_eq!(record.lsn, expected);
            expected += 1;
            offset += record.size as usize;
        }
        assert_eq!(expected, 201);
    }
}
