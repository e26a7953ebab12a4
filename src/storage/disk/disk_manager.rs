use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{PageId, HEADER_PAGE_ID, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::page::Page;

/// Error type for disk operations
#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// Result type for disk operations
pub type Result<T> = std::result::Result<T, DiskManagerError>;

/// DiskManager handles the raw file I/O: fixed-size pages in the database
/// file and an append-only write-ahead log file alongside it.
pub struct DiskManager {
    db_file: Mutex<File>,
    log_file: Mutex<File>,
    next_page_id: AtomicU32,
}

impl DiskManager {
    /// Open (or create) the database file at `db_path`; the log file lives
    /// next to it with a `.wal` extension.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let log_path: PathBuf = db_path.as_ref().with_extension("wal");
        Self::with_log_path(db_path, log_path)
    }

    pub fn with_log_path(db_path: impl AsRef<Path>, log_path: impl AsRef<Path>) -> Result<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(log_path)?;

        // Page 0 is the header page; data pages start at 1.
        let pages_on_disk = (db_file.metadata()?.len() / PAGE_SIZE as u64) as PageId;
        let next_page_id = pages_on_disk.max(1);

        Ok(Self {
            db_file: Mutex::new(db_file),
            log_file: Mutex::new(log_file),
            next_page_id: AtomicU32::new(next_page_id),
        })
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id as u64 * PAGE_SIZE as u64
    }

    /// Read a page into `page`. Reading past the end of the file yields a
    /// zeroed page, so freshly allocated pages need no eager write.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<()> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }
        let offset = Self::page_offset(page_id);
        let mut file = self.db_file.lock();
        let file_size = file.metadata()?.len();

        page.page_id = page_id;
        if offset >= file_size {
            page.data.fill(0);
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut page.data)?;
        Ok(())
    }

    /// Write a page image at its offset, extending the file if needed.
    pub fn write_page(&self, page: &Page) -> Result<()> {
        if page.page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }
        let offset = Self::page_offset(page.page_id);
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.data)?;
        file.flush()?;
        Ok(())
    }

    /// Hand out the next unused page id.
    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Return a page to the allocator. The on-disk image is zeroed so stale
    /// contents cannot resurface; the id itself is not reused.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        if page_id == INVALID_PAGE_ID || page_id == HEADER_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }
        let offset = Self::page_offset(page_id);
        let mut file = self.db_file.lock();
        if offset < file.metadata()?.len() {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&[0u8; PAGE_SIZE])?;
            file.flush()?;
        }
        Ok(())
    }

    /// Append raw bytes to the log file and sync them to durable storage.
    pub fn append_log(&self, data: &[u8]) -> Result<()> {
        let mut file = self.log_file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Fill `buf` with log bytes starting at `offset`. Returns `false` when
    /// `offset` is at or past the end of the log; bytes past the end are
    /// zeroed so a partial read terminates record parsing cleanly.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<bool> {
        let mut file = self.log_file.lock();
        let log_size = file.metadata()?.len();
        if offset >= log_size {
            return Ok(false);
        }
        file.seek(SeekFrom::Start(offset))?;
        let available = ((log_size - offset) as usize).min(buf.len());
        file.read_exact(&mut buf[..available])?;
        buf[available..].fill(0);
        Ok(true)
    }

    pub fn log_size(&self) -> Result<u64> {
        Ok(self.log_file.lock().metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_disk() -> (DiskManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let disk = DiskManager::new(dir.path().join("test.db")).unwrap();
        (disk, dir)
    }

    #[test]
    fn test_page_round_trip() {
        let (disk, _dir) = test_disk();
        let page_id = disk.allocate_page();

        let mut page = Page::new(page_id);
        page.data[0] = 0xde;
        page.data[PAGE_SIZE - 1] = 0xad;
        disk.write_page(&page).unwrap();

        let mut read_back = Page::new(0);
        disk.read_page(page_id, &mut read_back).unwrap();
        assert_eq!(read_back.page_id, page_id);
        assert_eq!(read_back.data[0], 0xde);
        assert_eq!(read_back.data[PAGE_SIZE - 1], 0xad);
    }

    #[test]
    fn test_read_unwritten_page_is_zeroed() {
        let (disk, _dir) = test_disk();
        let page_id = disk.allocate_page();
        let mut page = Page::new(0);
        page.data.fill(0xff);
        disk.read_page(page_id, &mut page).unwrap();
        assert!(page.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_log_append_and_read() {
        let (disk, _dir) = test_disk();
        disk.append_log(b"hello ").unwrap();
        disk.append_log(b"log").unwrap();

        let mut buf = [0u8; 16];
        assert!(disk.read_log(&mut buf, 0).unwrap());
        assert_eq!(&buf[..9], b"hello log");
        assert!(buf[9..].iter().all(|&b| b == 0), "tail is zero filled");

        assert!(!disk.read_log(&mut buf, 9).unwrap(), "EOF returns false");
        assert!(disk.read_log(&mut buf, 6).unwrap());
        assert_eq!(&buf[..3], b"log");
    }

    #[test]
    fn test_allocate_monotonic() {
        let (disk, _dir) = test_disk();
        let a = disk.allocate_page();
        let b = disk.allocate_page();
        assert!(a >= 1);
        assert_eq!(b, a + 1);
    }
}
