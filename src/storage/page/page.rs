use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::common::rwlatch::RwLatch;
use crate::common::types::{PageId, PAGE_SIZE};
use crate::storage::buffer::BufferPoolManager;

/// In-memory image of one disk page. Pages that track an LSN (heap pages)
/// carry it inside the byte image, so the frame holds nothing but the
/// bytes and the id.
pub struct Page {
    pub page_id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            data: [0; PAGE_SIZE],
        }
    }
}

/// A buffer pool frame: one page behind a reader-writer latch.
///
/// The page cell is only ever dereferenced through `ReadPageGuard` /
/// `WritePageGuard` (which hold the latch) or by the buffer pool while the
/// frame is unpinned and exclusively latched for replacement. That protocol
/// is what makes the `UnsafeCell` accesses below sound.
pub struct PageFrame {
    latch: RwLatch,
    cell: UnsafeCell<Page>,
}

unsafe impl Send for PageFrame {}
unsafe impl Sync for PageFrame {}

impl PageFrame {
    pub(crate) fn new(page: Page) -> Self {
        Self {
            latch: RwLatch::new(),
            cell: UnsafeCell::new(page),
        }
    }

    pub fn latch(&self) -> &RwLatch {
        &self.latch
    }

    /// Caller must hold the latch in shared or exclusive mode.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn page(&self) -> &Page {
        &*self.cell.get()
    }

    /// Caller must hold the latch in exclusive mode.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn page_mut(&self) -> &mut Page {
        &mut *self.cell.get()
    }
}

/// Shared access to a page: holds a pin and the frame latch in read mode,
/// releasing both on drop.
pub struct ReadPageGuard {
    buffer_pool: Arc<BufferPoolManager>,
    frame: Arc<PageFrame>,
    page_id: PageId,
}

impl ReadPageGuard {
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        frame: Arc<PageFrame>,
        page_id: PageId,
    ) -> Self {
        Self {
            buffer_pool,
            frame,
            page_id,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for ReadPageGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        // Shared latch held for the guard's lifetime.
        unsafe { self.frame.page() }
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        self.frame.latch().read_unlock();
        let _ = self.buffer_pool.unpin_page(self.page_id, false);
    }
}

/// Exclusive access to a page: holds a pin and the frame latch in write
/// mode. The page is unpinned dirty iff it was mutably dereferenced.
pub struct WritePageGuard {
    buffer_pool: Arc<BufferPoolManager>,
    frame: Arc<PageFrame>,
    page_id: PageId,
    dirty: bool,
}

impl WritePageGuard {
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        frame: Arc<PageFrame>,
        page_id: PageId,
    ) -> Self {
        Self {
            buffer_pool,
            frame,
            page_id,
            dirty: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for WritePageGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        // Exclusive latch held for the guard's lifetime.
        unsafe { self.frame.page() }
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Page {
        self.dirty = true;
        // Exclusive latch held for the guard's lifetime.
        unsafe { self.frame.page_mut() }
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        self.frame.latch().write_unlock();
        let _ = self.buffer_pool.unpin_page(self.page_id, self.dirty);
    }
}
