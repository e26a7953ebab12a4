use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::common::types::{FrameId, PageId, INVALID_PAGE_ID};
use crate::storage::buffer::error::{BufferPoolError, Result};
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;
use crate::storage::page::{Page, PageFrame, ReadPageGuard, WritePageGuard};

struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    pin_count: Vec<u32>,
    dirty: Vec<bool>,
    free_list: VecDeque<FrameId>,
    replacer: LruReplacer,
}

/// Buffer pool manager: maps pages to a fixed set of in-memory frames,
/// pinning pages while in use and evicting least-recently-used unpinned
/// frames. Frames carry a reader-writer latch; the guard constructors hand
/// out pinned, latched pages that release both on drop.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<Arc<PageFrame>>,
    inner: Mutex<PoolInner>,
    disk_manager: Arc<DiskManager>,
    /// Handle to ourselves, handed to guards so they can unpin on drop.
    self_ref: Weak<BufferPoolManager>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk_manager: Arc<DiskManager>) -> Arc<Self> {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for i in 0..pool_size {
            frames.push(Arc::new(PageFrame::new(Page::new(INVALID_PAGE_ID))));
            free_list.push_back(i as FrameId);
        }
        Arc::new_cyclic(|self_ref| Self {
            pool_size,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                pin_count: vec![0; pool_size],
                dirty: vec![false; pool_size],
                free_list,
                replacer: LruReplacer::new(pool_size),
            }),
            disk_manager,
            self_ref: self_ref.clone(),
        })
    }

    fn shared_handle(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("buffer pool used after its last Arc was dropped")
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Fetch and pin a page, reading it from disk on a miss. The caller is
    /// responsible for latching the frame and for a balancing `unpin_page`.
    pub fn fetch_page(&self, page_id: PageId) -> Result<Arc<PageFrame>> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot fetch the invalid page id".to_string(),
            ));
        }
        let mut inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            inner.pin_count[frame_id as usize] += 1;
            inner.replacer.remove(frame_id);
            return Ok(self.frames[frame_id as usize].clone());
        }

        let frame_id = self.allocate_frame(&mut inner)?;
        let frame = &self.frames[frame_id as usize];
        {
            // The frame is unpinned and unmapped, so the latch is free.
            frame.latch().write_lock();
            let result = self.disk_manager.read_page(page_id, unsafe { frame.page_mut() });
            frame.latch().write_unlock();
            if let Err(e) = result {
                inner.free_list.push_back(frame_id);
                return Err(e.into());
            }
        }
        inner.page_table.insert(page_id, frame_id);
        inner.pin_count[frame_id as usize] = 1;
        inner.dirty[frame_id as usize] = false;
        Ok(frame.clone())
    }

    /// Allocate a fresh page on disk and pin it in a frame. The new page is
    /// born dirty.
    pub fn new_page(&self) -> Result<(Arc<PageFrame>, PageId)> {
        let mut inner = self.inner.lock();
        let frame_id = self.allocate_frame(&mut inner)?;
        let page_id = self.disk_manager.allocate_page();

        let frame = &self.frames[frame_id as usize];
        {
            frame.latch().write_lock();
            unsafe {
                *frame.page_mut() = Page::new(page_id);
            }
            frame.latch().write_unlock();
        }
        inner.page_table.insert(page_id, frame_id);
        inner.pin_count[frame_id as usize] = 1;
        inner.dirty[frame_id as usize] = true;
        Ok((frame.clone(), page_id))
    }

    /// Drop one pin on a page, recording dirtiness. The page becomes
    /// evictable once its pin count reaches zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let frame_id = match inner.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };
        let idx = frame_id as usize;
        if inner.pin_count[idx] > 0 {
            inner.pin_count[idx] -= 1;
        }
        if is_dirty {
            inner.dirty[idx] = true;
        }
        if inner.pin_count[idx] == 0 {
            inner.replacer.record_access(frame_id);
        }
        Ok(())
    }

    /// Remove a page from the pool and deallocate it on disk. Returns
    /// `false` (without deallocating) when the page is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.inner.lock();
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let idx = frame_id as usize;
            if inner.pin_count[idx] > 0 {
                return Ok(false);
            }
            inner.page_table.remove(&page_id);
            inner.replacer.remove(frame_id);
            inner.dirty[idx] = false;
            let frame = &self.frames[idx];
            frame.latch().write_lock();
            unsafe {
                *frame.page_mut() = Page::new(INVALID_PAGE_ID);
            }
            frame.latch().write_unlock();
            inner.free_list.push_back(frame_id);
        }
        self.disk_manager.deallocate_page(page_id)?;
        Ok(true)
    }

    /// Write one page back to disk if dirty.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        let frame_id = match inner.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };
        let idx = frame_id as usize;
        if inner.dirty[idx] {
            let frame = &self.frames[idx];
            frame.latch().read_lock();
            let result = self.disk_manager.write_page(unsafe { frame.page() });
            frame.latch().read_unlock();
            result?;
            inner.dirty[idx] = false;
        }
        Ok(())
    }

    /// Write every dirty page back to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let page_ids: Vec<PageId> = {
            let inner = self.inner.lock();
            inner.page_table.keys().copied().collect()
        };
        for page_id in page_ids {
            match self.flush_page(page_id) {
                Ok(()) | Err(BufferPoolError::PageNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Test hook: true iff no page is pinned.
    pub fn check_all_unpinned(&self) -> bool {
        let inner = self.inner.lock();
        inner.pin_count.iter().all(|&p| p == 0)
    }

    /// Fetch a page and latch it shared, as a guard.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        let frame = self.fetch_page(page_id)?;
        frame.latch().read_lock();
        Ok(ReadPageGuard::new(self.shared_handle(), frame, page_id))
    }

    /// Fetch a page and latch it exclusive, as a guard.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        let frame = self.fetch_page(page_id)?;
        frame.latch().write_lock();
        Ok(WritePageGuard::new(self.shared_handle(), frame, page_id))
    }

    /// Allocate a fresh page, exclusive-latched, as a guard.
    pub fn new_page_write(&self) -> Result<(WritePageGuard, PageId)> {
        let (frame, page_id) = self.new_page()?;
        frame.latch().write_lock();
        Ok((WritePageGuard::new(self.shared_handle(), frame, page_id), page_id))
    }

    /// Pick a frame from the free list, or evict the LRU victim (writing it
    /// back if dirty).
    fn allocate_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }
        if let Some(victim_id) = inner.replacer.victim() {
            let idx = victim_id as usize;
            debug_assert_eq!(inner.pin_count[idx], 0, "replacer held a pinned frame");
            let frame = &self.frames[idx];

            // Unpinned frames have no guard holders, so this cannot block.
            frame.latch().write_lock();
            let old_page_id = unsafe { frame.page() }.page_id;
            let result = if inner.dirty[idx] {
                self.disk_manager.write_page(unsafe { frame.page() })
            } else {
                Ok(())
            };
            frame.latch().write_unlock();
            result?;

            if old_page_id != INVALID_PAGE_ID {
                inner.page_table.remove(&old_page_id);
            }
            inner.dirty[idx] = false;
            return Ok(victim_id);
        }
        Err(BufferPoolError::BufferPoolFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_pool(pool_size: usize) -> (Arc<BufferPoolManager>, TempDir) {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().join("test.db")).unwrap());
        (BufferPoolManager::new(pool_size, disk), dir)
    }

    #[test]
    fn test_new_page_and_fetch() {
        let (pool, _dir) = test_pool(4);
        let (guard, page_id) = pool.new_page_write().unwrap();
        drop(guard);

        let guard = pool.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.page_id(), page_id);
        drop(guard);
        assert!(pool.check_all_unpinned());
    }

    #[test]
    fn test_data_survives_eviction() {
        let (pool, _dir) = test_pool(2);
        let (mut guard, page_id) = pool.new_page_write().unwrap();
        guard.data[100] = 42;
        drop(guard);

        // Churn through enough pages to evict the first one.
        for _ in 0..4 {
            let (g, _) = pool.new_page_write().unwrap();
            drop(g);
        }

        let guard = pool.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data[100], 42);
    }

    #[test]
    fn test_pool_full_when_all_pinned() {
        let (pool, _dir) = test_pool(2);
        let (_g1, _) = pool.new_page_write().unwrap();
        let (_g2, _) = pool.new_page_write().unwrap();
        assert!(matches!(
            pool.new_page(),
            Err(BufferPoolError::BufferPoolFull)
        ));
    }

    #[test]
    fn test_delete_page() {
        let (pool, _dir) = test_pool(4);
        let (guard, page_id) = pool.new_page_write().unwrap();

        // Pinned: refuses.
        assert!(!pool.delete_page(page_id).unwrap());
        drop(guard);
        assert!(pool.delete_page(page_id).unwrap());
        assert!(pool.check_all_unpinned());
    }

    #[test]
    fn test_unpin_unknown_page() {
        let (pool, _dir) = test_pool(2);
        assert!(matches!(
            pool.unpin_page(99, false),
            Err(BufferPoolError::PageNotFound(99))
        ));
    }
}
