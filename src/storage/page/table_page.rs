use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::common::types::{Lsn, PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::page::page::Page;

/// Error type for slotted-page tuple operations
#[derive(Error, Debug)]
pub enum TablePageError {
    #[error("Slot {0} is out of range")]
    SlotOutOfRange(u32),

    #[error("Slot {0} holds no tuple")]
    EmptySlot(u32),

    #[error("Slot {0} is already marked deleted")]
    AlreadyDeleted(u32),

    #[error("Slot {0} is not marked deleted")]
    NotDeleted(u32),

    #[error("Not enough free space for a {0}-byte tuple")]
    OutOfSpace(usize),
}

/// Result type for slotted-page tuple operations
pub type Result<T> = std::result::Result<T, TablePageError>;

// Header layout:
//   0..4   lsn of the last log record applied to this page
//   4..8   prev_page_id
//   8..12  next_page_id
//   12..16 free_space_pointer (tuple data grows down from PAGE_SIZE)
//   16..20 tuple_count
// followed by the slot array: (offset u32, size u32) per slot. The LSN is
// part of the page image so that replay gating survives eviction and
// restart.
const LSN_OFFSET: usize = 0;
const PREV_PAGE_ID_OFFSET: usize = 4;
const NEXT_PAGE_ID_OFFSET: usize = 8;
const FREE_SPACE_PTR_OFFSET: usize = 12;
const TUPLE_COUNT_OFFSET: usize = 16;
const SLOT_ARRAY_OFFSET: usize = 20;
const SLOT_SIZE: usize = 8;

/// High bit of a slot's size field marks a tuple as logically deleted.
const DELETE_MASK: u32 = 1 << 31;

fn slot_offset(slot: u32) -> usize {
    SLOT_ARRAY_OFFSET + slot as usize * SLOT_SIZE
}

fn read_slot(data: &[u8], slot: u32) -> (u32, u32) {
    let off = slot_offset(slot);
    (
        LittleEndian::read_u32(&data[off..]),
        LittleEndian::read_u32(&data[off + 4..]),
    )
}

fn write_slot(data: &mut [u8], slot: u32, tuple_offset: u32, tuple_size: u32) {
    let off = slot_offset(slot);
    LittleEndian::write_u32(&mut data[off..], tuple_offset);
    LittleEndian::write_u32(&mut data[off + 4..], tuple_size);
}

/// Read-only view of a slotted heap page.
pub struct TablePageView<'a> {
    page: &'a Page,
}

impl<'a> TablePageView<'a> {
    pub fn new(page: &'a Page) -> Self {
        Self { page }
    }

    pub fn lsn(&self) -> Lsn {
        LittleEndian::read_u32(&self.page.data[LSN_OFFSET..])
    }

    pub fn prev_page_id(&self) -> PageId {
        LittleEndian::read_u32(&self.page.data[PREV_PAGE_ID_OFFSET..])
    }

    pub fn next_page_id(&self) -> PageId {
        LittleEndian::read_u32(&self.page.data[NEXT_PAGE_ID_OFFSET..])
    }

    pub fn tuple_count(&self) -> u32 {
        LittleEndian::read_u32(&self.page.data[TUPLE_COUNT_OFFSET..])
    }

    /// Fetch the tuple in `slot`; `None` for empty or mark-deleted slots.
    pub fn get_tuple(&self, slot: u32) -> Option<Vec<u8>> {
        if slot >= self.tuple_count() {
            return None;
        }
        let (offset, size) = read_slot(&self.page.data, slot);
        if size == 0 || size & DELETE_MASK != 0 {
            return None;
        }
        let start = offset as usize;
        Some(self.page.data[start..start + size as usize].to_vec())
    }
}

/// Mutable view of a slotted heap page: tuple insert, the three delete
/// flavors, and in-place update.
pub struct TablePage<'a> {
    page: &'a mut Page,
}

impl<'a> TablePage<'a> {
    pub fn new(page: &'a mut Page) -> Self {
        Self { page }
    }

    /// Format an empty heap page linked after `prev_page_id`.
    pub fn init(&mut self, prev_page_id: PageId) {
        self.page.data.fill(0);
        LittleEndian::write_u32(&mut self.page.data[PREV_PAGE_ID_OFFSET..], prev_page_id);
        LittleEndian::write_u32(&mut self.page.data[NEXT_PAGE_ID_OFFSET..], INVALID_PAGE_ID);
        LittleEndian::write_u32(&mut self.page.data[FREE_SPACE_PTR_OFFSET..], PAGE_SIZE as u32);
        LittleEndian::write_u32(&mut self.page.data[TUPLE_COUNT_OFFSET..], 0);
    }

    pub fn lsn(&self) -> Lsn {
        LittleEndian::read_u32(&self.page.data[LSN_OFFSET..])
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        LittleEndian::write_u32(&mut self.page.data[LSN_OFFSET..], lsn);
    }

    pub fn prev_page_id(&self) -> PageId {
        LittleEndian::read_u32(&self.page.data[PREV_PAGE_ID_OFFSET..])
    }

    pub fn next_page_id(&self) -> PageId {
        LittleEndian::read_u32(&self.page.data[NEXT_PAGE_ID_OFFSET..])
    }

    pub fn set_prev_page_id(&mut self, prev: PageId) {
        LittleEndian::write_u32(&mut self.page.data[PREV_PAGE_ID_OFFSET..], prev);
    }

    pub fn set_next_page_id(&mut self, next: PageId) {
        LittleEndian::write_u32(&mut self.page.data[NEXT_PAGE_ID_OFFSET..], next);
    }

    pub fn tuple_count(&self) -> u32 {
        LittleEndian::read_u32(&self.page.data[TUPLE_COUNT_OFFSET..])
    }

    fn set_tuple_count(&mut self, count: u32) {
        LittleEndian::write_u32(&mut self.page.data[TUPLE_COUNT_OFFSET..], count);
    }

    fn free_space_pointer(&self) -> u32 {
        LittleEndian::read_u32(&self.page.data[FREE_SPACE_PTR_OFFSET..])
    }

    fn set_free_space_pointer(&mut self, ptr: u32) {
        LittleEndian::write_u32(&mut self.page.data[FREE_SPACE_PTR_OFFSET..], ptr);
    }

    /// Free bytes between the end of the slot array and the tuple region.
    fn free_space(&self) -> usize {
        self.free_space_pointer() as usize - slot_offset(self.tuple_count())
    }

    fn allocate(&mut self, size: usize) -> u32 {
        let ptr = self.free_space_pointer() - size as u32;
        self.set_free_space_pointer(ptr);
        ptr
    }

    pub fn get_tuple(&self, slot: u32) -> Option<Vec<u8>> {
        if slot >= self.tuple_count() {
            return None;
        }
        let (offset, size) = read_slot(&self.page.data, slot);
        if size == 0 || size & DELETE_MASK != 0 {
            return None;
        }
        let start = offset as usize;
        Some(self.page.data[start..start + size as usize].to_vec())
    }

    /// Insert a tuple into the first empty slot, or a fresh one. Returns the
    /// slot number.
    pub fn insert_tuple(&mut self, tuple: &[u8]) -> Result<u32> {
        let count = self.tuple_count();
        for slot in 0..count {
            let (_, size) = read_slot(&self.page.data, slot);
            if size == 0 {
                if self.free_space() < tuple.len() {
                    return Err(TablePageError::OutOfSpace(tuple.len()));
                }
                let offset = self.allocate(tuple.len());
                self.page.data[offset as usize..offset as usize + tuple.len()]
                    .copy_from_slice(tuple);
                write_slot(&mut self.page.data, slot, offset, tuple.len() as u32);
                return Ok(slot);
            }
        }
        if self.free_space() < tuple.len() + SLOT_SIZE {
            return Err(TablePageError::OutOfSpace(tuple.len()));
        }
        let offset = self.allocate(tuple.len());
        self.page.data[offset as usize..offset as usize + tuple.len()].copy_from_slice(tuple);
        write_slot(&mut self.page.data, count, offset, tuple.len() as u32);
        self.set_tuple_count(count + 1);
        Ok(count)
    }

    /// Slot-directed insert, used when replaying the log: the slot must be
    /// empty (or beyond the current slot array, which is extended).
    pub fn insert_tuple_at(&mut self, slot: u32, tuple: &[u8]) -> Result<()> {
        let count = self.tuple_count();
        let new_slots = (slot + 1).saturating_sub(count) as usize;
        if self.free_space() < tuple.len() + new_slots * SLOT_SIZE {
            return Err(TablePageError::OutOfSpace(tuple.len()));
        }
        if slot >= count {
            for s in count..=slot {
                write_slot(&mut self.page.data, s, 0, 0);
            }
            self.set_tuple_count(slot + 1);
        } else {
            let (_, size) = read_slot(&self.page.data, slot);
            if size != 0 {
                return Err(TablePageError::SlotOutOfRange(slot));
            }
        }
        let offset = self.allocate(tuple.len());
        self.page.data[offset as usize..offset as usize + tuple.len()].copy_from_slice(tuple);
        write_slot(&mut self.page.data, slot, offset, tuple.len() as u32);
        Ok(())
    }

    /// Logically delete a tuple; the bytes stay until `apply_delete`.
    pub fn mark_delete(&mut self, slot: u32) -> Result<()> {
        let (offset, size) = self.occupied_slot(slot)?;
        if size & DELETE_MASK != 0 {
            return Err(TablePageError::AlreadyDeleted(slot));
        }
        write_slot(&mut self.page.data, slot, offset, size | DELETE_MASK);
        Ok(())
    }

    /// Undo a `mark_delete`.
    pub fn rollback_delete(&mut self, slot: u32) -> Result<()> {
        let (offset, size) = self.occupied_slot(slot)?;
        if size & DELETE_MASK == 0 {
            return Err(TablePageError::NotDeleted(slot));
        }
        write_slot(&mut self.page.data, slot, offset, size & !DELETE_MASK);
        Ok(())
    }

    /// Physically remove a tuple (marked or not), returning its bytes.
    /// The slot becomes empty and reusable; the data region is not
    /// compacted.
    pub fn apply_delete(&mut self, slot: u32) -> Result<Vec<u8>> {
        let (offset, size) = self.occupied_slot(slot)?;
        let len = (size & !DELETE_MASK) as usize;
        let start = offset as usize;
        let tuple = self.page.data[start..start + len].to_vec();
        write_slot(&mut self.page.data, slot, 0, 0);
        Ok(tuple)
    }

    /// Replace a live tuple's bytes, returning the old image. Grows into
    /// fresh space when the new image is larger than the old slot.
    pub fn update_tuple(&mut self, slot: u32, tuple: &[u8]) -> Result<Vec<u8>> {
        let (offset, size) = self.occupied_slot(slot)?;
        if size & DELETE_MASK != 0 {
            return Err(TablePageError::AlreadyDeleted(slot));
        }
        let old_len = size as usize;
        let start = offset as usize;
        let old = self.page.data[start..start + old_len].to_vec();
        if tuple.len() <= old_len {
            self.page.data[start..start + tuple.len()].copy_from_slice(tuple);
            write_slot(&mut self.page.data, slot, offset, tuple.len() as u32);
        } else {
            if self.free_space() < tuple.len() {
                return Err(TablePageError::OutOfSpace(tuple.len()));
            }
            let new_offset = self.allocate(tuple.len());
            self.page.data[new_offset as usize..new_offset as usize + tuple.len()]
                .copy_from_slice(tuple);
            write_slot(&mut self.page.data, slot, new_offset, tuple.len() as u32);
        }
        Ok(old)
    }

    fn occupied_slot(&self, slot: u32) -> Result<(u32, u32)> {
        if slot >= self.tuple_count() {
            return Err(TablePageError::SlotOutOfRange(slot));
        }
        let (offset, size) = read_slot(&self.page.data, slot);
        if size == 0 {
            return Err(TablePageError::EmptySlot(slot));
        }
        Ok((offset, size))
    }
}
