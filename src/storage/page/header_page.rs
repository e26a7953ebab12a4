use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{PageId, PAGE_SIZE};
use crate::storage::page::page::Page;

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_LEN: usize = 32;
const RECORD_SIZE: usize = NAME_LEN + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// View over page 0: a persistent directory of (index name, root page id)
/// records. Names are at most 31 bytes, zero padded to a fixed 32-byte slot.
pub struct HeaderPage<'a> {
    page: &'a mut Page,
}

impl<'a> HeaderPage<'a> {
    pub fn new(page: &'a mut Page) -> Self {
        Self { page }
    }

    pub fn record_count(&self) -> usize {
        LittleEndian::read_u32(&self.page.data[RECORD_COUNT_OFFSET..]) as usize
    }

    fn set_record_count(&mut self, count: usize) {
        LittleEndian::write_u32(&mut self.page.data[RECORD_COUNT_OFFSET..], count as u32);
    }

    fn record_offset(index: usize) -> usize {
        RECORDS_OFFSET + index * RECORD_SIZE
    }

    fn name_at(&self, index: usize) -> &str {
        let off = Self::record_offset(index);
        let raw = &self.page.data[off..off + NAME_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        std::str::from_utf8(&raw[..end]).unwrap_or("")
    }

    fn find(&self, name: &str) -> Option<usize> {
        (0..self.record_count()).find(|&i| self.name_at(i) == name)
    }

    /// Add a record. Returns false if the name is too long, already present,
    /// or the directory is full.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        if name.len() >= NAME_LEN || self.find(name).is_some() {
            return false;
        }
        let count = self.record_count();
        if count >= MAX_RECORDS {
            return false;
        }
        let off = Self::record_offset(count);
        self.page.data[off..off + NAME_LEN].fill(0);
        self.page.data[off..off + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_u32(&mut self.page.data[off + NAME_LEN..], root_page_id);
        self.set_record_count(count + 1);
        true
    }

    /// Overwrite an existing record's root page id. Returns false if absent.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        match self.find(name) {
            Some(i) => {
                let off = Self::record_offset(i) + NAME_LEN;
                LittleEndian::write_u32(&mut self.page.data[off..], root_page_id);
                true
            }
            None => false,
        }
    }

    pub fn get_record(&self, name: &str) -> Option<PageId> {
        self.find(name).map(|i| {
            let off = Self::record_offset(i) + NAME_LEN;
            LittleEndian::read_u32(&self.page.data[off..])
        })
    }

    /// Remove a record, compacting the tail over it. Returns false if absent.
    pub fn delete_record(&mut self, name: &str) -> bool {
        match self.find(name) {
            Some(i) => {
                let count = self.record_count();
                let from = Self::record_offset(i + 1);
                let to = Self::record_offset(i);
                let tail = Self::record_offset(count);
                self.page.data.copy_within(from..tail, to);
                self.set_record_count(count - 1);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::HEADER_PAGE_ID;

    #[test]
    fn test_header_page_records() {
        let mut page = Page::new(HEADER_PAGE_ID);
        let mut header = HeaderPage::new(&mut page);

        assert_eq!(header.record_count(), 0);
        assert!(header.insert_record("orders_pk", 7));
        assert!(header.insert_record("users_pk", 12));
        assert!(!header.insert_record("orders_pk", 9), "duplicate name");

        assert_eq!(header.get_record("orders_pk"), Some(7));
        assert_eq!(header.get_record("users_pk"), Some(12));
        assert_eq!(header.get_record("missing"), None);

        assert!(header.update_record("orders_pk", 21));
        assert_eq!(header.get_record("orders_pk"), Some(21));
        assert!(!header.update_record("missing", 1));

        assert!(header.delete_record("orders_pk"));
        assert_eq!(header.record_count(), 1);
        assert_eq!(header.get_record("orders_pk"), None);
        assert_eq!(header.get_record("users_pk"), Some(12));
    }

    #[test]
    fn test_header_page_rejects_long_name() {
        let mut page = Page::new(HEADER_PAGE_ID);
        let mut header = HeaderPage::new(&mut page);
        let long = "x".repeat(NAME_LEN);
        assert!(!header.insert_record(&long, 1));
    }
}
