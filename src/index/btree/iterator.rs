use std::sync::Arc;

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::Result;
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::BTreeNode;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::ReadPageGuard;

struct LeafState<K> {
    /// Keeps the pin and shared latch on the current leaf.
    _guard: ReadPageGuard,
    entries: Vec<(K, Rid)>,
    next_page_id: PageId,
}

/// Forward iterator over the leaf chain. Holds one leaf at a time, pinned
/// and shared-latched, releasing it before stepping to the next sibling.
/// Readers are snapshot-free: entries behind the cursor may change without
/// invalidating it, and concurrent writes ahead may or may not be observed.
pub struct TreeIterator<K: IndexKey> {
    buffer_pool: Arc<BufferPoolManager>,
    leaf: Option<LeafState<K>>,
    index: usize,
}

impl<K: IndexKey> TreeIterator<K> {
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        guard: ReadPageGuard,
        index: usize,
    ) -> Result<Self> {
        let state = match BTreeNode::<K>::decode(&guard)? {
            BTreeNode::Leaf(leaf) => LeafState {
                _guard: guard,
                entries: leaf.entries,
                next_page_id: leaf.next_page_id,
            },
            BTreeNode::Internal(_) => {
                return Err(crate::index::btree::error::BTreeError::InvalidPageFormat(
                    guard.page_id(),
                ))
            }
        };
        Ok(Self {
            buffer_pool,
            leaf: Some(state),
            index,
        })
    }

    pub(crate) fn empty(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            leaf: None,
            index: 0,
        }
    }

    /// True once the iterator has walked off the end of the leaf chain.
    pub fn is_end(&self) -> bool {
        match &self.leaf {
            None => true,
            Some(state) => {
                self.index >= state.entries.len() && state.next_page_id == INVALID_PAGE_ID
            }
        }
    }
}

impl<K: IndexKey> Iterator for TreeIterator<K> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            let state = self.leaf.as_ref()?;
            if self.index < state.entries.len() {
                let item = state.entries[self.index].clone();
                self.index += 1;
                return Some(item);
            }
            let next_id = state.next_page_id;
            // Release the current leaf before latching its sibling.
            self.leaf = None;
            if next_id == INVALID_PAGE_ID {
                return None;
            }
            let guard = match self.buffer_pool.fetch_page_read(next_id) {
                Ok(guard) => guard,
                Err(_) => return None,
            };
            match BTreeNode::<K>::decode(&guard) {
                Ok(BTreeNode::Leaf(leaf)) => {
                    self.leaf = Some(LeafState {
                        _guard: guard,
                        entries: leaf.entries,
                        next_page_id: leaf.next_page_id,
                    });
                    self.index = 0;
                }
                _ => return None,
            }
        }
    }
}
