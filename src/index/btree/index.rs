use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::common::rwlatch::RwLatch;
use crate::common::types::{PageId, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::{BTreeError, Result};
use crate::index::btree::iterator::TreeIterator;
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::{
    internal_capacity, leaf_capacity, BTreeNode, InternalNode, LeafNode, OpType,
    PARENT_POINTER_OFFSET,
};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::{HeaderPage, ReadPageGuard, WritePageGuard};

/// RAII hold on the tree-root latch. Acquired exactly once at the top of
/// every operation and threaded through the descent as proof of
/// acquisition; released early once a safe node guarantees the root cannot
/// change.
struct RootLatchGuard<'a> {
    latch: &'a RwLatch,
    exclusive: bool,
    held: bool,
}

impl<'a> RootLatchGuard<'a> {
    fn acquire(latch: &'a RwLatch, exclusive: bool) -> Self {
        latch.lock(exclusive);
        Self {
            latch,
            exclusive,
            held: true,
        }
    }

    fn release(&mut self) {
        if self.held {
            self.latch.unlock(self.exclusive);
            self.held = false;
        }
    }
}

impl Drop for RootLatchGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Per-operation state for a mutating descent: the root-latch token, the
/// retained chain of exclusively latched ancestors (release order =
/// acquisition order), and pages scheduled for deletion once all latches
/// are gone.
struct WriteContext<'a> {
    root: RootLatchGuard<'a>,
    path: Vec<WritePageGuard>,
    deleted: Vec<PageId>,
}

impl<'a> WriteContext<'a> {
    fn new(root: RootLatchGuard<'a>) -> Self {
        Self {
            root,
            path: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Drop every latch above the current node; safe once the current node
    /// cannot propagate a split or merge upward.
    fn release_ancestors(&mut self) {
        self.path.clear();
        self.root.release();
    }
}

/// Concurrent B+ tree index mapping fixed-width keys to tuple `Rid`s.
/// Unique keys, point lookup, insert, remove, and forward range iteration.
/// Concurrency follows latch crabbing: descent latches parent then child
/// and releases all ancestors as soon as the child is safe for the
/// operation in flight.
pub struct BPlusTree<K: IndexKey> {
    index_name: String,
    buffer_pool: Arc<BufferPoolManager>,
    root_page_id: AtomicU32,
    root_latch: RwLatch,
    leaf_max_size: usize,
    internal_max_size: usize,
    _phantom: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Open (or register) the named index, with node capacities derived
    /// from the key width.
    pub fn new(index_name: impl Into<String>, buffer_pool: Arc<BufferPoolManager>) -> Result<Self> {
        Self::with_max_sizes(
            index_name,
            buffer_pool,
            leaf_capacity::<K>(),
            internal_capacity::<K>(),
        )
    }

    /// Open the named index with explicit node capacities. Small capacities
    /// force splits and merges early, which the structural tests rely on.
    pub fn with_max_sizes(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        assert!(leaf_max_size >= 2);
        assert!(
            internal_max_size >= 3 && internal_max_size % 2 == 1,
            "internal capacity must be odd so both halves of a split meet the minimum"
        );
        let index_name = index_name.into();

        let root_page_id = {
            let mut guard = buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
            let mut header = HeaderPage::new(&mut guard);
            match header.get_record(&index_name) {
                Some(id) => id,
                None => {
                    header.insert_record(&index_name, INVALID_PAGE_ID);
                    INVALID_PAGE_ID
                }
            }
        };

        Ok(Self {
            index_name,
            buffer_pool,
            root_page_id: AtomicU32::new(root_page_id),
            root_latch: RwLatch::new(),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    /// True iff the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.root_page_id.load(Ordering::SeqCst) == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(Ordering::SeqCst)
    }

    /// Point lookup.
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>> {
        match self.find_leaf_read(Some(key))? {
            None => Ok(None),
            Some(guard) => match BTreeNode::<K>::decode(&guard)? {
                BTreeNode::Leaf(leaf) => Ok(leaf.lookup(key)),
                BTreeNode::Internal(_) => Err(BTreeError::InvalidPageFormat(guard.page_id())),
            },
        }
    }

    /// Insert a unique key. Returns false (leaving the tree untouched) if
    /// the key is already present.
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool> {
        let mut ctx = WriteContext::new(RootLatchGuard::acquire(&self.root_latch, true));
        let root_id = self.root_page_id.load(Ordering::SeqCst);
        if root_id == INVALID_PAGE_ID {
            self.start_new_tree(key, rid)?;
            return Ok(true);
        }

        let mut leaf = self.descend(&mut ctx, root_id, Some(&key), OpType::Insert)?;
        if leaf.lookup(&key).is_some() {
            return Ok(false);
        }
        leaf.insert(key, rid);

        if leaf.size() > leaf.max_size {
            self.split_leaf(&mut ctx, leaf)?;
        } else {
            let guard = ctx.path.last_mut().expect("descent left an empty path");
            BTreeNode::Leaf(leaf).encode(guard);
        }

        self.finish_write(ctx)?;
        Ok(true)
    }

    /// Remove a key; absent keys are a no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        let mut ctx = WriteContext::new(RootLatchGuard::acquire(&self.root_latch, true));
        let root_id = self.root_page_id.load(Ordering::SeqCst);
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut leaf = self.descend(&mut ctx, root_id, Some(key), OpType::Delete)?;
        if !leaf.remove(key) {
            return Ok(());
        }

        let leaf_guard = ctx.path.pop().expect("descent left an empty path");
        if leaf.parent_page_id == INVALID_PAGE_ID {
            self.adjust_root(&mut ctx, BTreeNode::Leaf(leaf), leaf_guard)?;
        } else if leaf.size() < leaf.min_size() {
            self.coalesce_or_redistribute(&mut ctx, BTreeNode::Leaf(leaf), leaf_guard)?;
        } else {
            let mut guard = leaf_guard;
            BTreeNode::Leaf(leaf).encode(&mut guard);
        }

        self.finish_write(ctx)?;
        Ok(())
    }

    /// Iterator over the whole tree in ascending key order.
    pub fn iter(&self) -> Result<TreeIterator<K>> {
        match self.find_leaf_read(None)? {
            None => Ok(TreeIterator::empty(self.buffer_pool.clone())),
            Some(guard) => TreeIterator::new(self.buffer_pool.clone(), guard, 0),
        }
    }

    /// Iterator positioned at the first key >= `key`.
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<K>> {
        match self.find_leaf_read(Some(key))? {
            None => Ok(TreeIterator::empty(self.buffer_pool.clone())),
            Some(guard) => {
                let index = match BTreeNode::<K>::decode(&guard)? {
                    BTreeNode::Leaf(leaf) => leaf.key_index(key),
                    BTreeNode::Internal(_) => {
                        return Err(BTreeError::InvalidPageFormat(guard.page_id()))
                    }
                };
                TreeIterator::new(self.buffer_pool.clone(), guard, index)
            }
        }
    }

    /// Descend to the leaf for `key` (leftmost leaf when `None`) taking
    /// shared latches, crabbing parent to child. Returns the latched leaf.
    fn find_leaf_read(&self, key: Option<&K>) -> Result<Option<ReadPageGuard>> {
        let mut root = RootLatchGuard::acquire(&self.root_latch, false);
        let root_id = self.root_page_id.load(Ordering::SeqCst);
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(root_id)?;
        loop {
            let child_id = match BTreeNode::<K>::decode(&guard)? {
                BTreeNode::Leaf(_) => return Ok(Some(guard)),
                BTreeNode::Internal(internal) => match key {
                    Some(k) => internal.lookup_child(k),
                    None => internal.children[0],
                },
            };
            let child = self.buffer_pool.fetch_page_read(child_id)?;
            // Child latched: the parent (and the root latch) can go.
            guard = child;
            root.release();
        }
    }

    /// Exclusive descent for a mutating operation. Ancestors (and the root
    /// latch) are released as soon as the child being entered is safe.
    fn descend(
        &self,
        ctx: &mut WriteContext<'_>,
        root_id: PageId,
        key: Option<&K>,
        op: OpType,
    ) -> Result<LeafNode<K>> {
        let guard = self.buffer_pool.fetch_page_write(root_id)?;
        let mut node = BTreeNode::<K>::decode(&guard)?;
        ctx.path.push(guard);
        loop {
            match node {
                BTreeNode::Leaf(leaf) => return Ok(leaf),
                BTreeNode::Internal(internal) => {
                    let child_id = match key {
                        Some(k) => internal.lookup_child(k),
                        None => internal.children[0],
                    };
                    let child_guard = self.buffer_pool.fetch_page_write(child_id)?;
                    let child_node = BTreeNode::<K>::decode(&child_guard)?;
                    if child_node.is_safe(op) {
                        ctx.release_ancestors();
                    }
                    ctx.path.push(child_guard);
                    node = child_node;
                }
            }
        }
    }

    /// First insert into an empty tree: a single leaf becomes the root.
    /// Caller holds the root latch exclusively.
    fn start_new_tree(&self, key: K, rid: Rid) -> Result<()> {
        let (mut guard, page_id) = self.buffer_pool.new_page_write()?;
        let mut leaf = LeafNode::new(self.leaf_max_size);
        leaf.insert(key, rid);
        BTreeNode::Leaf(leaf).encode(&mut guard);
        drop(guard);

        self.root_page_id.store(page_id, Ordering::SeqCst);
        self.update_root_record(page_id)?;
        debug!("started new tree for index {}", self.index_name);
        Ok(())
    }

    /// Split an overflowing leaf: the upper half moves to a fresh page that
    /// takes over the old sibling pointer, and the new first key is
    /// promoted into the parent.
    fn split_leaf(&self, ctx: &mut WriteContext<'_>, mut leaf: LeafNode<K>) -> Result<()> {
        let mut leaf_guard = ctx.path.pop().expect("split without a latched leaf");
        let (mut new_guard, new_page_id) = self.buffer_pool.new_page_write()?;

        let upper = leaf.split_off_upper_half();
        let new_leaf = LeafNode {
            parent_page_id: leaf.parent_page_id,
            next_page_id: leaf.next_page_id,
            max_size: leaf.max_size,
            entries: upper,
        };
        leaf.next_page_id = new_page_id;
        let separator = new_leaf.entries[0].0.clone();

        BTreeNode::Leaf(leaf).encode(&mut leaf_guard);
        BTreeNode::Leaf(new_leaf).encode(&mut new_guard);
        self.insert_into_parent(ctx, leaf_guard, separator, new_page_id, new_guard)
    }

    /// Propagate a split upward: link (separator, right) into the parent of
    /// the node under `left_guard`, splitting ancestors as needed. Grows a
    /// new root when the split reaches the top.
    fn insert_into_parent(
        &self,
        ctx: &mut WriteContext<'_>,
        left_guard: WritePageGuard,
        separator: K,
        right_page_id: PageId,
        right_guard: WritePageGuard,
    ) -> Result<()> {
        let mut left_guard = left_guard;
        let mut right_guard = right_guard;
        let mut separator = separator;
        let mut right_page_id = right_page_id;

        loop {
            let left_page_id = left_guard.page_id();

            if ctx.path.is_empty() {
                // The split node was the root; grow a new root above it.
                debug_assert!(ctx.root.held, "root split without the root latch");
                let (mut root_guard, new_root_id) = self.buffer_pool.new_page_write()?;
                let mut new_root = InternalNode::new(self.internal_max_size);
                new_root.populate_new_root(left_page_id, separator, right_page_id);
                BTreeNode::Internal(new_root).encode(&mut root_guard);

                Self::set_parent_in_guard(&mut left_guard, new_root_id);
                Self::set_parent_in_guard(&mut right_guard, new_root_id);
                drop(left_guard);
                drop(right_guard);
                drop(root_guard);

                self.root_page_id.store(new_root_id, Ordering::SeqCst);
                self.update_root_record(new_root_id)?;
                return Ok(());
            }

            let mut parent_guard = ctx.path.pop().expect("missing split ancestor");
            let parent_page_id = parent_guard.page_id();
            let mut parent = match BTreeNode::<K>::decode(&parent_guard)? {
                BTreeNode::Internal(n) => n,
                BTreeNode::Leaf(_) => {
                    return Err(BTreeError::InvalidPageFormat(parent_page_id))
                }
            };

            parent.insert_after(left_page_id, separator, right_page_id);
            Self::set_parent_in_guard(&mut right_guard, parent_page_id);
            drop(left_guard);
            drop(right_guard);

            if parent.size() <= parent.max_size {
                BTreeNode::Internal(parent).encode(&mut parent_guard);
                return Ok(());
            }

            // The parent overflowed in turn.
            let (promoted, right_keys, right_children) = parent.split_off_upper_half();
            let (mut new_guard, new_internal_id) = self.buffer_pool.new_page_write()?;
            let new_internal = InternalNode {
                parent_page_id: parent.parent_page_id,
                max_size: parent.max_size,
                keys: right_keys,
                children: right_children,
            };
            for &child in &new_internal.children {
                self.set_parent_pointer(child, new_internal_id)?;
            }
            BTreeNode::Internal(parent).encode(&mut parent_guard);
            BTreeNode::Internal(new_internal).encode(&mut new_guard);

            left_guard = parent_guard;
            separator = promoted;
            right_page_id = new_internal_id;
            right_guard = new_guard;
        }
    }

    /// Fix an underflowing non-root node by merging with or borrowing from
    /// a sibling. Defaults to the left sibling; the leftmost child borrows
    /// from its right sibling instead.
    fn coalesce_or_redistribute(
        &self,
        ctx: &mut WriteContext<'_>,
        node: BTreeNode<K>,
        node_guard: WritePageGuard,
    ) -> Result<()> {
        if node.parent_page_id() == INVALID_PAGE_ID {
            return self.adjust_root(ctx, node, node_guard);
        }

        let node_page_id = node_guard.page_id();
        let mut parent = {
            let parent_guard = ctx.path.last().expect("underflow node without its parent");
            debug_assert_eq!(parent_guard.page_id(), node.parent_page_id());
            match BTreeNode::<K>::decode(parent_guard)? {
                BTreeNode::Internal(n) => n,
                BTreeNode::Leaf(_) => {
                    return Err(BTreeError::InvalidPageFormat(parent_guard.page_id()))
                }
            }
        };

        let index = parent.child_index_of(node_page_id).ok_or_else(|| {
            BTreeError::IntegrityViolation(format!(
                "page {} missing from its parent {}",
                node_page_id,
                node.parent_page_id()
            ))
        })?;
        let (sibling_index, sibling_is_right) = if index == 0 { (1, true) } else { (index - 1, false) };
        let sibling_page_id = parent.children[sibling_index];
        let sibling_guard = self.buffer_pool.fetch_page_write(sibling_page_id)?;
        let sibling = BTreeNode::<K>::decode(&sibling_guard)?;

        if node.size() + sibling.size() <= node.max_size() {
            // Coalesce: move the right node of the pair into the left one.
            let (left, mut left_guard, right, right_guard, remove_index) = if sibling_is_right {
                (node, node_guard, sibling, sibling_guard, sibling_index)
            } else {
                (sibling, sibling_guard, node, node_guard, index)
            };
            let left_page_id = left_guard.page_id();
            let right_page_id = right_guard.page_id();

            let merged = match (left, right) {
                (BTreeNode::Leaf(mut l), BTreeNode::Leaf(r)) => {
                    l.entries.extend(r.entries);
                    l.next_page_id = r.next_page_id;
                    BTreeNode::Leaf(l)
                }
                (BTreeNode::Internal(mut l), BTreeNode::Internal(r)) => {
                    // The separator comes down to bridge the two halves.
                    l.keys.push(parent.key_at(remove_index).clone());
                    l.keys.extend(r.keys);
                    for &child in &r.children {
                        self.set_parent_pointer(child, left_page_id)?;
                    }
                    l.children.extend(r.children);
                    BTreeNode::Internal(l)
                }
                _ => {
                    return Err(BTreeError::IntegrityViolation(
                        "siblings of different kinds".to_string(),
                    ))
                }
            };
            parent.remove_at(remove_index);
            merged.encode(&mut left_guard);
            drop(left_guard);
            drop(right_guard);
            ctx.deleted.push(right_page_id);

            let parent_node = BTreeNode::Internal(parent);
            {
                let parent_guard = ctx.path.last_mut().expect("parent guard vanished");
                parent_node.encode(parent_guard);
            }
            // Internal nodes merge at <= min_size: their slot-0 key is
            // unused, so equality already means one separator short.
            if parent_node.size() <= parent_node.min_size() {
                let parent_guard = ctx.path.pop().expect("parent guard vanished");
                self.coalesce_or_redistribute(ctx, parent_node, parent_guard)?;
            }
            Ok(())
        } else if node.size() < node.min_size() {
            // Redistribute: borrow one entry from the sibling and refresh
            // the separator between the two.
            let mut node = node;
            let mut node_guard = node_guard;
            let mut sibling = sibling;
            let mut sibling_guard = sibling_guard;
            self.redistribute(
                &mut parent,
                &mut node,
                node_page_id,
                &mut sibling,
                index,
                sibling_is_right,
            )?;
            node.encode(&mut node_guard);
            sibling.encode(&mut sibling_guard);
            let parent_guard = ctx.path.last_mut().expect("parent guard vanished");
            BTreeNode::Internal(parent).encode(parent_guard);
            Ok(())
        } else {
            // An internal node arriving at exactly min_size with no merge
            // that fits: it still meets its occupancy bound, and borrowing
            // would only push the sibling under its own. Leave it be.
            Ok(())
        }
    }

    fn redistribute(
        &self,
        parent: &mut InternalNode<K>,
        node: &mut BTreeNode<K>,
        node_page_id: PageId,
        sibling: &mut BTreeNode<K>,
        index: usize,
        sibling_is_right: bool,
    ) -> Result<()> {
        match (node, sibling) {
            (BTreeNode::Leaf(node), BTreeNode::Leaf(sibling)) => {
                if sibling_is_right {
                    // Move the right sibling's first entry to our end.
                    let entry = sibling.entries.remove(0);
                    node.entries.push(entry);
                    parent.set_key_at(1, sibling.entries[0].0.clone());
                } else {
                    // Move the left sibling's last entry to our front.
                    let entry = sibling.entries.pop().expect("empty sibling");
                    node.entries.insert(0, entry);
                    parent.set_key_at(index, node.entries[0].0.clone());
                }
            }
            (BTreeNode::Internal(node), BTreeNode::Internal(sibling)) => {
                if sibling_is_right {
                    // Rotate left through the separator.
                    let moved_child = sibling.children.remove(0);
                    node.keys.push(parent.key_at(1).clone());
                    node.children.push(moved_child);
                    parent.set_key_at(1, sibling.keys.remove(0));
                    self.set_parent_pointer(moved_child, node_page_id)?;
                } else {
                    // Rotate right through the separator.
                    let moved_child = sibling.children.pop().expect("empty sibling");
                    node.keys.insert(0, parent.key_at(index).clone());
                    node.children.insert(0, moved_child);
                    parent.set_key_at(index, sibling.keys.pop().expect("empty sibling"));
                    self.set_parent_pointer(moved_child, node_page_id)?;
                }
            }
            _ => {
                return Err(BTreeError::IntegrityViolation(
                    "siblings of different kinds".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Shrink or clear the root. A leaf root that empties ends the tree; an
    /// internal root left with a single child hands the root role to it.
    fn adjust_root(
        &self,
        ctx: &mut WriteContext<'_>,
        node: BTreeNode<K>,
        guard: WritePageGuard,
    ) -> Result<()> {
        match node {
            BTreeNode::Leaf(leaf) if leaf.size() == 0 => {
                let old_root = guard.page_id();
                drop(guard);
                ctx.deleted.push(old_root);
                self.root_page_id.store(INVALID_PAGE_ID, Ordering::SeqCst);
                self.update_root_record(INVALID_PAGE_ID)?;
                debug!("index {} is now empty", self.index_name);
            }
            BTreeNode::Internal(mut internal) if internal.size() == 1 => {
                let old_root = guard.page_id();
                let new_root_id = internal.remove_and_return_only_child();
                drop(guard);
                ctx.deleted.push(old_root);
                self.set_parent_pointer(new_root_id, INVALID_PAGE_ID)?;
                self.root_page_id.store(new_root_id, Ordering::SeqCst);
                self.update_root_record(new_root_id)?;
            }
            other => {
                let mut guard = guard;
                other.encode(&mut guard);
            }
        }
        Ok(())
    }

    /// Release every latch, then drop pages queued for deletion. A page
    /// still pinned elsewhere (a paused iterator) is simply left behind.
    fn finish_write(&self, mut ctx: WriteContext<'_>) -> Result<()> {
        let deleted = std::mem::take(&mut ctx.deleted);
        drop(ctx);
        for page_id in deleted {
            if !self.buffer_pool.delete_page(page_id)? {
                debug!("deferred deletion of pinned page {}", page_id);
            }
        }
        Ok(())
    }

    /// Rewrite a child's parent pointer in place. The caller holds the
    /// exclusive latch on the (old or new) parent, so no structural
    /// operation can race this field.
    fn set_parent_pointer(&self, page_id: PageId, parent_id: PageId) -> Result<()> {
        let frame = self.buffer_pool.fetch_page(page_id)?;
        frame.latch().write_lock();
        unsafe {
            let page = frame.page_mut();
            LittleEndian::write_u32(&mut page.data[PARENT_POINTER_OFFSET..], parent_id);
        }
        frame.latch().write_unlock();
        self.buffer_pool.unpin_page(page_id, true)?;
        Ok(())
    }

    fn set_parent_in_guard(guard: &mut WritePageGuard, parent_id: PageId) {
        LittleEndian::write_u32(&mut guard.data[PARENT_POINTER_OFFSET..], parent_id);
    }

    /// Record the root page id in the header page. Called whenever the
    /// root changes.
    fn update_root_record(&self, root_page_id: PageId) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page_write(HEADER_PAGE_ID)?;
        let mut header = HeaderPage::new(&mut guard);
        if !header.update_record(&self.index_name, root_page_id) {
            header.insert_record(&self.index_name, root_page_id);
        }
        Ok(())
    }

    /// Walk the whole tree checking the structural invariants: key order,
    /// size bounds, uniform leaf depth, parent pointers, separator bounds,
    /// and the leaf chain. For tests; takes the root latch shared.
    pub fn verify_integrity(&self) -> Result<()> {
        let _root = RootLatchGuard::acquire(&self.root_latch, false);
        let root_id = self.root_page_id.load(Ordering::SeqCst);
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }
        let (_, key_count) = self.check_subtree(root_id, INVALID_PAGE_ID, None, None)?;

        // The leaf chain must enumerate every key in ascending order and
        // terminate.
        let mut page_id = self.leftmost_leaf(root_id)?;
        let mut chained = 0usize;
        let mut last: Option<K> = None;
        while page_id != INVALID_PAGE_ID {
            let guard = self.buffer_pool.fetch_page_read(page_id)?;
            let leaf = match BTreeNode::<K>::decode(&guard)? {
                BTreeNode::Leaf(leaf) => leaf,
                BTreeNode::Internal(_) => {
                    return Err(BTreeError::IntegrityViolation(format!(
                        "leaf chain reached internal page {}",
                        page_id
                    )))
                }
            };
            for (key, _) in &leaf.entries {
                if let Some(prev) = &last {
                    if prev >= key {
                        return Err(BTreeError::IntegrityViolation(
                            "leaf chain keys not strictly ascending".to_string(),
                        ));
                    }
                }
                last = Some(key.clone());
                chained += 1;
            }
            page_id = leaf.next_page_id;
        }
        if chained != key_count {
            return Err(BTreeError::IntegrityViolation(format!(
                "leaf chain saw {} keys, subtree walk saw {}",
                chained, key_count
            )));
        }
        Ok(())
    }

    fn leftmost_leaf(&self, root_id: PageId) -> Result<PageId> {
        let mut page_id = root_id;
        loop {
            let guard = self.buffer_pool.fetch_page_read(page_id)?;
            match BTreeNode::<K>::decode(&guard)? {
                BTreeNode::Leaf(_) => return Ok(page_id),
                BTreeNode::Internal(internal) => page_id = internal.children[0],
            }
        }
    }

    /// Returns (leaf depth, key count) for the subtree, checking bounds:
    /// every key k in the subtree satisfies `lower <= k < upper`.
    #[allow(clippy::only_used_in_recursion)]
    fn check_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<&K>,
        upper: Option<&K>,
    ) -> Result<(usize, usize)> {
        let guard = self.buffer_pool.fetch_page_read(page_id)?;
        let node = BTreeNode::<K>::decode(&guard)?;

        if node.parent_page_id() != expected_parent {
            return Err(BTreeError::IntegrityViolation(format!(
                "page {} has parent {}, expected {}",
                page_id,
                node.parent_page_id(),
                expected_parent
            )));
        }
        let is_root = expected_parent == INVALID_PAGE_ID;
        if !is_root && (node.size() < node.min_size() || node.size() > node.max_size()) {
            return Err(BTreeError::IntegrityViolation(format!(
                "page {} size {} outside [{}, {}]",
                page_id,
                node.size(),
                node.min_size(),
                node.max_size()
            )));
        }

        match node {
            BTreeNode::Leaf(leaf) => {
                for window in leaf.entries.windows(2) {
                    if window[0].0 >= window[1].0 {
                        return Err(BTreeError::IntegrityViolation(format!(
                            "leaf {} keys not strictly ascending",
                            page_id
                        )));
                    }
                }
                if let (Some(low), Some((first, _))) = (lower, leaf.entries.first()) {
                    if first < low {
                        return Err(BTreeError::IntegrityViolation(format!(
                            "leaf {} violates its lower bound",
                            page_id
                        )));
                    }
                }
                if let (Some(high), Some((last, _))) = (upper, leaf.entries.last()) {
                    if last >= high {
                        return Err(BTreeError::IntegrityViolation(format!(
                            "leaf {} violates its upper bound",
                            page_id
                        )));
                    }
                }
                Ok((1, leaf.entries.len()))
            }
            BTreeNode::Internal(internal) => {
                if internal.size() < 2 {
                    return Err(BTreeError::IntegrityViolation(format!(
                        "internal page {} has fewer than two children",
                        page_id
                    )));
                }
                for window in internal.keys.windows(2) {
                    if window[0] >= window[1] {
                        return Err(BTreeError::IntegrityViolation(format!(
                            "internal {} keys not strictly ascending",
                            page_id
                        )));
                    }
                }
                drop(guard);
                let mut depth = None;
                let mut key_count = 0;
                for (i, &child) in internal.children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(&internal.keys[i - 1]) };
                    let child_upper = if i == internal.children.len() - 1 {
                        upper
                    } else {
                        Some(&internal.keys[i])
                    };
                    let (child_depth, child_keys) =
                        self.check_subtree(child, page_id, child_lower, child_upper)?;
                    key_count += child_keys;
                    match depth {
                        None => depth = Some(child_depth),
                        Some(d) if d != child_depth => {
                            return Err(BTreeError::IntegrityViolation(format!(
                                "children of page {} at unequal depths",
                                page_id
                            )))
                        }
                        _ => {}
                    }
                }
                Ok((depth.unwrap_or(0) + 1, key_count))
            }
        }
    }
}
