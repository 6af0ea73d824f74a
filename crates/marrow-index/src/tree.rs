//! Latch-crabbing B+ tree over buffer-pool pages.
//!
//! Reads crab downward with shared latches. Mutations first try an
//! optimistic pass: shared latches to the leaf's parent, then an
//! exclusive latch on the leaf alone — sound because any structural
//! change to the leaf needs its parent's exclusive latch, which the
//! held shared latch excludes. If the mutation could split or
//! underflow the leaf, everything is released and the operation
//! restarts pessimistically: exclusive latches from the root, an
//! ancestor released as soon as its child cannot propagate a
//! split/merge upward. A coarse mutex serialises only the
//! empty-tree -> first-root transition.

use crate::iterator::TreeIter;
use crate::key::GenericKey;
use crate::node::{internal_max_size, leaf_max_size, InternalNode, LeafNode, Node};
use log::debug;
use marrow_buffer::{BufferPoolManager, Page, PageReadGuard, PageWriteGuard};
use marrow_common::{MarrowError, PageId, Result, Rid};
use marrow_table::HeaderPage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// One latched page on a pessimistic descent path.
struct PathEntry {
    page: Arc<Page>,
    guard: Option<PageWriteGuard>,
    dirty: bool,
}

/// The ordered set of exclusively latched pages held by one mutation,
/// root side first. Pages are unlatched and unpinned in acquisition
/// order on every exit path; pages marked deleted are additionally
/// freed afterwards.
struct WritePath<'a> {
    pool: &'a Arc<BufferPoolManager>,
    entries: Vec<PathEntry>,
    deleted: Vec<PageId>,
}

impl<'a> WritePath<'a> {
    fn new(pool: &'a Arc<BufferPoolManager>) -> Self {
        Self {
            pool,
            entries: Vec::new(),
            deleted: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, page: Arc<Page>, guard: PageWriteGuard) {
        self.entries.push(PathEntry {
            page,
            guard: Some(guard),
            dirty: false,
        });
    }

    fn page_id_at(&self, idx: usize) -> PageId {
        self.entries[idx].page.page_id()
    }

    /// Deserializes the node at a path position.
    fn node<const N: usize>(&self, idx: usize) -> Node<N> {
        let guard = self.entries[idx].guard.as_ref().expect("latch released");
        Node::read_from(&guard[..])
    }

    /// Writes a node back at a path position and marks it dirty.
    fn write<const N: usize>(&mut self, idx: usize, node: &Node<N>) {
        let entry = &mut self.entries[idx];
        let guard = entry.guard.as_mut().expect("latch released");
        node.write_to(&mut guard[..]);
        entry.dirty = true;
    }

    /// Releases every currently held page (ancestors of a safe child).
    fn release_all(&mut self) {
        for mut entry in self.entries.drain(..) {
            let page_id = entry.page.page_id();
            entry.guard.take();
            self.pool.unpin_page(page_id, entry.dirty);
        }
    }

    fn mark_deleted(&mut self, page_id: PageId) {
        self.deleted.push(page_id);
    }

    fn finish(self) {}
}

impl Drop for WritePath<'_> {
    fn drop(&mut self) {
        self.release_all();
        for page_id in std::mem::take(&mut self.deleted) {
            let _ = self.pool.delete_page(page_id);
        }
    }
}

/// Which leaf a shared descent should land on.
enum Target<'k, const N: usize> {
    Key(&'k GenericKey<N>),
    Leftmost,
}

/// A persistent B+ tree index mapping fixed-width keys to RIDs.
///
/// Unique keys only. The root page id is mirrored in the header page
/// record registered under the index name.
pub struct BPlusTree<const N: usize> {
    name: String,
    pool: Arc<BufferPoolManager>,
    root_page_id: AtomicI32,
    leaf_max_size: usize,
    internal_max_size: usize,
    /// Serialises only the empty-tree -> first-root transition.
    init_latch: Mutex<()>,
}

impl<const N: usize> BPlusTree<N> {
    /// Opens (or registers) the index named `name` in the header page.
    pub fn new(name: impl Into<String>, pool: Arc<BufferPoolManager>) -> Result<Self> {
        Self::with_max_sizes(name, pool, leaf_max_size(N), internal_max_size(N))
    }

    /// Like `new` with explicit node capacities (small trees in tests).
    pub fn with_max_sizes(
        name: impl Into<String>,
        pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        assert!(leaf_max_size >= 2 && leaf_max_size % 2 == 0);
        assert!(internal_max_size >= 4 && internal_max_size % 2 == 0);
        let name = name.into();

        let page = pool.fetch_page(PageId::HEADER)?;
        let root = {
            let mut guard = page.write_latch();
            let mut header = HeaderPage::new(&mut guard[..]);
            match header.get_root(&name) {
                Some(root) => root,
                None => {
                    if !header.insert_record(&name, PageId::INVALID) {
                        drop(guard);
                        pool.unpin_page(PageId::HEADER, false);
                        return Err(MarrowError::Internal(format!(
                            "cannot register index {:?}",
                            name
                        )));
                    }
                    PageId::INVALID
                }
            }
        };
        pool.unpin_page(PageId::HEADER, true);

        Ok(Self {
            name,
            pool,
            root_page_id: AtomicI32::new(root.0),
            leaf_max_size,
            internal_max_size,
            init_latch: Mutex::new(()),
        })
    }

    /// Index name as registered in the header page.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> PageId {
        PageId(self.root_page_id.load(Ordering::SeqCst))
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        !self.root().is_valid()
    }

    /// Updates the root, both in memory and in the header page
    /// record. The header page is written through eagerly; root
    /// transitions are not carried in the log.
    fn set_root(&self, page_id: PageId) -> Result<()> {
        self.root_page_id.store(page_id.0, Ordering::SeqCst);
        let page = self.pool.fetch_page(PageId::HEADER)?;
        {
            let mut guard = page.write_latch();
            HeaderPage::new(&mut guard[..]).update_record(&self.name, page_id);
        }
        self.pool.unpin_page(PageId::HEADER, true);
        self.pool.flush_page(PageId::HEADER)?;
        debug!("index {} root -> {}", self.name, page_id);
        Ok(())
    }

    /// Shared-latch crab descent to a leaf. None when the tree is
    /// empty.
    fn find_leaf_shared(
        &self,
        target: Target<'_, N>,
    ) -> Result<Option<(Arc<Page>, PageReadGuard)>> {
        'retry: loop {
            let root_id = self.root();
            if !root_id.is_valid() {
                return Ok(None);
            }
            let mut page = self.pool.fetch_page(root_id)?;
            let mut guard = page.read_latch();
            if self.root() != root_id {
                drop(guard);
                self.pool.unpin_page(root_id, false);
                continue 'retry;
            }

            loop {
                let node = Node::<N>::read_from(&guard[..]);
                let internal = match node {
                    Node::Leaf(_) => return Ok(Some((page, guard))),
                    Node::Internal(internal) => internal,
                };
                let child_id = match &target {
                    Target::Key(key) => internal.lookup(key),
                    Target::Leftmost => internal.child_at(0),
                };
                let child = match self.pool.fetch_page(child_id) {
                    Ok(child) => child,
                    Err(e) => {
                        drop(guard);
                        self.pool.unpin_page(page.page_id(), false);
                        return Err(e);
                    }
                };
                // Crab: latch the child before releasing the parent.
                let child_guard = child.read_latch();
                let parent_id = page.page_id();
                drop(guard);
                self.pool.unpin_page(parent_id, false);
                page = child;
                guard = child_guard;
            }
        }
    }

    /// Optimistic leaf acquisition for a mutation: shared latches to
    /// the leaf's parent, exclusive latch on the leaf. The parent's
    /// shared latch is held across the leaf latch acquisition, so the
    /// leaf cannot be split or merged underneath us.
    fn find_leaf_exclusive(&self, key: &GenericKey<N>) -> Result<Option<(Arc<Page>, PageWriteGuard)>> {
        'retry: loop {
            let root_id = self.root();
            if !root_id.is_valid() {
                return Ok(None);
            }
            let page = self.pool.fetch_page(root_id)?;
            let guard = page.read_latch();
            if self.root() != root_id {
                drop(guard);
                self.pool.unpin_page(root_id, false);
                continue 'retry;
            }

            if Node::<N>::read_from(&guard[..]).is_leaf() {
                // Root leaf has no parent to pin its identity; verify
                // after the relatch.
                drop(guard);
                let write_guard = page.write_latch();
                if self.root() != root_id || !Node::<N>::read_from(&write_guard[..]).is_leaf() {
                    drop(write_guard);
                    self.pool.unpin_page(root_id, false);
                    continue 'retry;
                }
                return Ok(Some((page, write_guard)));
            }

            let mut page = page;
            let mut guard = guard;
            loop {
                let Node::Internal(internal) = Node::<N>::read_from(&guard[..]) else {
                    unreachable!("descent only re-enters on internal nodes");
                };
                let child_id = internal.lookup(key);
                let child = match self.pool.fetch_page(child_id) {
                    Ok(child) => child,
                    Err(e) => {
                        drop(guard);
                        self.pool.unpin_page(page.page_id(), false);
                        return Err(e);
                    }
                };
                let child_guard = child.read_latch();
                if Node::<N>::read_from(&child_guard[..]).is_leaf() {
                    // Keep the parent's shared latch while taking the
                    // leaf exclusively.
                    drop(child_guard);
                    let write_guard = child.write_latch();
                    let parent_id = page.page_id();
                    drop(guard);
                    self.pool.unpin_page(parent_id, false);
                    return Ok(Some((child, write_guard)));
                }
                let parent_id = page.page_id();
                drop(guard);
                self.pool.unpin_page(parent_id, false);
                page = child;
                guard = child_guard;
            }
        }
    }

    /// Exclusive-latch descent retaining every ancestor that a
    /// split (`for_insert`) or merge could propagate into.
    fn descend_exclusive(
        &self,
        key: &GenericKey<N>,
        for_insert: bool,
    ) -> Result<Option<WritePath<'_>>> {
        'retry: loop {
            let root_id = self.root();
            if !root_id.is_valid() {
                return Ok(None);
            }
            let root_page = self.pool.fetch_page(root_id)?;
            let root_guard = root_page.write_latch();
            if self.root() != root_id {
                drop(root_guard);
                self.pool.unpin_page(root_id, false);
                continue 'retry;
            }

            let mut path = WritePath::new(&self.pool);
            path.push(root_page, root_guard);

            loop {
                let node: Node<N> = path.node(path.len() - 1);
                let Node::Internal(internal) = node else {
                    return Ok(Some(path));
                };
                let child_id = internal.lookup(key);
                let child = self.pool.fetch_page(child_id)?;
                let child_guard = child.write_latch();
                let child_node = Node::<N>::read_from(&child_guard[..]);
                let safe = if for_insert {
                    child_node.safe_for_insert()
                } else {
                    child_node.safe_for_delete(false)
                };
                if safe {
                    path.release_all();
                }
                let is_leaf = child_node.is_leaf();
                path.push(child, child_guard);
                if is_leaf {
                    return Ok(Some(path));
                }
            }
        }
    }

    /// Point lookup.
    pub fn get(&self, key: &GenericKey<N>) -> Result<Option<Rid>> {
        let Some((page, guard)) = self.find_leaf_shared(Target::Key(key))? else {
            return Ok(None);
        };
        let Node::Leaf(leaf) = Node::<N>::read_from(&guard[..]) else {
            unreachable!("shared descent ends at a leaf");
        };
        let result = leaf.lookup(key);
        let page_id = page.page_id();
        drop(guard);
        self.pool.unpin_page(page_id, false);
        Ok(result)
    }

    /// Inserts a key-value pair. Returns false on a duplicate key.
    pub fn insert(&self, key: GenericKey<N>, rid: Rid) -> Result<bool> {
        loop {
            if self.is_empty() {
                let _init = self.init_latch.lock();
                if self.is_empty() {
                    self.start_new_tree(key, rid)?;
                    return Ok(true);
                }
            }

            let Some((page, mut guard)) = self.find_leaf_exclusive(&key)? else {
                continue;
            };
            let Node::Leaf(mut leaf) = Node::<N>::read_from(&guard[..]) else {
                unreachable!("exclusive leaf acquisition ends at a leaf");
            };
            if leaf.lookup(&key).is_some() {
                let page_id = page.page_id();
                drop(guard);
                self.pool.unpin_page(page_id, false);
                return Ok(false);
            }
            if leaf.size() + 1 < leaf.max_size {
                leaf.insert(key, rid);
                leaf.write_to(&mut guard[..]);
                let page_id = page.page_id();
                drop(guard);
                self.pool.unpin_page(page_id, true);
                return Ok(true);
            }
            // Insert would fill the leaf to its split point; restart
            // with the full write path held.
            let page_id = page.page_id();
            drop(guard);
            self.pool.unpin_page(page_id, false);
            return self.insert_pessimistic(key, rid);
        }
    }

    fn start_new_tree(&self, key: GenericKey<N>, rid: Rid) -> Result<()> {
        let page = self.pool.new_page()?;
        let page_id = page.page_id();
        let mut leaf = LeafNode::new(page_id, PageId::INVALID, self.leaf_max_size);
        leaf.insert(key, rid);
        {
            let mut guard = page.write_latch();
            leaf.write_to(&mut guard[..]);
        }
        self.pool.unpin_page(page_id, true);
        self.set_root(page_id)
    }

    fn insert_pessimistic(&self, key: GenericKey<N>, rid: Rid) -> Result<bool> {
        let Some(mut path) = self.descend_exclusive(&key, true)? else {
            // The tree emptied out underneath us; take it from the top.
            return self.insert(key, rid);
        };
        let leaf_idx = path.len() - 1;
        let Node::Leaf(mut leaf) = path.node(leaf_idx) else {
            unreachable!("exclusive descent ends at a leaf");
        };
        if leaf.lookup(&key).is_some() {
            path.finish();
            return Ok(false);
        }
        leaf.insert(key, rid);
        if leaf.size() < leaf.max_size {
            path.write(leaf_idx, &Node::Leaf(leaf));
            path.finish();
            return Ok(true);
        }

        // Split: upper half moves to a fresh leaf spliced into the
        // chain, and its first key goes up to the parent.
        let new_page = self.pool.new_page()?;
        let new_page_id = new_page.page_id();
        let mut sibling = LeafNode::new(new_page_id, leaf.parent_page_id, self.leaf_max_size);
        sibling.entries = leaf.split_upper_half();
        sibling.next_page_id = leaf.next_page_id;
        leaf.next_page_id = new_page_id;
        let separator = sibling.entries[0].0;
        {
            let mut guard = new_page.write_latch();
            sibling.write_to(&mut guard[..]);
        }
        self.pool.unpin_page(new_page_id, true);
        path.write(leaf_idx, &Node::Leaf(leaf));

        self.insert_into_parent(&mut path, leaf_idx, separator, new_page_id)?;
        path.finish();
        Ok(true)
    }

    /// Records a split: `(separator, new_child)` enters the parent of
    /// the node at `child_idx`, splitting upward as needed.
    fn insert_into_parent(
        &self,
        path: &mut WritePath<'_>,
        child_idx: usize,
        separator: GenericKey<N>,
        new_child: PageId,
    ) -> Result<()> {
        if child_idx == 0 {
            // The root split: grow the tree by one level.
            let old_root_id = path.page_id_at(0);
            let root_page = self.pool.new_page()?;
            let root_id = root_page.page_id();
            let mut root = InternalNode::new(root_id, PageId::INVALID, self.internal_max_size);
            root.populate_new_root(old_root_id, separator, new_child);
            {
                let mut guard = root_page.write_latch();
                root.write_to(&mut guard[..]);
            }
            self.pool.unpin_page(root_id, true);

            let mut old_root: Node<N> = path.node(0);
            old_root.set_parent_page_id(root_id);
            path.write(0, &old_root);
            self.set_parent(new_child, root_id)?;
            self.set_root(root_id)?;
            return Ok(());
        }

        let parent_idx = child_idx - 1;
        let Node::Internal(mut parent) = path.node(parent_idx) else {
            return Err(MarrowError::Corruption(format!(
                "leaf {} above the bottom level of index {}",
                path.page_id_at(parent_idx),
                self.name
            )));
        };
        let child_id = path.page_id_at(child_idx);
        parent.insert_after(child_id, separator, new_child);
        self.set_parent(new_child, parent.page_id)?;

        if parent.size() < parent.max_size {
            path.write(parent_idx, &Node::Internal(parent));
            return Ok(());
        }

        // Parent overflow: split it too, pushing the mid key up.
        let new_page = self.pool.new_page()?;
        let new_page_id = new_page.page_id();
        let (push_up, upper) = parent.split_upper_half();
        let mut sibling = InternalNode::new(new_page_id, parent.parent_page_id, self.internal_max_size);
        sibling.entries = upper;
        {
            let mut guard = new_page.write_latch();
            sibling.write_to(&mut guard[..]);
        }
        self.pool.unpin_page(new_page_id, true);
        path.write(parent_idx, &Node::Internal(parent));

        // Moved children now hang under the sibling.
        for i in 0..sibling.entries.len() {
            let moved = sibling.entries[i].1;
            self.reparent(path, child_idx, moved, new_page_id)?;
        }

        self.insert_into_parent(path, parent_idx, push_up, new_page_id)
    }

    /// Points `child` at `new_parent`, going through the write path
    /// when the child is latched there.
    fn reparent(
        &self,
        path: &mut WritePath<'_>,
        path_idx: usize,
        child: PageId,
        new_parent: PageId,
    ) -> Result<()> {
        if path_idx < path.len() && path.page_id_at(path_idx) == child {
            let mut node: Node<N> = path.node(path_idx);
            node.set_parent_page_id(new_parent);
            path.write(path_idx, &node);
            return Ok(());
        }
        self.set_parent(child, new_parent)
    }

    fn set_parent(&self, page_id: PageId, parent: PageId) -> Result<()> {
        let page = self.pool.fetch_page(page_id)?;
        {
            let mut guard = page.write_latch();
            let mut node = Node::<N>::read_from(&guard[..]);
            node.set_parent_page_id(parent);
            node.write_to(&mut guard[..]);
        }
        self.pool.unpin_page(page_id, true);
        Ok(())
    }

    /// Removes a key; absent keys are a no-op.
    pub fn remove(&self, key: &GenericKey<N>) -> Result<()> {
        let Some((page, mut guard)) = self.find_leaf_exclusive(key)? else {
            return Ok(());
        };
        let Node::Leaf(mut leaf) = Node::<N>::read_from(&guard[..]) else {
            unreachable!("exclusive leaf acquisition ends at a leaf");
        };
        if leaf.lookup(key).is_none() {
            let page_id = page.page_id();
            drop(guard);
            self.pool.unpin_page(page_id, false);
            return Ok(());
        }

        let is_root = page.page_id() == self.root();
        let safe = if is_root {
            leaf.size() > 1
        } else {
            leaf.size() > leaf.min_size()
        };
        if safe {
            leaf.remove(key);
            leaf.write_to(&mut guard[..]);
            let page_id = page.page_id();
            drop(guard);
            self.pool.unpin_page(page_id, true);
            return Ok(());
        }

        let page_id = page.page_id();
        drop(guard);
        self.pool.unpin_page(page_id, false);
        self.remove_pessimistic(key)
    }

    fn remove_pessimistic(&self, key: &GenericKey<N>) -> Result<()> {
        let Some(mut path) = self.descend_exclusive(key, false)? else {
            return Ok(());
        };
        let leaf_idx = path.len() - 1;
        let Node::Leaf(mut leaf) = path.node(leaf_idx) else {
            unreachable!("exclusive descent ends at a leaf");
        };
        if !leaf.remove(key) {
            path.finish();
            return Ok(());
        }
        let underflow = leaf.size() < leaf.min_size();
        path.write(leaf_idx, &Node::Leaf(leaf));

        if leaf_idx == 0 && path.page_id_at(0) == self.root() {
            self.adjust_root(&mut path)?;
        } else if underflow {
            self.rebalance(&mut path, leaf_idx)?;
        }
        path.finish();
        Ok(())
    }

    /// Fixes the underflowing non-root node at `idx`: redistribution
    /// from the left then right sibling, else a merge, recursing into
    /// the parent when the separator removal underflows it.
    fn rebalance(&self, path: &mut WritePath<'_>, idx: usize) -> Result<()> {
        debug_assert!(idx > 0);
        let parent_idx = idx - 1;
        let node: Node<N> = path.node(idx);
        let Node::Internal(mut parent) = path.node(parent_idx) else {
            return Err(MarrowError::Corruption(format!(
                "non-internal parent in index {}",
                self.name
            )));
        };
        let node_pos = parent.value_index(node.page_id()).ok_or_else(|| {
            MarrowError::Corruption(format!(
                "{} missing from its parent in index {}",
                node.page_id(),
                self.name
            ))
        })?;

        // 1. Borrow from the left sibling.
        if node_pos > 0 {
            let left_id = parent.child_at(node_pos - 1);
            let left_page = self.pool.fetch_page(left_id)?;
            let mut left_guard = left_page.write_latch();
            let left = Node::<N>::read_from(&left_guard[..]);
            if left.safe_for_delete(false) {
                self.rotate_from_left(path, idx, &mut parent, node_pos, &mut left_guard)?;
                path.write(parent_idx, &Node::Internal(parent));
                drop(left_guard);
                self.pool.unpin_page(left_id, true);
                return Ok(());
            }
            drop(left_guard);
            self.pool.unpin_page(left_id, false);
        }

        // 2. Borrow from the right sibling.
        if node_pos + 1 < parent.size() {
            let right_id = parent.child_at(node_pos + 1);
            let right_page = self.pool.fetch_page(right_id)?;
            let mut right_guard = right_page.write_latch();
            let right = Node::<N>::read_from(&right_guard[..]);
            if right.safe_for_delete(false) {
                self.rotate_from_right(path, idx, &mut parent, node_pos, &mut right_guard)?;
                path.write(parent_idx, &Node::Internal(parent));
                drop(right_guard);
                self.pool.unpin_page(right_id, true);
                return Ok(());
            }
            drop(right_guard);
            self.pool.unpin_page(right_id, false);
        }

        // 3./4. Merge with a sibling; the separator leaves the parent.
        let merged = self.merge_with_sibling(path, idx, &mut parent, node_pos)?;
        debug_assert!(merged);
        path.write(parent_idx, &Node::Internal(parent.clone()));

        if parent_idx == 0 && path.page_id_at(0) == self.root() {
            self.adjust_root(path)?;
        } else if parent.size() < parent.min_size() {
            self.rebalance(path, parent_idx)?;
        }
        Ok(())
    }

    /// Moves the left sibling's last entry to the front of the node
    /// at `idx`, refreshing the parent separator.
    fn rotate_from_left(
        &self,
        path: &mut WritePath<'_>,
        idx: usize,
        parent: &mut InternalNode<N>,
        node_pos: usize,
        left_guard: &mut PageWriteGuard,
    ) -> Result<()> {
        match (Node::<N>::read_from(&left_guard[..]), path.node(idx)) {
            (Node::Leaf(mut left), Node::Leaf(mut node)) => {
                let entry = left.entries.pop().expect("left sibling above minimum");
                node.entries.insert(0, entry);
                parent.set_key_at(node_pos, node.entries[0].0);
                left.write_to(&mut left_guard[..]);
                path.write(idx, &Node::Leaf(node));
            }
            (Node::Internal(mut left), Node::Internal(mut node)) => {
                let (moved_key, moved_child) =
                    left.entries.pop().expect("left sibling above minimum");
                node.entries[0].0 = parent.key_at(node_pos);
                node.entries.insert(0, (GenericKey::zero(), moved_child));
                parent.set_key_at(node_pos, moved_key);
                left.write_to(&mut left_guard[..]);
                let node_id = node.page_id;
                path.write(idx, &Node::Internal(node));
                self.reparent(path, idx + 1, moved_child, node_id)?;
            }
            _ => {
                return Err(MarrowError::Corruption(format!(
                    "sibling kind mismatch in index {}",
                    self.name
                )))
            }
        }
        Ok(())
    }

    /// Moves the right sibling's first entry to the end of the node
    /// at `idx`, refreshing the parent separator.
    fn rotate_from_right(
        &self,
        path: &mut WritePath<'_>,
        idx: usize,
        parent: &mut InternalNode<N>,
        node_pos: usize,
        right_guard: &mut PageWriteGuard,
    ) -> Result<()> {
        match (Node::<N>::read_from(&right_guard[..]), path.node(idx)) {
            (Node::Leaf(mut right), Node::Leaf(mut node)) => {
                let entry = right.entries.remove(0);
                node.entries.push(entry);
                parent.set_key_at(node_pos + 1, right.entries[0].0);
                right.write_to(&mut right_guard[..]);
                path.write(idx, &Node::Leaf(node));
            }
            (Node::Internal(mut right), Node::Internal(mut node)) => {
                let (_, moved_child) = right.entries.remove(0);
                let next_separator = right.entries[0].0;
                node.entries
                    .push((parent.key_at(node_pos + 1), moved_child));
                parent.set_key_at(node_pos + 1, next_separator);
                right.write_to(&mut right_guard[..]);
                let node_id = node.page_id;
                path.write(idx, &Node::Internal(node));
                self.reparent(path, idx + 1, moved_child, node_id)?;
            }
            _ => {
                return Err(MarrowError::Corruption(format!(
                    "sibling kind mismatch in index {}",
                    self.name
                )))
            }
        }
        Ok(())
    }

    /// Merges the node at `idx` with a sibling (left preferred) and
    /// drops the separator from `parent`. Returns true on success;
    /// one of the merges always applies when neither sibling can lend.
    fn merge_with_sibling(
        &self,
        path: &mut WritePath<'_>,
        idx: usize,
        parent: &mut InternalNode<N>,
        node_pos: usize,
    ) -> Result<bool> {
        let node: Node<N> = path.node(idx);

        // 3. Fold the node into its left sibling.
        if node_pos > 0 {
            let left_id = parent.child_at(node_pos - 1);
            let left_page = self.pool.fetch_page(left_id)?;
            let mut left_guard = left_page.write_latch();
            let left = Node::<N>::read_from(&left_guard[..]);
            let fits = match (&left, &node) {
                (Node::Leaf(l), Node::Leaf(n)) => l.size() + n.size() < l.max_size,
                (Node::Internal(l), Node::Internal(n)) => l.size() + n.size() < l.max_size,
                _ => false,
            };
            if fits {
                match (left, node) {
                    (Node::Leaf(mut left), Node::Leaf(node)) => {
                        left.entries.extend(node.entries.iter().copied());
                        left.next_page_id = node.next_page_id;
                        left.write_to(&mut left_guard[..]);
                    }
                    (Node::Internal(mut left), Node::Internal(mut node)) => {
                        node.entries[0].0 = parent.key_at(node_pos);
                        let left_id = left.page_id;
                        for &(_, child) in &node.entries {
                            self.reparent(path, idx + 1, child, left_id)?;
                        }
                        left.entries.extend(node.entries.iter().copied());
                        left.write_to(&mut left_guard[..]);
                    }
                    _ => unreachable!("kinds checked above"),
                }
                drop(left_guard);
                self.pool.unpin_page(left_id, true);
                parent.remove_at(node_pos);
                path.mark_deleted(path.page_id_at(idx));
                return Ok(true);
            }
            drop(left_guard);
            self.pool.unpin_page(left_id, false);
        }

        // 4. Fold the right sibling into the node.
        if node_pos + 1 < parent.size() {
            let right_id = parent.child_at(node_pos + 1);
            let right_page = self.pool.fetch_page(right_id)?;
            let right_guard = right_page.write_latch();
            let right = Node::<N>::read_from(&right_guard[..]);
            let fits = match (&right, &path.node::<N>(idx)) {
                (Node::Leaf(r), Node::Leaf(n)) => r.size() + n.size() < n.max_size,
                (Node::Internal(r), Node::Internal(n)) => r.size() + n.size() < n.max_size,
                _ => false,
            };
            if fits {
                match (path.node::<N>(idx), right) {
                    (Node::Leaf(mut node), Node::Leaf(right)) => {
                        node.entries.extend(right.entries.iter().copied());
                        node.next_page_id = right.next_page_id;
                        path.write(idx, &Node::Leaf(node));
                    }
                    (Node::Internal(mut node), Node::Internal(mut right)) => {
                        right.entries[0].0 = parent.key_at(node_pos + 1);
                        let node_id = node.page_id;
                        for &(_, child) in &right.entries {
                            self.reparent(path, idx + 1, child, node_id)?;
                        }
                        node.entries.extend(right.entries.iter().copied());
                        path.write(idx, &Node::Internal(node));
                    }
                    _ => unreachable!("kinds checked above"),
                }
                drop(right_guard);
                self.pool.unpin_page(right_id, false);
                parent.remove_at(node_pos + 1);
                path.mark_deleted(right_id);
                return Ok(true);
            }
            drop(right_guard);
            self.pool.unpin_page(right_id, false);
        }

        Ok(false)
    }

    /// Shrinks the tree at the root: an empty root leaf empties the
    /// tree; an internal root with a single child promotes it.
    fn adjust_root(&self, path: &mut WritePath<'_>) -> Result<()> {
        match path.node::<N>(0) {
            Node::Leaf(leaf) => {
                if leaf.size() == 0 {
                    self.set_root(PageId::INVALID)?;
                    path.mark_deleted(leaf.page_id);
                }
            }
            Node::Internal(root) => {
                if root.size() == 1 {
                    let child = root.child_at(0);
                    self.reparent(path, 1, child, PageId::INVALID)?;
                    self.set_root(child)?;
                    path.mark_deleted(root.page_id);
                }
            }
        }
        Ok(())
    }

    /// Forward iterator from the smallest key.
    pub fn iter(&self) -> Result<TreeIter<'_, N>> {
        match self.find_leaf_shared(Target::Leftmost)? {
            Some((page, guard)) => {
                let Node::Leaf(leaf) = Node::<N>::read_from(&guard[..]) else {
                    unreachable!("shared descent ends at a leaf");
                };
                let page_id = page.page_id();
                drop(guard);
                self.pool.unpin_page(page_id, false);
                Ok(TreeIter::new(self, leaf, 0))
            }
            None => Ok(TreeIter::empty(self)),
        }
    }

    /// Forward iterator from the smallest key >= `key`.
    pub fn iter_from(&self, key: &GenericKey<N>) -> Result<TreeIter<'_, N>> {
        match self.find_leaf_shared(Target::Key(key))? {
            Some((page, guard)) => {
                let Node::Leaf(leaf) = Node::<N>::read_from(&guard[..]) else {
                    unreachable!("shared descent ends at a leaf");
                };
                let start = leaf.key_index(key);
                let page_id = page.page_id();
                drop(guard);
                self.pool.unpin_page(page_id, false);
                Ok(TreeIter::new(self, leaf, start))
            }
            None => Ok(TreeIter::empty(self)),
        }
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPoolManager> {
        &self.pool
    }

    /// Walks the whole tree checking structural invariants: key
    /// order, size bounds, separator bounds, parent links, and the
    /// leaf chain. Single-threaded test support.
    pub fn verify_integrity(&self) -> Result<()> {
        let root_id = self.root();
        if !root_id.is_valid() {
            return Ok(());
        }
        let mut leftmost_leaf = PageId::INVALID;
        self.verify_node(root_id, PageId::INVALID, None, None, &mut leftmost_leaf)?;

        // The leaf chain visits strictly increasing keys.
        let mut previous: Option<GenericKey<N>> = None;
        let mut page_id = leftmost_leaf;
        while page_id.is_valid() {
            let page = self.pool.fetch_page(page_id)?;
            let guard = page.read_latch();
            let Node::Leaf(leaf) = Node::<N>::read_from(&guard[..]) else {
                return Err(MarrowError::Corruption(format!(
                    "leaf chain reaches non-leaf {}",
                    page_id
                )));
            };
            for (key, _) in &leaf.entries {
                if let Some(prev) = previous {
                    if prev >= *key {
                        return Err(MarrowError::Corruption(format!(
                            "leaf chain out of order at {}",
                            page_id
                        )));
                    }
                }
                previous = Some(*key);
            }
            let next = leaf.next_page_id;
            drop(guard);
            self.pool.unpin_page(page_id, false);
            page_id = next;
        }
        Ok(())
    }

    fn verify_node(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<GenericKey<N>>,
        upper: Option<GenericKey<N>>,
        leftmost_leaf: &mut PageId,
    ) -> Result<()> {
        let corrupted = |reason: String| Err(MarrowError::Corruption(reason));
        let page = self.pool.fetch_page(page_id)?;
        let guard = page.read_latch();
        let node = Node::<N>::read_from(&guard[..]);
        let is_root = page_id == self.root();
        drop(guard);
        self.pool.unpin_page(page_id, false);

        if node.parent_page_id() != expected_parent {
            return corrupted(format!("bad parent link at {}", page_id));
        }

        match node {
            Node::Leaf(leaf) => {
                if !is_root && (leaf.size() < leaf.min_size() || leaf.size() > leaf.max_size) {
                    return corrupted(format!("leaf {} size {} out of bounds", page_id, leaf.size()));
                }
                if !leftmost_leaf.is_valid() {
                    *leftmost_leaf = page_id;
                }
                for window in leaf.entries.windows(2) {
                    if window[0].0 >= window[1].0 {
                        return corrupted(format!("unordered keys in leaf {}", page_id));
                    }
                }
                for (key, _) in &leaf.entries {
                    if matches!(lower, Some(l) if *key < l) {
                        return corrupted(format!("key below separator in leaf {}", page_id));
                    }
                    if matches!(upper, Some(u) if *key >= u) {
                        return corrupted(format!("key above separator in leaf {}", page_id));
                    }
                }
            }
            Node::Internal(internal) => {
                if is_root {
                    if internal.size() < 2 {
                        return corrupted(format!("root {} has {} children", page_id, internal.size()));
                    }
                } else if internal.size() < internal.min_size() || internal.size() > internal.max_size
                {
                    return corrupted(format!(
                        "internal {} size {} out of bounds",
                        page_id,
                        internal.size()
                    ));
                }
                for window in internal.entries[1..].windows(2) {
                    if window[0].0 >= window[1].0 {
                        return corrupted(format!("unordered separators in {}", page_id));
                    }
                }
                for (i, &(separator, child)) in internal.entries.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(separator) };
                    let child_upper = if i + 1 < internal.size() {
                        Some(internal.key_at(i + 1))
                    } else {
                        upper
                    };
                    self.verify_node(child, page_id, child_lower, child_upper, leftmost_leaf)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrow_buffer::DiskManager;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn key(v: i64) -> GenericKey<8> {
        GenericKey::from_i64(v)
    }

    fn rid(v: i64) -> Rid {
        Rid::new(PageId(1000 + (v / 100) as i32), (v % 100) as u32)
    }

    fn setup(frames: usize) -> (tempfile::TempDir, Arc<BufferPoolManager>) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(
            DiskManager::new(dir.path().join("test.db"), dir.path().join("test.log"))
                .unwrap(),
        );
        let pool = Arc::new(BufferPoolManager::new(frames, disk, 16));

        // Format the header page.
        let page = pool.new_page().unwrap();
        assert_eq!(page.page_id(), PageId::HEADER);
        {
            let mut guard = page.write_latch();
            HeaderPage::init(&mut guard[..]);
        }
        pool.unpin_page(PageId::HEADER, true);
        (dir, pool)
    }

    fn small_tree(pool: &Arc<BufferPoolManager>) -> BPlusTree<8> {
        BPlusTree::with_max_sizes("test_index", Arc::clone(pool), 4, 4).unwrap()
    }

    #[test]
    fn test_empty_tree() {
        let (_dir, pool) = setup(64);
        let tree = small_tree(&pool);

        assert!(tree.is_empty());
        assert_eq!(tree.get(&key(1)).unwrap(), None);
        tree.remove(&key(1)).unwrap();
        assert_eq!(tree.iter().unwrap().count(), 0);
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, pool) = setup(64);
        let tree = small_tree(&pool);

        for v in [3i64, 1, 2] {
            assert!(tree.insert(key(v), rid(v)).unwrap());
        }
        assert!(!tree.is_empty());
        for v in 1..=3 {
            assert_eq!(tree.get(&key(v)).unwrap(), Some(rid(v)));
        }
        assert_eq!(tree.get(&key(9)).unwrap(), None);
        tree.verify_integrity().unwrap();
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let (_dir, pool) = setup(64);
        let tree = small_tree(&pool);

        assert!(tree.insert(key(7), rid(7)).unwrap());
        assert!(!tree.insert(key(7), rid(8)).unwrap());
        // The original value is preserved.
        assert_eq!(tree.get(&key(7)).unwrap(), Some(rid(7)));
    }

    #[test]
    fn test_splits_build_multi_level_tree() {
        let (_dir, pool) = setup(64);
        let tree = small_tree(&pool);

        for v in 0..64i64 {
            assert!(tree.insert(key(v), rid(v)).unwrap(), "insert {}", v);
            tree.verify_integrity().unwrap();
        }
        for v in 0..64i64 {
            assert_eq!(tree.get(&key(v)).unwrap(), Some(rid(v)), "get {}", v);
        }
    }

    #[test]
    fn test_reverse_insertion_order() {
        let (_dir, pool) = setup(64);
        let tree = small_tree(&pool);

        for v in (0..64i64).rev() {
            assert!(tree.insert(key(v), rid(v)).unwrap());
        }
        tree.verify_integrity().unwrap();
        let scanned: Vec<i64> = tree.iter().unwrap().map(|(k, _)| k.to_i64()).collect();
        assert_eq!(scanned, (0..64i64).collect::<Vec<_>>());
    }

    #[test]
    fn test_remove_with_rebalancing() {
        let (_dir, pool) = setup(64);
        let tree = small_tree(&pool);

        let mut keys: Vec<i64> = (0..128).collect();
        for &v in &keys {
            tree.insert(key(v), rid(v)).unwrap();
        }

        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        keys.shuffle(&mut rng);
        let mut remaining: std::collections::HashSet<i64> = keys.iter().copied().collect();

        for &v in &keys {
            tree.remove(&key(v)).unwrap();
            remaining.remove(&v);
            tree.verify_integrity().unwrap();

            // Spot-check membership after every removal.
            assert_eq!(tree.get(&key(v)).unwrap(), None);
            if let Some(&survivor) = remaining.iter().next() {
                assert_eq!(tree.get(&key(survivor)).unwrap(), Some(rid(survivor)));
            }
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn test_insert_delete_round_trip() {
        // Insert 1..=1000 then remove in shuffled order, checking
        // presence matches expectation throughout.
        let (_dir, pool) = setup(128);
        let tree: BPlusTree<8> = BPlusTree::new("round_trip", Arc::clone(&pool)).unwrap();

        let mut keys: Vec<i64> = (1..=1000).collect();
        for &v in &keys {
            assert!(tree.insert(key(v), rid(v)).unwrap());
        }
        tree.verify_integrity().unwrap();

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        keys.shuffle(&mut rng);

        for (i, &v) in keys.iter().enumerate() {
            tree.remove(&key(v)).unwrap();
            if i % 100 == 0 {
                tree.verify_integrity().unwrap();
            }
            assert_eq!(tree.get(&key(v)).unwrap(), None);
        }
        assert!(tree.is_empty());
        tree.verify_integrity().unwrap();

        // The tree is usable again after emptying out.
        assert!(tree.insert(key(5), rid(5)).unwrap());
        assert_eq!(tree.get(&key(5)).unwrap(), Some(rid(5)));
    }

    #[test]
    fn test_iterator_full_scan() {
        let (_dir, pool) = setup(64);
        let tree = small_tree(&pool);

        for v in (0..40i64).rev() {
            tree.insert(key(v), rid(v)).unwrap();
        }
        let scanned: Vec<(i64, Rid)> = tree
            .iter()
            .unwrap()
            .map(|(k, r)| (k.to_i64(), r))
            .collect();
        assert_eq!(scanned.len(), 40);
        for (i, (k, r)) in scanned.iter().enumerate() {
            assert_eq!(*k, i as i64);
            assert_eq!(*r, rid(i as i64));
        }
    }

    #[test]
    fn test_iterator_from_key() {
        let (_dir, pool) = setup(64);
        let tree = small_tree(&pool);

        for v in 0..40i64 {
            tree.insert(key(v * 2), rid(v)).unwrap();
        }

        // Exact hit.
        let from_20: Vec<i64> = tree
            .iter_from(&key(20))
            .unwrap()
            .map(|(k, _)| k.to_i64())
            .collect();
        assert_eq!(from_20[0], 20);
        assert_eq!(from_20.len(), 30);

        // Between keys: starts at the next larger one.
        let from_21: Vec<i64> = tree
            .iter_from(&key(21))
            .unwrap()
            .map(|(k, _)| k.to_i64())
            .collect();
        assert_eq!(from_21[0], 22);

        // Past the end.
        assert_eq!(tree.iter_from(&key(1000)).unwrap().count(), 0);
    }

    #[test]
    fn test_concurrent_disjoint_inserts() {
        use std::thread;

        let (_dir, pool) = setup(256);
        let tree = Arc::new(small_tree(&pool));

        let threads: Vec<_> = (0..4i64)
            .map(|t| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for i in 0..200i64 {
                        let v = t * 1000 + i;
                        assert!(tree.insert(key(v), rid(v)).unwrap());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        tree.verify_integrity().unwrap();
        for t in 0..4i64 {
            for i in 0..200i64 {
                let v = t * 1000 + i;
                assert_eq!(tree.get(&key(v)).unwrap(), Some(rid(v)), "key {}", v);
            }
        }
        assert_eq!(tree.iter().unwrap().count(), 800);
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        use std::thread;

        let (_dir, pool) = setup(256);
        let tree = Arc::new(small_tree(&pool));
        for v in 0..200i64 {
            tree.insert(key(v), rid(v)).unwrap();
        }

        let writer = {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for v in 200..400i64 {
                    tree.insert(key(v), rid(v)).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for v in 0..200i64 {
                        // Pre-existing keys stay visible throughout.
                        assert_eq!(tree.get(&key(v)).unwrap(), Some(rid(v)));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        tree.verify_integrity().unwrap();
        assert_eq!(tree.iter().unwrap().count(), 400);
    }

    #[test]
    fn test_root_replaced_in_header_page() {
        let (_dir, pool) = setup(64);
        let tree = small_tree(&pool);

        for v in 0..32i64 {
            tree.insert(key(v), rid(v)).unwrap();
        }
        // The header page record tracks the current root.
        let page = pool.fetch_page(PageId::HEADER).unwrap();
        let recorded = {
            let mut guard = page.write_latch();
            HeaderPage::new(&mut guard[..]).get_root("test_index")
        };
        pool.unpin_page(PageId::HEADER, false);
        assert_eq!(recorded, Some(tree.root()));

        for v in 0..32i64 {
            tree.remove(&key(v)).unwrap();
        }
        let page = pool.fetch_page(PageId::HEADER).unwrap();
        let recorded = {
            let mut guard = page.write_latch();
            HeaderPage::new(&mut guard[..]).get_root("test_index")
        };
        pool.unpin_page(PageId::HEADER, false);
        assert_eq!(recorded, Some(PageId::INVALID));
    }
}
