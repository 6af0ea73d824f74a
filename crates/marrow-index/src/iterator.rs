//! Forward iteration over the leaf chain.

use crate::key::GenericKey;
use crate::node::{LeafNode, Node};
use crate::tree::BPlusTree;
use log::warn;
use marrow_common::{PageId, Rid};

/// Forward iterator over `(key, RID)` pairs in key order.
///
/// Holds no latches between steps: each visited leaf is snapshotted
/// under a shared latch, then the iterator hops along `next_page_id`.
/// Concurrent mutations may therefore skip or re-surface entries
/// (weak snapshot semantics).
pub struct TreeIter<'a, const N: usize> {
    tree: &'a BPlusTree<N>,
    entries: Vec<(GenericKey<N>, Rid)>,
    next_page_id: PageId,
    index: usize,
}

impl<'a, const N: usize> TreeIter<'a, N> {
    pub(crate) fn new(tree: &'a BPlusTree<N>, leaf: LeafNode<N>, start: usize) -> Self {
        Self {
            tree,
            entries: leaf.entries,
            next_page_id: leaf.next_page_id,
            index: start,
        }
    }

    pub(crate) fn empty(tree: &'a BPlusTree<N>) -> Self {
        Self {
            tree,
            entries: Vec::new(),
            next_page_id: PageId::INVALID,
            index: 0,
        }
    }
}

impl<const N: usize> Iterator for TreeIter<'_, N> {
    type Item = (GenericKey<N>, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.index < self.entries.len() {
                let entry = self.entries[self.index];
                self.index += 1;
                return Some(entry);
            }
            if !self.next_page_id.is_valid() {
                return None;
            }

            let page_id = self.next_page_id;
            let page = match self.tree.pool().fetch_page(page_id) {
                Ok(page) => page,
                Err(e) => {
                    warn!("iterator stopped: cannot fetch {}: {}", page_id, e);
                    self.next_page_id = PageId::INVALID;
                    return None;
                }
            };
            let guard = page.read_latch();
            let node = Node::<N>::read_from(&guard[..]);
            drop(guard);
            self.tree.pool().unpin_page(page_id, false);

            let Node::Leaf(leaf) = node else {
                warn!("iterator stopped: {} is not a leaf", page_id);
                self.next_page_id = PageId::INVALID;
                return None;
            };
            self.entries = leaf.entries;
            self.next_page_id = leaf.next_page_id;
            self.index = 0;
        }
    }
}
