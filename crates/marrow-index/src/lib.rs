//! B+ tree index for MarrowDB.
//!
//! A persistent ordered map from fixed-width keys to RIDs over
//! buffer-pool pages, with latch-crabbing concurrency: shared-latch
//! descent for reads, an optimistic single-leaf exclusive latch for
//! safe mutations, and a retained exclusive root-to-leaf path when a
//! split or merge can propagate.

mod iterator;
mod key;
mod node;
mod tree;

pub use iterator::TreeIter;
pub use key::GenericKey;
pub use node::{internal_max_size, leaf_max_size, InternalNode, LeafNode, Node};
pub use tree::BPlusTree;
