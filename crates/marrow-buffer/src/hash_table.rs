//! Extendible hash table used as the buffer pool page table.
//!
//! The directory is a power-of-two-sized vector of bucket references;
//! doubling duplicates pointers rather than rehashing, so a reader
//! that resolved its slot before a doubling still lands on the right
//! bucket. Buckets carry a local depth no greater than the global
//! depth and split in place when they overflow. The table never
//! shrinks.

use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::RandomState;
use std::collections::HashSet;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

/// Entries and metadata of one bucket, behind the bucket latch.
struct BucketData<K, V> {
    /// Number of low hash bits this bucket is keyed on.
    local_depth: u32,
    /// Key-value pairs, scanned linearly.
    entries: Vec<(K, V)>,
    /// Set when a split has replaced this bucket; holders must retry
    /// through the directory.
    stale: bool,
}

type Bucket<K, V> = Arc<Mutex<BucketData<K, V>>>;

fn new_bucket<K, V>(local_depth: u32, entries: Vec<(K, V)>) -> Bucket<K, V> {
    Arc::new(Mutex::new(BucketData {
        local_depth,
        entries,
        stale: false,
    }))
}

/// The directory, behind the directory latch.
struct Directory<K, V> {
    global_depth: u32,
    buckets: Vec<Bucket<K, V>>,
}

impl<K, V> Directory<K, V> {
    fn mask(&self) -> u64 {
        (1u64 << self.global_depth) - 1
    }

    fn slot(&self, hash: u64) -> usize {
        (hash & self.mask()) as usize
    }

    /// Duplicates every slot in place: slot `i` and `i + old_size`
    /// reference the same bucket afterwards. Local depths unchanged.
    fn double(&mut self) {
        let current: Vec<_> = self.buckets.clone();
        self.buckets.extend(current);
        self.global_depth += 1;
    }
}

/// Thread-safe extendible hash table.
///
/// `Find`/`Remove` take the directory latch only long enough to
/// resolve the bucket, then work under the bucket latch. `Insert`
/// does the same on the common path; bucket splits and directory
/// doubling run under the directory latch in write mode.
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    directory: RwLock<Directory<K, V>>,
    /// Maximum entries per bucket before a split.
    bucket_size: usize,
    hasher: S,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a table with global depth 1 and two empty buckets.
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    /// Creates a table with the given hasher state.
    pub fn with_hasher(bucket_size: usize, hasher: S) -> Self {
        assert!(bucket_size > 0, "bucket_size must be positive");
        Self {
            directory: RwLock::new(Directory {
                global_depth: 1,
                buckets: vec![new_bucket(1, Vec::new()), new_bucket(1, Vec::new())],
            }),
            bucket_size,
            hasher,
        }
    }

    fn hash(&self, key: &K) -> u64 {
        let mut state = self.hasher.build_hasher();
        key.hash(&mut state);
        state.finish()
    }

    /// Resolves the bucket for a hash under a short directory read lock.
    fn bucket_for(&self, hash: u64) -> Bucket<K, V> {
        let dir = self.directory.read();
        let slot = dir.slot(hash);
        dir.buckets[slot].clone()
    }

    /// Returns the value associated with the key, if any.
    pub fn find(&self, key: &K) -> Option<V> {
        let hash = self.hash(key);
        loop {
            let bucket = self.bucket_for(hash);
            let data = bucket.lock();
            if data.stale {
                continue;
            }
            return data
                .entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone());
        }
    }

    /// Returns true if the key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Inserts a key-value pair, overwriting any existing value.
    pub fn insert(&self, key: K, value: V) {
        let hash = self.hash(&key);
        let mut pair = Some((key, value));

        let overflowed = loop {
            let bucket = self.bucket_for(hash);
            let mut data = bucket.lock();
            if data.stale {
                continue;
            }
            let (key, value) = pair.take().expect("pair consumed twice");
            if let Some(entry) = data.entries.iter_mut().find(|(k, _)| *k == key) {
                entry.1 = value;
                return;
            }
            data.entries.push((key, value));
            break data.entries.len() > self.bucket_size;
        };

        if overflowed {
            self.split(hash);
        }
    }

    /// Removes the entry for the key. Returns true if it was present.
    ///
    /// The directory never shrinks on removal.
    pub fn remove(&self, key: &K) -> bool {
        let hash = self.hash(key);
        loop {
            let bucket = self.bucket_for(hash);
            let mut data = bucket.lock();
            if data.stale {
                continue;
            }
            let before = data.entries.len();
            data.entries.retain(|(k, _)| k != key);
            return data.entries.len() < before;
        }
    }

    /// Splits the bucket the hash routes to until it no longer
    /// overflows, doubling the directory as needed.
    fn split(&self, hash: u64) {
        let mut dir = self.directory.write();

        loop {
            let slot = dir.slot(hash);
            let bucket = dir.buckets[slot].clone();
            let mut data = bucket.lock();
            if data.entries.len() <= self.bucket_size {
                return;
            }

            if data.local_depth == dir.global_depth {
                dir.double();
            }

            let depth = data.local_depth;
            let bit = 1u64 << depth;

            let mut low = Vec::new();
            let mut high = Vec::new();
            for (k, v) in data.entries.drain(..) {
                if self.hash(&k) & bit == 0 {
                    low.push((k, v));
                } else {
                    high.push((k, v));
                }
            }
            data.stale = true;
            drop(data);

            let low_bucket = new_bucket(depth + 1, low);
            let high_bucket = new_bucket(depth + 1, high);

            // Rewire every slot whose low `depth` bits match this
            // bucket onto the half selected by bit `depth`.
            let low_mask = bit - 1;
            let tag = slot as u64 & low_mask;
            for i in 0..dir.buckets.len() {
                if i as u64 & low_mask == tag {
                    dir.buckets[i] = if i as u64 & bit == 0 {
                        low_bucket.clone()
                    } else {
                        high_bucket.clone()
                    };
                }
            }
            // The half holding the inserted key may itself still be
            // over capacity; the loop re-checks it.
        }
    }

    /// Returns the global depth of the directory.
    pub fn global_depth(&self) -> u32 {
        self.directory.read().global_depth
    }

    /// Returns the local depth of the bucket at a directory slot.
    pub fn local_depth(&self, slot: usize) -> u32 {
        let bucket = {
            let dir = self.directory.read();
            dir.buckets[slot].clone()
        };
        let data = bucket.lock();
        data.local_depth
    }

    /// Returns the number of distinct buckets.
    pub fn num_buckets(&self) -> usize {
        let dir = self.directory.read();
        let mut seen = HashSet::new();
        for bucket in &dir.buckets {
            seen.insert(Arc::as_ptr(bucket) as usize);
        }
        seen.len()
    }

    /// Returns the number of directory slots (2^global_depth).
    pub fn dir_size(&self) -> usize {
        self.directory.read().buckets.len()
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        let buckets: Vec<_> = {
            let dir = self.directory.read();
            let mut seen = HashSet::new();
            dir.buckets
                .iter()
                .filter(|b| seen.insert(Arc::as_ptr(b) as usize))
                .cloned()
                .collect()
        };
        buckets.iter().map(|b| b.lock().entries.len()).sum()
    }

    /// Returns true if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` for every entry. Iteration order is unspecified.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        let buckets: Vec<_> = {
            let dir = self.directory.read();
            let mut seen = HashSet::new();
            dir.buckets
                .iter()
                .filter(|b| seen.insert(Arc::as_ptr(b) as usize))
                .cloned()
                .collect()
        };
        for bucket in buckets {
            let data = bucket.lock();
            for (k, v) in &data.entries {
                f(k, v);
            }
        }
    }
}
