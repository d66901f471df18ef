//! Grow-only extendible hash table.
//!
//! Directory layout:
//! ```text
//! global_depth = 2          buckets (local_depth)
//! +----+
//! | 00 | ------------------> bucket A (2)
//! | 01 | ------------------> bucket B (1)
//! | 10 | ------------------> bucket C (2)
//! | 11 |   (gap: falls back to fewer address bits -> bucket B)
//! +----+
//! ```
//!
//! A bucket overflow splits that bucket: the directory doubles when the
//! bucket's local depth equals the global depth, otherwise only the
//! sibling slot `id | (1 << local_depth)` is populated. Directory slots
//! never created yet are transient gaps; addressing falls back to fewer
//! hash bits until it lands on a populated slot. Buckets are never merged.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A single hash bucket.
struct Bucket<K, V> {
    local_depth: usize,
    items: Vec<(K, V)>,
}

impl<K, V> Bucket<K, V> {
    fn new(local_depth: usize) -> Self {
        Self {
            local_depth,
            items: Vec::new(),
        }
    }
}

struct Inner<K, V> {
    global_depth: usize,
    num_buckets: usize,
    directory: Vec<Option<Bucket<K, V>>>,
}

/// Thread-safe extendible hash table.
///
/// Used as the buffer pool's page table and as the value index inside the
/// LRU replacer. All public operations take a single mutex.
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a table whose buckets hold up to `bucket_size` entries.
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        let mut directory = Vec::with_capacity(1);
        directory.push(Some(Bucket::new(0)));
        Self {
            bucket_size,
            inner: Mutex::new(Inner {
                global_depth: 0,
                num_buckets: 1,
                directory,
            }),
        }
    }

    fn hash(key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn low_bits(hash: u64, bits: usize) -> usize {
        (hash & ((1u64 << bits) - 1)) as usize
    }

    /// Directory slot for `hash`, falling back over gaps.
    fn bucket_index(inner: &Inner<K, V>, hash: u64) -> usize {
        let mut bits = inner.global_depth;
        let mut id = Self::low_bits(hash, bits);
        while inner.directory[id].is_none() {
            bits -= 1;
            id = Self::low_bits(hash, bits);
        }
        id
    }

    /// Inserts a key/value pair, replacing the value of an existing key.
    /// Splits the target bucket on overflow.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        let hash = Self::hash(&key);
        let id = Self::bucket_index(&inner, hash);

        let bucket = inner.directory[id].as_mut().expect("addressed bucket");
        if let Some(slot) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
            return;
        }
        bucket.items.push((key, value));

        if bucket.items.len() > self.bucket_size {
            Self::split(&mut inner, self.bucket_size, id);
        }
    }

    /// Splits the bucket at directory slot `id`, redistributing its
    /// entries over one more address bit. Recurses if a resulting bucket
    /// is still overfull.
    fn split(inner: &mut Inner<K, V>, bucket_size: usize, id: usize) {
        let depth = inner.directory[id].as_ref().expect("split target").local_depth;
        let items = std::mem::take(&mut inner.directory[id].as_mut().unwrap().items);

        if depth == inner.global_depth {
            inner.global_depth += 1;
            inner
                .directory
                .resize_with(1 << inner.global_depth, || None);
        }

        let new_id = id | (1 << depth);
        let depth = depth + 1;
        inner.directory[id] = Some(Bucket::new(depth));
        inner.directory[new_id] = Some(Bucket::new(depth));
        inner.num_buckets += 1;

        for (k, v) in items {
            let offset = Self::low_bits(Self::hash(&k), depth);
            inner
                .directory[offset]
                .as_mut()
                .expect("split destination")
                .items
                .push((k, v));
        }

        if inner.directory[id].as_ref().unwrap().items.len() > bucket_size {
            Self::split(inner, bucket_size, id);
        }
        if inner.directory[new_id].as_ref().unwrap().items.len() > bucket_size {
            Self::split(inner, bucket_size, new_id);
        }
    }

    /// Looks up the value for `key` with a linear scan of its bucket.
    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let id = Self::bucket_index(&inner, Self::hash(key));
        inner.directory[id]
            .as_ref()?
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Removes the first entry matching `key`. Buckets are never merged.
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let id = Self::bucket_index(&inner, Self::hash(key));
        let bucket = match inner.directory[id].as_mut() {
            Some(b) => b,
            None => return false,
        };
        match bucket.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                bucket.items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Current global depth of the directory.
    pub fn global_depth(&self) -> usize {
        self.inner.lock().global_depth
    }

    /// Local depth of the bucket at directory slot `index`, if populated.
    pub fn local_depth(&self, index: usize) -> Option<usize> {
        let inner = self.inner.lock();
        inner.directory.get(index)?.as_ref().map(|b| b.local_depth)
    }

    /// Number of allocated buckets.
    pub fn num_buckets(&self) -> usize {
        self.inner.lock().num_buckets
    }

    /// Total number of stored entries.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .directory
            .iter()
            .flatten()
            .map(|b| b.items.len())
            .sum()
    }

    /// Returns true if no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
