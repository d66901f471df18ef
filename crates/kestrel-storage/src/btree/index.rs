//! The B+tree index.
//!
//! Concurrency follows latch crabbing: descent acquires each page's
//! latch (shared for lookups, exclusive for structural operations)
//! before moving down, holding ancestor latches only until the current
//! node is proven safe — unable to split for inserts, unable to
//! underflow for deletes. The root pointer mutex participates as the
//! outermost ancestor, so a root split or collapse can swing the pointer
//! while it is still protected.
//!
//! Ancestors are kept as a stack of write guards; dropping the stack
//! releases every latch and pin exactly once, on every exit path.

use crate::btree::internal::InternalPage;
use crate::btree::iterator::IndexIterator;
use crate::btree::key::IndexKey;
use crate::btree::leaf::LeafPage;
use crate::btree::page::TreePage;
use crate::header::HeaderPage;
use kestrel_buffer::{BufferPoolManager, PageReadGuard, PageWriteGuard};
use kestrel_common::{KestrelError, PageId, Result, Rid, HEADER_PAGE_ID};
use kestrel_txn::Transaction;
use parking_lot::{Mutex, MutexGuard};
use std::marker::PhantomData;
use std::sync::Arc;

/// What a descent intends to do; decides latch modes and safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    Insert,
    Delete,
}

/// Latches held on the path from the root down to the current node.
struct WriteContext<'a> {
    /// Held until the root can no longer be affected by this operation.
    root_lock: Option<MutexGuard<'a, PageId>>,
    /// Exclusively latched ancestors, root side first.
    ancestors: Vec<PageWriteGuard<'a>>,
}

impl<'a> WriteContext<'a> {
    /// Releases every ancestor latch and the root pointer lock.
    fn release(&mut self) {
        self.ancestors.clear();
        self.root_lock = None;
    }
}

/// An ordered unique-key index over fixed-size keys, storing RIDs at the
/// leaves. Reads and writes may run from multiple threads concurrently.
pub struct BPlusTree<K: IndexKey> {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    root_page_id: Mutex<PageId>,
    leaf_max_size: i32,
    internal_max_size: i32,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Opens (or registers) the index named `name`, with page capacities
    /// derived from the page size.
    pub fn new(name: &str, bpm: Arc<BufferPoolManager>) -> Result<Self> {
        Self::with_max_sizes(
            name,
            bpm,
            LeafPage::<K>::default_max_size(),
            InternalPage::<K>::default_max_size(),
        )
    }

    /// Opens (or registers) the index with explicit page capacities.
    /// Small capacities drive the split and merge paths in tests.
    pub fn with_max_sizes(
        name: &str,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: i32,
        internal_max_size: i32,
    ) -> Result<Self> {
        assert!(leaf_max_size >= 2 && internal_max_size >= 3, "degenerate fan-out");

        // Reserve page 0 for the header on a fresh file.
        if bpm.disk_manager().num_pages() == 0 {
            let header_id = bpm.disk_manager().allocate_page();
            debug_assert_eq!(header_id, HEADER_PAGE_ID);
        }

        let tree = Self {
            index_name: name.to_string(),
            bpm,
            root_page_id: Mutex::new(PageId::INVALID),
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        };

        let mut header = tree
            .bpm
            .fetch_page_write(HEADER_PAGE_ID)
            .ok_or(KestrelError::BufferPoolFull)?;
        match HeaderPage::get_root_id(&header[..], name) {
            Some(root) => *tree.root_page_id.lock() = root,
            None => HeaderPage::insert_record(&mut header[..], name, PageId::INVALID)?,
        }
        drop(header);
        Ok(tree)
    }

    pub fn name(&self) -> &str {
        &self.index_name
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id.lock().is_valid()
    }

    /// Current root page id (INVALID when empty).
    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.lock()
    }

    /// Rewrites this index's record in the header page. Called on every
    /// root change.
    fn update_root_page_id(&self, root: PageId) -> Result<()> {
        log::debug!("index {} root is now {root}", self.index_name);
        let mut header = self
            .bpm
            .fetch_page_write(HEADER_PAGE_ID)
            .ok_or(KestrelError::BufferPoolFull)?;
        HeaderPage::update_record(&mut header[..], &self.index_name, root)
    }

    /// Smallest legal size for a node. The root is exempt from the
    /// half-full rule: an internal root holds at least two children, a
    /// leaf root at least one entry.
    fn min_size(is_root: bool, is_leaf: bool, max_size: i32) -> i32 {
        if is_root {
            if is_leaf {
                1
            } else {
                2
            }
        } else {
            (max_size + 1) / 2
        }
    }

    /// A node is safe when the pending operation cannot propagate past
    /// it: inserts need room for one more entry, deletes need slack
    /// above the minimum.
    fn is_safe(data: &[u8], mode: AccessMode) -> bool {
        let size = TreePage::size(data);
        match mode {
            AccessMode::Insert => size < TreePage::max_size(data),
            AccessMode::Delete => {
                size > Self::min_size(
                    TreePage::is_root(data),
                    TreePage::is_leaf(data),
                    TreePage::max_size(data),
                )
            }
        }
    }

    /// Write-mode descent to the leaf responsible for `key`, crabbing:
    /// every page is write-latched before moving down, and all ancestor
    /// latches (including the root pointer lock) are released as soon as
    /// the current node is safe.
    fn find_leaf_write<'a>(
        &self,
        bpm: &'a BufferPoolManager,
        root_lock: MutexGuard<'a, PageId>,
        key: &K,
        mode: AccessMode,
    ) -> Result<(PageWriteGuard<'a>, WriteContext<'a>)> {
        let root_id = *root_lock;
        let mut ctx = WriteContext {
            root_lock: Some(root_lock),
            ancestors: Vec::new(),
        };

        let mut current = bpm
            .fetch_page_write(root_id)
            .ok_or(KestrelError::BufferPoolFull)?;
        loop {
            if Self::is_safe(&current[..], mode) {
                ctx.release();
            }
            if TreePage::is_leaf(&current[..]) {
                return Ok((current, ctx));
            }
            let child_id = InternalPage::<K>::lookup(&current[..], key);
            let child = bpm
                .fetch_page_write(child_id)
                .ok_or(KestrelError::BufferPoolFull)?;
            ctx.ancestors.push(current);
            current = child;
        }
    }

    /// Read-mode descent: each page is read-latched before the parent's
    /// latch is released. `None` key descends along the leftmost edge.
    fn find_leaf_read(&self, key: Option<&K>) -> Option<PageReadGuard<'_>> {
        let bpm = self.bpm.as_ref();
        let root_lock = self.root_page_id.lock();
        let root_id = *root_lock;
        if !root_id.is_valid() {
            return None;
        }
        let mut current = bpm.fetch_page_read(root_id)?;
        drop(root_lock);

        loop {
            if TreePage::is_leaf(&current[..]) {
                return Some(current);
            }
            let child_id = match key {
                Some(key) => InternalPage::<K>::lookup(&current[..], key),
                None => InternalPage::<K>::value_at(&current[..], 0),
            };
            // Assigning replaces (and thus releases) the parent only
            // after the child latch is held.
            current = bpm.fetch_page_read(child_id)?;
        }
    }

    /// Point lookup. Returns the RID stored under `key`, if any.
    pub fn get_value(&self, key: &K) -> Option<Rid> {
        let leaf = self.find_leaf_read(Some(key))?;
        LeafPage::<K>::lookup(&leaf[..], key)
    }

    /// Inserts `key -> rid`. Returns Ok(false) on a duplicate key.
    ///
    /// Buffer pool exhaustion is fatal for the tree and surfaces as
    /// `KestrelError::BufferPoolFull`.
    pub fn insert(&self, key: &K, rid: Rid, _txn: &Transaction) -> Result<bool> {
        let bpm = self.bpm.as_ref();
        let root_lock = self.root_page_id.lock();

        if !root_lock.is_valid() {
            self.start_new_tree(bpm, root_lock, key, rid)?;
            return Ok(true);
        }

        let (mut leaf, mut ctx) = self.find_leaf_write(bpm, root_lock, key, AccessMode::Insert)?;
        if LeafPage::<K>::lookup(&leaf[..], key).is_some() {
            return Ok(false);
        }

        let new_size = LeafPage::<K>::insert(&mut leaf[..], key, rid);
        if new_size > TreePage::max_size(&leaf[..]) {
            self.split_leaf(bpm, &mut ctx, leaf)?;
        }
        Ok(true)
    }

    /// Builds the first leaf and points the root at it.
    fn start_new_tree<'a>(
        &self,
        bpm: &'a BufferPoolManager,
        mut root_lock: MutexGuard<'a, PageId>,
        key: &K,
        rid: Rid,
    ) -> Result<()> {
        let mut root = bpm.new_page_write().ok_or(KestrelError::BufferPoolFull)?;
        let root_id = root.page_id();
        LeafPage::<K>::init(&mut root[..], root_id, PageId::INVALID, self.leaf_max_size);
        LeafPage::<K>::insert(&mut root[..], key, rid);
        drop(root);

        *root_lock = root_id;
        self.update_root_page_id(root_id)
    }

    /// Splits an overfull leaf: the upper half moves to a fresh sibling
    /// spliced into the chain, and the separator ascends.
    fn split_leaf<'a>(
        &self,
        bpm: &'a BufferPoolManager,
        ctx: &mut WriteContext<'a>,
        mut leaf: PageWriteGuard<'a>,
    ) -> Result<()> {
        let min = (TreePage::max_size(&leaf[..]) + 1) / 2;
        let split_key = LeafPage::<K>::key_at(&leaf[..], min as usize);

        let mut sibling = bpm.new_page_write().ok_or(KestrelError::BufferPoolFull)?;
        let sibling_id = sibling.page_id();
        LeafPage::<K>::init(
            &mut sibling[..],
            sibling_id,
            TreePage::parent_page_id(&leaf[..]),
            self.leaf_max_size,
        );
        LeafPage::<K>::move_half_to(&mut leaf[..], &mut sibling[..]);

        self.insert_into_parent(bpm, ctx, leaf, split_key, sibling)
    }

    /// Hooks `new_node` (right of `key`) into the parent of `old_node`,
    /// growing a new root or recursively splitting overfull parents.
    fn insert_into_parent<'a>(
        &self,
        bpm: &'a BufferPoolManager,
        ctx: &mut WriteContext<'a>,
        mut old_node: PageWriteGuard<'a>,
        key: K,
        mut new_node: PageWriteGuard<'a>,
    ) -> Result<()> {
        if TreePage::is_root(&old_node[..]) {
            let mut root = bpm.new_page_write().ok_or(KestrelError::BufferPoolFull)?;
            let root_id = root.page_id();
            InternalPage::<K>::init(&mut root[..], root_id, PageId::INVALID, self.internal_max_size);
            InternalPage::<K>::populate_new_root(
                &mut root[..],
                old_node.page_id(),
                &key,
                new_node.page_id(),
            );
            TreePage::set_parent_page_id(&mut old_node[..], root_id);
            TreePage::set_parent_page_id(&mut new_node[..], root_id);
            drop(root);
            drop(old_node);
            drop(new_node);

            let root_lock = ctx
                .root_lock
                .as_mut()
                .expect("root pointer lock held across a root split");
            **root_lock = root_id;
            ctx.release();
            return self.update_root_page_id(root_id);
        }

        let mut parent = ctx
            .ancestors
            .pop()
            .expect("unsafe child keeps its parent latched");
        TreePage::set_parent_page_id(&mut new_node[..], parent.page_id());
        let new_size = InternalPage::<K>::insert_node_after(
            &mut parent[..],
            old_node.page_id(),
            &key,
            new_node.page_id(),
        );
        drop(old_node);
        drop(new_node);

        if new_size <= TreePage::max_size(&parent[..]) {
            return Ok(());
        }

        // Parent overflows in turn: split it and recurse.
        let min = (TreePage::max_size(&parent[..]) + 1) / 2;
        let split_key = InternalPage::<K>::key_at(&parent[..], min as usize);

        let mut sibling = bpm.new_page_write().ok_or(KestrelError::BufferPoolFull)?;
        let sibling_id = sibling.page_id();
        InternalPage::<K>::init(
            &mut sibling[..],
            sibling_id,
            TreePage::parent_page_id(&parent[..]),
            self.internal_max_size,
        );
        let moved = InternalPage::<K>::move_half_to(&mut parent[..], &mut sibling[..]);
        for child_id in moved {
            let mut child = bpm
                .fetch_page_write(child_id)
                .ok_or(KestrelError::BufferPoolFull)?;
            TreePage::set_parent_page_id(&mut child[..], sibling_id);
        }

        self.insert_into_parent(bpm, ctx, parent, split_key, sibling)
    }

    /// Removes `key` if present, rebalancing underfull nodes.
    pub fn remove(&self, key: &K, _txn: &Transaction) -> Result<()> {
        let bpm = self.bpm.as_ref();
        let root_lock = self.root_page_id.lock();
        if !root_lock.is_valid() {
            return Ok(());
        }

        let (mut leaf, mut ctx) = self.find_leaf_write(bpm, root_lock, key, AccessMode::Delete)?;
        let new_size = LeafPage::<K>::remove_record(&mut leaf[..], key);
        let min = Self::min_size(
            TreePage::is_root(&leaf[..]),
            true,
            TreePage::max_size(&leaf[..]),
        );
        if new_size < min {
            self.coalesce_or_redistribute(bpm, &mut ctx, leaf)?;
        }
        Ok(())
    }

    /// Rebalances the underfull `node` against a sibling: borrow one
    /// entry when the pair cannot fit a single page, merge otherwise.
    fn coalesce_or_redistribute<'a>(
        &self,
        bpm: &'a BufferPoolManager,
        ctx: &mut WriteContext<'a>,
        node: PageWriteGuard<'a>,
    ) -> Result<()> {
        if TreePage::is_root(&node[..]) {
            return self.adjust_root(bpm, ctx, node);
        }

        let mut parent = ctx
            .ancestors
            .pop()
            .expect("underfull child keeps its parent latched");
        let node_index = InternalPage::<K>::value_index(&parent[..], node.page_id())
            .expect("node is linked from its parent");
        // Prefer the right sibling; fall back to the left at the edge.
        let sibling_index = if (node_index as i32) + 1 < TreePage::size(&parent[..]) {
            node_index + 1
        } else {
            node_index - 1
        };
        let sibling_id = InternalPage::<K>::value_at(&parent[..], sibling_index);
        let sibling = bpm
            .fetch_page_write(sibling_id)
            .ok_or(KestrelError::BufferPoolFull)?;

        let combined = TreePage::size(&sibling[..]) + TreePage::size(&node[..]);
        if combined > TreePage::max_size(&node[..]) {
            self.redistribute(bpm, &mut parent, node, sibling, node_index, sibling_index)?;
            return Ok(());
        }

        // Merge, always the right page into the left one.
        let (mut left, mut right, right_index) = if sibling_index < node_index {
            (sibling, node, node_index)
        } else {
            (node, sibling, sibling_index)
        };
        let left_id = left.page_id();
        let right_id = right.page_id();
        let separator = InternalPage::<K>::key_at(&parent[..], right_index);

        let moved_children = if TreePage::is_leaf(&right[..]) {
            LeafPage::<K>::move_all_to(&mut right[..], &mut left[..]);
            Vec::new()
        } else {
            InternalPage::<K>::move_all_to(&mut right[..], &mut left[..], &separator)
        };
        InternalPage::<K>::remove_at(&mut parent[..], right_index);
        drop(left);
        drop(right);

        for child_id in moved_children {
            let mut child = bpm
                .fetch_page_write(child_id)
                .ok_or(KestrelError::BufferPoolFull)?;
            TreePage::set_parent_page_id(&mut child[..], left_id);
        }
        bpm.delete_page(right_id);

        let parent_min = Self::min_size(
            TreePage::is_root(&parent[..]),
            false,
            TreePage::max_size(&parent[..]),
        );
        if TreePage::size(&parent[..]) < parent_min {
            return self.coalesce_or_redistribute(bpm, ctx, parent);
        }
        Ok(())
    }

    /// Moves one entry from `sibling` into `node` and refreshes the
    /// separator in the parent to the right-hand page's new lead key.
    fn redistribute<'a>(
        &self,
        bpm: &'a BufferPoolManager,
        parent: &mut PageWriteGuard<'a>,
        mut node: PageWriteGuard<'a>,
        mut sibling: PageWriteGuard<'a>,
        node_index: usize,
        sibling_index: usize,
    ) -> Result<()> {
        let node_id = node.page_id();
        let sibling_is_right = sibling_index > node_index;
        // The separator between the pair sits at the right-hand index.
        let separator_index = if sibling_is_right {
            sibling_index
        } else {
            node_index
        };

        let moved_child = if TreePage::is_leaf(&node[..]) {
            let new_separator = if sibling_is_right {
                LeafPage::<K>::move_first_to_end_of(&mut sibling[..], &mut node[..])
            } else {
                LeafPage::<K>::move_last_to_front_of(&mut sibling[..], &mut node[..])
            };
            InternalPage::<K>::set_key_at(&mut parent[..], separator_index, &new_separator);
            None
        } else {
            let middle = InternalPage::<K>::key_at(&parent[..], separator_index);
            let (moved_child, new_separator) = if sibling_is_right {
                InternalPage::<K>::move_first_to_end_of(&mut sibling[..], &mut node[..], &middle)
            } else {
                InternalPage::<K>::move_last_to_front_of(&mut sibling[..], &mut node[..], &middle)
            };
            InternalPage::<K>::set_key_at(&mut parent[..], separator_index, &new_separator);
            Some(moved_child)
        };
        drop(node);
        drop(sibling);

        if let Some(child_id) = moved_child {
            let mut child = bpm
                .fetch_page_write(child_id)
                .ok_or(KestrelError::BufferPoolFull)?;
            TreePage::set_parent_page_id(&mut child[..], node_id);
        }
        Ok(())
    }

    /// Shrinks the tree at the root: an internal root left with a single
    /// child hands the root role to that child; an emptied leaf root
    /// empties the tree.
    fn adjust_root<'a>(
        &self,
        bpm: &'a BufferPoolManager,
        ctx: &mut WriteContext<'a>,
        root: PageWriteGuard<'a>,
    ) -> Result<()> {
        let root_id = root.page_id();

        if !TreePage::is_leaf(&root[..]) && TreePage::size(&root[..]) == 1 {
            let new_root_id = InternalPage::<K>::value_at(&root[..], 0);
            drop(root);

            let mut child = bpm
                .fetch_page_write(new_root_id)
                .ok_or(KestrelError::BufferPoolFull)?;
            TreePage::set_parent_page_id(&mut child[..], PageId::INVALID);
            drop(child);

            let root_lock = ctx
                .root_lock
                .as_mut()
                .expect("root pointer lock held for a root collapse");
            **root_lock = new_root_id;
            ctx.release();
            bpm.delete_page(root_id);
            return self.update_root_page_id(new_root_id);
        }

        if TreePage::is_leaf(&root[..]) && TreePage::size(&root[..]) == 0 {
            drop(root);
            let root_lock = ctx
                .root_lock
                .as_mut()
                .expect("root pointer lock held for emptying the tree");
            **root_lock = PageId::INVALID;
            ctx.release();
            bpm.delete_page(root_id);
            return self.update_root_page_id(PageId::INVALID);
        }
        Ok(())
    }

    /// Forward scan over the whole key range.
    pub fn iter(&self) -> IndexIterator<'_, K> {
        let leaf = self.find_leaf_read(None);
        IndexIterator::new(self.bpm.as_ref(), leaf, 0)
    }

    /// Forward scan starting at the first key >= `key`.
    pub fn iter_from(&self, key: &K) -> IndexIterator<'_, K> {
        match self.find_leaf_read(Some(key)) {
            Some(leaf) => {
                let offset = LeafPage::<K>::key_index(&leaf[..], key);
                IndexIterator::new(self.bpm.as_ref(), Some(leaf), offset)
            }
            None => IndexIterator::new(self.bpm.as_ref(), None, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_buffer::DiskManager;
    use kestrel_common::DiskManagerConfig;
    use kestrel_txn::{LockManager, TransactionManager};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        bpm: Arc<BufferPoolManager>,
        tm: TransactionManager,
    }

    fn fixture(pool_size: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(DiskManagerConfig {
            path: dir.path().join("index.db"),
            fsync_enabled: false,
        })
        .unwrap();
        Fixture {
            _dir: dir,
            bpm: Arc::new(BufferPoolManager::new(pool_size, Arc::new(disk))),
            tm: TransactionManager::new(Arc::new(LockManager::new())),
        }
    }

    fn rid(k: i64) -> Rid {
        Rid::new(PageId(k as i32), k as u32)
    }

    #[test]
    fn test_empty_tree() {
        let f = fixture(16);
        let tree: BPlusTree<i64> = BPlusTree::new("idx", Arc::clone(&f.bpm)).unwrap();

        assert!(tree.is_empty());
        assert_eq!(tree.get_value(&1), None);
        assert_eq!(tree.iter().count(), 0);
        // Removing from an empty tree is a no-op.
        let txn = f.tm.begin();
        tree.remove(&1, &txn).unwrap();
    }

    #[test]
    fn test_single_leaf_insert_lookup() {
        let f = fixture(16);
        let tree: BPlusTree<i64> = BPlusTree::new("idx", Arc::clone(&f.bpm)).unwrap();
        let txn = f.tm.begin();

        for k in [5i64, 3, 9, 1] {
            assert!(tree.insert(&k, rid(k), &txn).unwrap());
        }
        assert!(!tree.is_empty());
        assert_eq!(tree.get_value(&3), Some(rid(3)));
        assert_eq!(tree.get_value(&4), None);
    }

    #[test]
    fn test_duplicate_insert_returns_false() {
        let f = fixture(16);
        let tree: BPlusTree<i64> = BPlusTree::new("idx", Arc::clone(&f.bpm)).unwrap();
        let txn = f.tm.begin();

        assert!(tree.insert(&7, rid(7), &txn).unwrap());
        assert!(!tree.insert(&7, rid(8), &txn).unwrap());
        assert_eq!(tree.get_value(&7), Some(rid(7)));
    }

    #[test]
    fn test_split_grows_new_root() {
        let f = fixture(16);
        let tree: BPlusTree<i64> =
            BPlusTree::with_max_sizes("idx", Arc::clone(&f.bpm), 4, 4).unwrap();
        let txn = f.tm.begin();

        for k in 1..=4i64 {
            assert!(tree.insert(&k, rid(k), &txn).unwrap());
        }
        let old_root = tree.root_page_id();

        // The fifth insert overflows the lone leaf.
        assert!(tree.insert(&5, rid(5), &txn).unwrap());
        let new_root = tree.root_page_id();
        assert_ne!(old_root, new_root);

        // New root is internal with two children.
        let root = f.bpm.fetch_page_read(new_root).unwrap();
        assert!(!TreePage::is_leaf(&root[..]));
        assert_eq!(TreePage::size(&root[..]), 2);
        let left_id = InternalPage::<i64>::value_at(&root[..], 0);
        let right_id = InternalPage::<i64>::value_at(&root[..], 1);
        drop(root);

        // Leaves carry {1,2} and {3,4,5}, chained in key order.
        let left = f.bpm.fetch_page_read(left_id).unwrap();
        assert_eq!(TreePage::size(&left[..]), 2);
        assert_eq!(TreePage::next_page_id(&left[..]), right_id);
        drop(left);
        let right = f.bpm.fetch_page_read(right_id).unwrap();
        assert_eq!(TreePage::size(&right[..]), 3);
        assert_eq!(LeafPage::<i64>::key_at(&right[..], 0), 3);
        assert!(!TreePage::next_page_id(&right[..]).is_valid());
        drop(right);

        for k in 1..=5i64 {
            assert_eq!(tree.get_value(&k), Some(rid(k)), "key {k}");
        }
    }

    #[test]
    fn test_remove_with_redistribute() {
        let f = fixture(16);
        let tree: BPlusTree<i64> =
            BPlusTree::with_max_sizes("idx", Arc::clone(&f.bpm), 4, 4).unwrap();
        let txn = f.tm.begin();

        // Leaves become {1,2} | {3,4,5,6} with separator 3.
        for k in 1..=6i64 {
            assert!(tree.insert(&k, rid(k), &txn).unwrap());
        }

        // Deleting 1 underflows the left leaf; its right sibling can
        // spare an entry, so 3 moves left and the separator becomes 4.
        tree.remove(&1, &txn).unwrap();

        let root = f.bpm.fetch_page_read(tree.root_page_id()).unwrap();
        assert_eq!(TreePage::size(&root[..]), 2);
        assert_eq!(InternalPage::<i64>::key_at(&root[..], 1), 4);
        let left_id = InternalPage::<i64>::value_at(&root[..], 0);
        drop(root);

        let left = f.bpm.fetch_page_read(left_id).unwrap();
        assert_eq!(TreePage::size(&left[..]), 2);
        assert_eq!(LeafPage::<i64>::key_at(&left[..], 0), 2);
        assert_eq!(LeafPage::<i64>::key_at(&left[..], 1), 3);
        drop(left);

        assert_eq!(tree.get_value(&1), None);
        for k in 2..=6i64 {
            assert_eq!(tree.get_value(&k), Some(rid(k)), "key {k}");
        }
    }

    #[test]
    fn test_remove_with_coalesce_collapses_root() {
        let f = fixture(16);
        let tree: BPlusTree<i64> =
            BPlusTree::with_max_sizes("idx", Arc::clone(&f.bpm), 4, 4).unwrap();
        let txn = f.tm.begin();

        for k in 1..=6i64 {
            assert!(tree.insert(&k, rid(k), &txn).unwrap());
        }
        tree.remove(&1, &txn).unwrap(); // redistributes: {2,3} | {4,5,6}
        tree.remove(&5, &txn).unwrap(); // plain removal: {2,3} | {4,6}
        tree.remove(&2, &txn).unwrap(); // {3} underflows; 3+2 <= 4: merge

        // The merged leaf became the root.
        let root_id = tree.root_page_id();
        let root = f.bpm.fetch_page_read(root_id).unwrap();
        assert!(TreePage::is_leaf(&root[..]));
        assert!(TreePage::is_root(&root[..]));
        assert_eq!(TreePage::size(&root[..]), 3);
        drop(root);

        for k in [3i64, 4, 6] {
            assert_eq!(tree.get_value(&k), Some(rid(k)), "key {k}");
        }
        for k in [1i64, 2, 5] {
            assert_eq!(tree.get_value(&k), None, "key {k}");
        }
    }

    #[test]
    fn test_remove_everything_empties_tree() {
        let f = fixture(16);
        let tree: BPlusTree<i64> =
            BPlusTree::with_max_sizes("idx", Arc::clone(&f.bpm), 4, 4).unwrap();
        let txn = f.tm.begin();

        for k in 1..=10i64 {
            assert!(tree.insert(&k, rid(k), &txn).unwrap());
        }
        for k in 1..=10i64 {
            tree.remove(&k, &txn).unwrap();
        }
        assert!(tree.is_empty());
        assert_eq!(tree.root_page_id(), PageId::INVALID);
        assert_eq!(tree.iter().count(), 0);

        // The tree is usable again after emptying.
        assert!(tree.insert(&42, rid(42), &txn).unwrap());
        assert_eq!(tree.get_value(&42), Some(rid(42)));
    }

    #[test]
    fn test_root_persisted_in_header_page() {
        let f = fixture(16);
        let tree: BPlusTree<i64> = BPlusTree::new("orders_pk", Arc::clone(&f.bpm)).unwrap();
        let txn = f.tm.begin();
        assert!(tree.insert(&1, rid(1), &txn).unwrap());
        let root = tree.root_page_id();

        let header = f.bpm.fetch_page_read(HEADER_PAGE_ID).unwrap();
        assert_eq!(HeaderPage::get_root_id(&header[..], "orders_pk"), Some(root));
        drop(header);

        // A second handle to the same index finds the root.
        let reopened: BPlusTree<i64> = BPlusTree::new("orders_pk", Arc::clone(&f.bpm)).unwrap();
        assert_eq!(reopened.root_page_id(), root);
        assert_eq!(reopened.get_value(&1), Some(rid(1)));
    }

    #[test]
    fn test_multi_level_inserts_and_lookups() {
        let f = fixture(64);
        let tree: BPlusTree<i64> =
            BPlusTree::with_max_sizes("idx", Arc::clone(&f.bpm), 4, 4).unwrap();
        let txn = f.tm.begin();

        // 200 keys with fan-out 4 forces at least three levels.
        for k in 0..200i64 {
            assert!(tree.insert(&k, rid(k), &txn).unwrap(), "insert {k}");
        }
        for k in 0..200i64 {
            assert_eq!(tree.get_value(&k), Some(rid(k)), "lookup {k}");
        }
        let collected: Vec<i64> = tree.iter().map(|(k, _)| k).collect();
        assert_eq!(collected, (0..200).collect::<Vec<i64>>());
    }

    #[test]
    fn test_interleaved_insert_remove_keeps_order() {
        let f = fixture(64);
        let tree: BPlusTree<i64> =
            BPlusTree::with_max_sizes("idx", Arc::clone(&f.bpm), 4, 4).unwrap();
        let txn = f.tm.begin();

        for k in 0..100i64 {
            tree.insert(&k, rid(k), &txn).unwrap();
        }
        for k in (0..100i64).step_by(2) {
            tree.remove(&k, &txn).unwrap();
        }

        let collected: Vec<i64> = tree.iter().map(|(k, _)| k).collect();
        let expected: Vec<i64> = (0..100).filter(|k| k % 2 == 1).collect();
        assert_eq!(collected, expected);

        for k in (0..100i64).step_by(2) {
            assert_eq!(tree.get_value(&k), None);
        }
    }

    #[test]
    fn test_no_pins_leak() {
        let f = fixture(32);
        let tree: BPlusTree<i64> =
            BPlusTree::with_max_sizes("idx", Arc::clone(&f.bpm), 4, 4).unwrap();
        let txn = f.tm.begin();

        for k in 0..50i64 {
            tree.insert(&k, rid(k), &txn).unwrap();
        }
        let _ = tree.iter().count();
        for k in 0..25i64 {
            tree.remove(&k, &txn).unwrap();
        }
        assert_eq!(f.bpm.pinned_frames(), 0);
    }
}
