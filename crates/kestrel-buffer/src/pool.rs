//! Buffer pool manager.

use crate::disk::DiskManager;
use crate::extendible::ExtendibleHashTable;
use crate::frame::{Frame, FrameId};
use crate::lru::LruReplacer;
use kestrel_common::{BufferPoolConfig, PageId, Result, PAGE_SIZE};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// Bookkeeping state guarded by the pool mutex.
struct PoolInner {
    /// Page id -> frame index for resident pages.
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// Unpinned frames in least-recently-unpinned order.
    replacer: LruReplacer<FrameId>,
    /// Frames that never held a page or were freed by delete_page.
    free_list: Vec<FrameId>,
}

/// Owns a fixed array of frames and mediates every page access through
/// pin/unpin.
///
/// A single mutex guards the page table, replacer and free list; page I/O
/// on a miss happens while it is held. Invariants: every resident page
/// maps to exactly one frame, and a frame is in exactly one of
/// {free list, replacer, in use with pin count > 0}.
pub struct BufferPoolManager {
    frames: Vec<Frame>,
    disk: Arc<DiskManager>,
    inner: Mutex<PoolInner>,
}

impl BufferPoolManager {
    /// Creates a pool of `pool_size` frames over the given disk manager.
    pub fn new(pool_size: usize, disk: Arc<DiskManager>) -> Self {
        Self::with_config(BufferPoolConfig::with_pool_size(pool_size), disk)
    }

    /// Creates a pool from an explicit configuration.
    pub fn with_config(config: BufferPoolConfig, disk: Arc<DiskManager>) -> Self {
        let frames: Vec<_> = (0..config.pool_size).map(|_| Frame::new()).collect();
        let free_list: Vec<_> = (0..config.pool_size).rev().map(FrameId).collect();

        Self {
            frames,
            disk,
            inner: Mutex::new(PoolInner {
                page_table: ExtendibleHashTable::new(config.bucket_size),
                replacer: LruReplacer::new(),
                free_list,
            }),
        }
    }

    /// Number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    /// The disk manager backing this pool.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Returns true if `page_id` is resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.inner.lock().page_table.find(&page_id).is_some()
    }

    /// Number of frames on the free list.
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Number of unpinned frames tracked by the replacer.
    pub fn replacer_len(&self) -> usize {
        self.inner.lock().replacer.len()
    }

    /// Number of frames currently pinned.
    pub fn pinned_frames(&self) -> usize {
        self.frames.iter().filter(|f| f.is_pinned()).count()
    }

    /// Pin count of a resident page, if any. For tests and invariants.
    pub fn pin_count_of(&self, page_id: PageId) -> Option<u32> {
        let inner = self.inner.lock();
        let fid = inner.page_table.find(&page_id)?;
        Some(self.frames[fid.0].pin_count())
    }

    /// Picks a victim frame: free list first, then the replacer.
    fn obtain_victim(&self, inner: &mut PoolInner) -> Option<FrameId> {
        if let Some(fid) = inner.free_list.pop() {
            return Some(fid);
        }
        inner.replacer.victim()
    }

    /// Evicts the current occupant of `fid`, writing it back if dirty.
    fn evict_occupant(&self, inner: &mut PoolInner, fid: FrameId) -> Result<()> {
        let frame = &self.frames[fid.0];
        let old_page_id = frame.page_id();
        if !old_page_id.is_valid() {
            return Ok(());
        }
        if frame.is_dirty() {
            log::debug!("evicting dirty {old_page_id} from {fid}");
            let data = frame.data_read();
            self.disk.write_page(old_page_id, &data)?;
            frame.set_dirty(false);
        }
        inner.page_table.remove(&old_page_id);
        Ok(())
    }

    /// Fetches `page_id` into the pool, pinning its frame.
    ///
    /// Returns None when the page is not resident and every frame is
    /// pinned, or when disk I/O fails (logged).
    pub fn fetch_page(&self, page_id: PageId) -> Option<&Frame> {
        let mut inner = self.inner.lock();

        if let Some(fid) = inner.page_table.find(&page_id) {
            let frame = &self.frames[fid.0];
            frame.pin();
            // A pinned page must not sit in the replacer.
            inner.replacer.erase(&fid);
            return Some(frame);
        }

        let fid = self.obtain_victim(&mut inner)?;
        if let Err(e) = self.evict_occupant(&mut inner, fid) {
            log::warn!("write-back of victim {fid} failed: {e}");
            inner.free_list.push(fid);
            return None;
        }

        let frame = &self.frames[fid.0];
        frame.reset_for(page_id);
        inner.page_table.insert(page_id, fid);

        {
            let mut data = frame.data_write();
            if let Err(e) = self.disk.read_page(page_id, &mut data) {
                log::warn!("read of {page_id} failed: {e}");
                inner.page_table.remove(&page_id);
                frame.clear();
                inner.free_list.push(fid);
                return None;
            }
        }
        Some(frame)
    }

    /// Allocates a fresh page id, installing it in a zeroed pinned frame.
    ///
    /// Returns None when all frames are pinned.
    pub fn new_page(&self) -> Option<(PageId, &Frame)> {
        let mut inner = self.inner.lock();

        let fid = self.obtain_victim(&mut inner)?;
        if let Err(e) = self.evict_occupant(&mut inner, fid) {
            log::warn!("write-back of victim {fid} failed: {e}");
            inner.free_list.push(fid);
            return None;
        }

        let page_id = self.disk.allocate_page();
        let frame = &self.frames[fid.0];
        frame.reset_for(page_id);
        frame.data_write().fill(0);
        inner.page_table.insert(page_id, fid);
        Some((page_id, frame))
    }

    /// Drops one borrow of `page_id`, ORing `is_dirty` into its frame.
    ///
    /// When the pin count reaches zero the frame is handed to the
    /// replacer. Returns false for an unknown page or one whose pin count
    /// is already zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock();

        let Some(fid) = inner.page_table.find(&page_id) else {
            return false;
        };
        let frame = &self.frames[fid.0];
        if frame.pin_count() == 0 {
            return false;
        }
        if is_dirty {
            frame.set_dirty(true);
        }
        frame.unpin();
        if frame.pin_count() == 0 {
            inner.replacer.insert(fid);
        }
        true
    }

    /// Writes one resident page through to disk. Returns Ok(false) when
    /// the page is not resident.
    ///
    /// The frame is pinned for the duration of the write so it cannot be
    /// evicted, and its latch is taken outside the pool mutex so a
    /// writer holding the latch while requesting a page never deadlocks
    /// against the flusher.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let frame = {
            let inner = self.inner.lock();
            let Some(fid) = inner.page_table.find(&page_id) else {
                return Ok(false);
            };
            let frame = &self.frames[fid.0];
            frame.pin();
            inner.replacer.erase(&fid);
            frame
        };

        let result = {
            let data = frame.data_read();
            self.disk.write_page(page_id, &data)
        };
        if result.is_ok() {
            frame.set_dirty(false);
        }
        self.unpin_page(page_id, false);
        result.map(|_| true)
    }

    /// Flushes every dirty resident page.
    pub fn flush_all_pages(&self) -> Result<()> {
        for frame in &self.frames {
            let page_id = frame.page_id();
            if page_id.is_valid() && frame.is_dirty() {
                // The page may have been evicted (and thus written back)
                // in the meantime; flush_page rechecks residency.
                self.flush_page(page_id)?;
            }
        }
        Ok(())
    }

    /// Drops `page_id` from the pool and asks the disk manager to
    /// deallocate it. Returns false only when the page is resident and
    /// still pinned.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut inner = self.inner.lock();

        if let Some(fid) = inner.page_table.find(&page_id) {
            let frame = &self.frames[fid.0];
            if frame.is_pinned() {
                return false;
            }
            inner.page_table.remove(&page_id);
            inner.replacer.erase(&fid);
            frame.clear();
            inner.free_list.push(fid);
        }
        self.disk.deallocate_page(page_id);
        true
    }

    /// Fetches `page_id` and takes its latch shared. The guard unpins on
    /// drop.
    pub fn fetch_page_read(&self, page_id: PageId) -> Option<PageReadGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        let data = frame.data_read();
        Some(PageReadGuard {
            pool: self,
            page_id,
            data: Some(data),
        })
    }

    /// Fetches `page_id` and takes its latch exclusive. The guard unpins
    /// on drop, marking the page dirty if it was mutably accessed.
    pub fn fetch_page_write(&self, page_id: PageId) -> Option<PageWriteGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        let data = frame.data_write();
        Some(PageWriteGuard {
            pool: self,
            page_id,
            data: Some(data),
            dirty: false,
        })
    }

    /// Allocates a fresh page and takes its latch exclusive.
    pub fn new_page_write(&self) -> Option<PageWriteGuard<'_>> {
        let (page_id, frame) = self.new_page()?;
        let data = frame.data_write();
        Some(PageWriteGuard {
            pool: self,
            page_id,
            data: Some(data),
            // A brand new page must reach disk even if never touched again.
            dirty: true,
        })
    }
}

impl Drop for BufferPoolManager {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all_pages() {
            log::warn!("flush on buffer pool drop failed: {e}");
        }
    }
}

/// RAII shared borrow of one page: holds the frame latch shared and one
/// pin; releases both on drop (latch first, then the pin).
pub struct PageReadGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    /// Always Some until drop.
    data: Option<RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>>,
}

impl<'a> PageReadGuard<'a> {
    /// The page this guard borrows.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl<'a> std::ops::Deref for PageReadGuard<'a> {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        self.data.as_ref().expect("latch held until drop")
    }
}

impl<'a> Drop for PageReadGuard<'a> {
    fn drop(&mut self) {
        // Release the latch before taking the pool mutex in unpin_page,
        // so a flusher holding the mutex and waiting on the latch cannot
        // deadlock with us.
        self.data = None;
        self.pool.unpin_page(self.page_id, false);
    }
}

/// RAII exclusive borrow of one page: holds the frame latch exclusive and
/// one pin; unpins on drop with the dirty flag observed through
/// `deref_mut`.
pub struct PageWriteGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    /// Always Some until drop.
    data: Option<RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>>,
    dirty: bool,
}

impl<'a> PageWriteGuard<'a> {
    /// The page this guard borrows.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Marks the page dirty without mutating it.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl<'a> std::ops::Deref for PageWriteGuard<'a> {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        self.data.as_ref().expect("latch held until drop")
    }
}

impl<'a> std::ops::DerefMut for PageWriteGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.dirty = true;
        self.data.as_mut().expect("latch held until drop")
    }
}

impl<'a> Drop for PageWriteGuard<'a> {
    fn drop(&mut self) {
        let dirty = self.dirty;
        self.data = None;
        self.pool.unpin_page(self.page_id, dirty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::DiskManagerConfig;
    use tempfile::tempdir;

    fn create_test_pool(pool_size: usize) -> (BufferPoolManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(DiskManagerConfig {
            path: dir.path().join("pool.db"),
            fsync_enabled: false,
        })
        .unwrap();
        (BufferPoolManager::new(pool_size, Arc::new(disk)), dir)
    }

    #[test]
    fn test_new_page_pins_frame() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();
        assert_eq!(page_id, PageId(0));
        assert_eq!(frame.pin_count(), 1);
        assert_eq!(pool.free_frames(), 9);
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_fetch_missing_page_reads_blank() {
        let (pool, _dir) = create_test_pool(10);

        // Not yet written: the disk manager serves a blank page.
        let frame = pool.fetch_page(PageId(0)).unwrap();
        assert!(frame.data_read().iter().all(|&b| b == 0));
        assert!(pool.unpin_page(PageId(0), false));
    }

    #[test]
    fn test_unpin_excess_fails_cleanly() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();
        assert!(pool.unpin_page(page_id, false));
        assert!(!pool.unpin_page(page_id, false));
        assert!(!pool.unpin_page(page_id, false));
        assert_eq!(pool.pin_count_of(page_id), Some(0));
    }

    #[test]
    fn test_unpin_unknown_page_fails() {
        let (pool, _dir) = create_test_pool(10);
        assert!(!pool.unpin_page(PageId(123), false));
    }

    #[test]
    fn test_dirty_flag_is_sticky() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();
        frame.pin();
        assert!(pool.unpin_page(page_id, true));
        // Second unpin with is_dirty=false must not clear the flag.
        assert!(pool.unpin_page(page_id, false));
        let frame = pool.fetch_page(page_id).unwrap();
        assert!(frame.is_dirty());
        pool.unpin_page(page_id, false);
    }

    #[test]
    fn test_eviction_writes_back_dirty_page() {
        let (pool, _dir) = create_test_pool(1);

        let (p0, frame) = pool.new_page().unwrap();
        frame.data_write()[0] = 0xAB;
        assert!(pool.unpin_page(p0, true));

        // Evicts p0 to make room.
        let (p1, _) = pool.new_page().unwrap();
        assert!(!pool.contains(p0));
        assert!(pool.unpin_page(p1, false));

        // Re-fetch from disk; the write-back must have happened.
        let frame = pool.fetch_page(p0).unwrap();
        assert_eq!(frame.data_read()[0], 0xAB);
        pool.unpin_page(p0, false);
    }

    #[test]
    fn test_all_pinned_exhausts_pool() {
        let (pool, _dir) = create_test_pool(2);

        pool.new_page().unwrap();
        pool.new_page().unwrap();
        assert!(pool.new_page().is_none());
        assert!(pool.fetch_page(PageId(99)).is_none());
    }

    #[test]
    fn test_lru_eviction_order() {
        let (pool, _dir) = create_test_pool(3);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let (pid, _) = pool.new_page().unwrap();
            ids.push(pid);
        }
        // Unpin in order 0, 1, 2 -> eviction order 0, 1, 2.
        for &pid in &ids {
            assert!(pool.unpin_page(pid, false));
        }

        let (_, _) = pool.new_page().unwrap(); // evicts ids[0]
        assert!(!pool.contains(ids[0]));
        assert!(pool.contains(ids[1]));
        assert!(pool.contains(ids[2]));
    }

    #[test]
    fn test_fetch_hit_removes_from_replacer() {
        let (pool, _dir) = create_test_pool(3);

        let (p0, _) = pool.new_page().unwrap();
        pool.unpin_page(p0, false);
        assert_eq!(pool.replacer_len(), 1);

        let _ = pool.fetch_page(p0).unwrap();
        assert_eq!(pool.replacer_len(), 0);
        pool.unpin_page(p0, false);
    }

    #[test]
    fn test_delete_page() {
        let (pool, _dir) = create_test_pool(10);

        let (p0, _) = pool.new_page().unwrap();
        // Pinned: cannot delete.
        assert!(!pool.delete_page(p0));

        pool.unpin_page(p0, false);
        assert!(pool.delete_page(p0));
        assert!(!pool.contains(p0));
        assert_eq!(pool.free_frames(), 10);

        // Deleting a non-resident page succeeds.
        assert!(pool.delete_page(PageId(77)));
    }

    #[test]
    fn test_flush_page() {
        let (pool, _dir) = create_test_pool(10);

        let (p0, frame) = pool.new_page().unwrap();
        frame.data_write()[10] = 0x42;
        pool.unpin_page(p0, true);

        assert!(pool.flush_page(p0).unwrap());
        assert!(!pool.flush_page(PageId(55)).unwrap());

        let mut out = [0u8; PAGE_SIZE];
        pool.disk_manager().read_page(p0, &mut out).unwrap();
        assert_eq!(out[10], 0x42);
    }

    #[test]
    fn test_read_guard_unpins_on_drop() {
        let (pool, _dir) = create_test_pool(10);

        let (p0, _) = pool.new_page().unwrap();
        pool.unpin_page(p0, false);

        {
            let guard = pool.fetch_page_read(p0).unwrap();
            assert_eq!(guard.page_id(), p0);
            assert_eq!(pool.pin_count_of(p0), Some(1));
        }
        assert_eq!(pool.pin_count_of(p0), Some(0));
    }

    #[test]
    fn test_write_guard_marks_dirty_on_mutation() {
        let (pool, _dir) = create_test_pool(10);

        let (p0, _) = pool.new_page().unwrap();
        pool.unpin_page(p0, false);
        // Flush so the clean/dirty distinction is observable.
        pool.flush_page(p0).unwrap();

        {
            let mut guard = pool.fetch_page_write(p0).unwrap();
            guard[0] = 7;
        }
        let frame = pool.fetch_page(p0).unwrap();
        assert!(frame.is_dirty());
        assert_eq!(frame.data_read()[0], 7);
        pool.unpin_page(p0, false);
    }

    #[test]
    fn test_page_table_maps_resident_pages() {
        let (pool, _dir) = create_test_pool(8);

        let mut ids = Vec::new();
        for _ in 0..8 {
            let (pid, _) = pool.new_page().unwrap();
            ids.push(pid);
        }
        for &pid in &ids {
            assert_eq!(pool.pin_count_of(pid), Some(1));
            pool.unpin_page(pid, false);
        }
        for &pid in &ids {
            assert!(pool.contains(pid));
        }
    }
}
