//! Buffer frame management.

use kestrel_common::{PageId, PAGE_SIZE};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

/// Index of a frame within the buffer pool's frame array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub usize);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A frame in the buffer pool holding a single page.
///
/// The `RwLock` around the page bytes doubles as the per-page
/// reader/writer latch: B+tree searches hold it shared, structure
/// modifications hold it exclusive. Pin counting is independent of the
/// latch; a frame with pin count zero has no outstanding borrowers and is
/// eligible for eviction.
pub struct Frame {
    /// Page currently held by this frame (INVALID when empty).
    page_id: AtomicI32,
    /// Page data, guarded by the frame latch.
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
    /// Number of live borrows of this frame.
    pin_count: AtomicU32,
    /// Whether the page diverged from its on-disk copy.
    is_dirty: AtomicBool,
}

impl Frame {
    /// Creates a new empty frame.
    pub fn new() -> Self {
        Self {
            page_id: AtomicI32::new(PageId::INVALID.0),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// The page held by this frame, if any.
    #[inline]
    pub fn page_id(&self) -> PageId {
        PageId(self.page_id.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.0, Ordering::Release);
    }

    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count.
    #[inline]
    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the pin count. Must not be called at zero; the buffer
    /// pool checks before decrementing.
    #[inline]
    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of frame with pin count 0");
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Acquires the frame latch shared.
    #[inline]
    pub fn data_read(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.read()
    }

    /// Acquires the frame latch exclusive.
    #[inline]
    pub fn data_write(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.write()
    }

    /// Resets metadata for loading `page_id`: pin count 1, clean.
    pub fn reset_for(&self, page_id: PageId) {
        self.set_page_id(page_id);
        self.pin_count.store(1, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
    }

    /// Clears the frame back to the empty state, zeroing its bytes.
    pub fn clear(&self) {
        self.set_page_id(PageId::INVALID);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.data.write().fill(0);
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .finish()
    }
}
