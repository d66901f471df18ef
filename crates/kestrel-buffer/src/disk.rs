//! Disk manager for page-level I/O against the database file.

use kestrel_common::{DiskManagerConfig, KestrelError, PageId, Result, PAGE_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

/// Manages reading and writing fixed-size pages in a single backing file.
///
/// A page with id `n` lives at byte offset `n * PAGE_SIZE`. Page ids are
/// handed out by a monotonically increasing counter that resumes from the
/// current file length when an existing file is reopened; deallocated ids
/// are not reused.
pub struct DiskManager {
    /// The open database file.
    file: Mutex<File>,
    /// Next page id to hand out.
    next_page_id: AtomicI32,
    /// Call fsync after writes.
    fsync_enabled: bool,
}

impl DiskManager {
    /// Opens or creates the database file named by the configuration.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path)?;

        let file_size = file.metadata()?.len();
        let next_page_id = (file_size / PAGE_SIZE as u64) as i32;

        Ok(Self {
            file: Mutex::new(file),
            next_page_id: AtomicI32::new(next_page_id),
            fsync_enabled: config.fsync_enabled,
        })
    }

    /// Opens or creates the database file at `path` with durability enabled.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(DiskManagerConfig::new(path.as_ref()))
    }

    /// Writes one page at `id * PAGE_SIZE` and flushes.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        if !page_id.is_valid() {
            return Err(KestrelError::Internal(format!(
                "write to invalid page id {page_id}"
            )));
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_id.file_offset(PAGE_SIZE)))?;
        file.write_all(data)?;
        file.flush()?;
        if self.fsync_enabled {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Reads one page at `id * PAGE_SIZE` into `out`.
    ///
    /// If the file ends before a full page is available the remainder is
    /// zero-filled; reading wholly past the end of the file yields a blank
    /// page. Neither case is an error.
    pub fn read_page(&self, page_id: PageId, out: &mut [u8; PAGE_SIZE]) -> Result<()> {
        if !page_id.is_valid() {
            return Err(KestrelError::Internal(format!(
                "read of invalid page id {page_id}"
            )));
        }

        let mut file = self.file.lock();
        let file_size = file.metadata()?.len();
        let offset = page_id.file_offset(PAGE_SIZE);

        if offset >= file_size {
            out.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = file.read(&mut out[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        if read < PAGE_SIZE {
            log::debug!("short read of {page_id}: {read} bytes, zero-filling remainder");
            out[read..].fill(0);
        }
        Ok(())
    }

    /// Returns a fresh page id. Ids increase monotonically from 0.
    pub fn allocate_page(&self) -> PageId {
        PageId(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Placeholder for page reclamation. Deallocated ids are not reused.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Number of pages allocated so far.
    pub fn num_pages(&self) -> i32 {
        self.next_page_id.load(Ordering::SeqCst)
    }

    /// Flushes pending writes to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            path: dir.path().join("test.db"),
            fsync_enabled: false,
        };
        let dm = DiskManager::new(config).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_allocate_page_monotonic() {
        let (dm, _dir) = create_test_disk_manager();

        assert_eq!(dm.allocate_page(), PageId(0));
        assert_eq!(dm.allocate_page(), PageId(1));
        assert_eq!(dm.allocate_page(), PageId(2));
        assert_eq!(dm.num_pages(), 3);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (dm, _dir) = create_test_disk_manager();
        let page_id = dm.allocate_page();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[100] = 0xCD;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(page_id, &data).unwrap();

        let mut out = [0xFFu8; PAGE_SIZE];
        dm.read_page(page_id, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[100], 0xCD);
        assert_eq!(out[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_read_past_end_yields_blank_page() {
        let (dm, _dir) = create_test_disk_manager();

        let mut out = [0xFFu8; PAGE_SIZE];
        dm.read_page(PageId(99), &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_short_file_zero_fills() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.db");
        std::fs::write(&path, [0xAAu8; 100]).unwrap();

        let dm = DiskManager::new(DiskManagerConfig {
            path,
            fsync_enabled: false,
        })
        .unwrap();

        let mut out = [0xFFu8; PAGE_SIZE];
        dm.read_page(PageId(0), &mut out).unwrap();
        assert_eq!(out[0], 0xAA);
        assert_eq!(out[99], 0xAA);
        assert!(out[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_invalid_page_id_rejected() {
        let (dm, _dir) = create_test_disk_manager();
        let mut out = [0u8; PAGE_SIZE];

        assert!(dm.read_page(PageId::INVALID, &mut out).is_err());
        assert!(dm.write_page(PageId::INVALID, &out).is_err());
    }

    #[test]
    fn test_reopen_resumes_allocation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume.db");

        {
            let dm = DiskManager::new(DiskManagerConfig {
                path: path.clone(),
                fsync_enabled: true,
            })
            .unwrap();
            let p0 = dm.allocate_page();
            let p1 = dm.allocate_page();
            dm.write_page(p0, &[1u8; PAGE_SIZE]).unwrap();
            dm.write_page(p1, &[2u8; PAGE_SIZE]).unwrap();
        }

        let dm = DiskManager::new(DiskManagerConfig {
            path,
            fsync_enabled: true,
        })
        .unwrap();
        assert_eq!(dm.num_pages(), 2);
        assert_eq!(dm.allocate_page(), PageId(2));

        let mut out = [0u8; PAGE_SIZE];
        dm.read_page(PageId(1), &mut out).unwrap();
        assert_eq!(out[0], 2);
    }

    #[test]
    fn test_deallocate_is_noop() {
        let (dm, _dir) = create_test_disk_manager();
        let p0 = dm.allocate_page();
        dm.deallocate_page(p0);
        // Ids are never reused.
        assert_eq!(dm.allocate_page(), PageId(1));
    }

    #[test]
    fn test_overwrite_page() {
        let (dm, _dir) = create_test_disk_manager();
        let page_id = dm.allocate_page();

        dm.write_page(page_id, &[0xAAu8; PAGE_SIZE]).unwrap();
        dm.write_page(page_id, &[0xBBu8; PAGE_SIZE]).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut out).unwrap();
        assert_eq!(out[0], 0xBB);
    }
}
