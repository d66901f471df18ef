//! Buffer pool integration: eviction, write-back and pin discipline
//! against a real file.

use kestrel_buffer::{BufferPoolManager, DiskManager};
use kestrel_common::{DiskManagerConfig, PageId, PAGE_SIZE};
use std::sync::Arc;
use tempfile::tempdir;

fn open_pool(dir: &tempfile::TempDir, frames: usize) -> Arc<BufferPoolManager> {
    let disk = DiskManager::new(DiskManagerConfig {
        path: dir.path().join("pool.db"),
        fsync_enabled: false,
    })
    .unwrap();
    Arc::new(BufferPoolManager::new(frames, Arc::new(disk)))
}

#[test]
fn data_survives_eviction_cycles() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir, 8);

    // Create 64 pages, each stamped with its id, through an 8-frame pool.
    let mut ids = Vec::new();
    for i in 0..64u8 {
        let mut guard = pool.new_page_write().unwrap();
        guard[0] = i;
        guard[PAGE_SIZE - 1] = i;
        ids.push(guard.page_id());
    }

    // Read everything back; most pages must come from disk.
    for (i, &page_id) in ids.iter().enumerate() {
        let guard = pool.fetch_page_read(page_id).unwrap();
        assert_eq!(guard[0], i as u8, "{page_id}");
        assert_eq!(guard[PAGE_SIZE - 1], i as u8, "{page_id}");
    }
    assert_eq!(pool.pinned_frames(), 0);
}

#[test]
fn pool_exhaustion_and_recovery() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir, 4);

    let guards: Vec<_> = (0..4).map(|_| pool.new_page_write().unwrap()).collect();
    // Every frame pinned: no page can be brought in.
    assert!(pool.new_page().is_none());
    assert!(pool.fetch_page(PageId(999)).is_none());

    let first = guards[0].page_id();
    drop(guards);
    // With the pins gone the pool serves requests again.
    assert!(pool.fetch_page_read(first).is_some());
    assert_eq!(pool.pinned_frames(), 0);
}

#[test]
fn flush_makes_pages_durable_before_eviction() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("durable.db");

    let page_id;
    {
        let disk = DiskManager::new(DiskManagerConfig {
            path: path.clone(),
            fsync_enabled: false,
        })
        .unwrap();
        let pool = BufferPoolManager::new(4, Arc::new(disk));
        let mut guard = pool.new_page_write().unwrap();
        page_id = guard.page_id();
        guard[100] = 0x5A;
        drop(guard);
        pool.flush_all_pages().unwrap();
    }

    // A fresh pool over the same file sees the flushed bytes.
    let disk = DiskManager::new(DiskManagerConfig {
        path,
        fsync_enabled: false,
    })
    .unwrap();
    let pool = BufferPoolManager::new(4, Arc::new(disk));
    let guard = pool.fetch_page_read(page_id).unwrap();
    assert_eq!(guard[100], 0x5A);
}

#[test]
fn concurrent_fetches_share_and_release_frames() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir, 16);

    let mut ids = Vec::new();
    for i in 0..8u8 {
        let mut guard = pool.new_page_write().unwrap();
        guard[0] = i;
        ids.push(guard.page_id());
    }

    let ids = Arc::new(ids);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = Arc::clone(&pool);
        let ids = Arc::clone(&ids);
        handles.push(std::thread::spawn(move || {
            for round in 0..50 {
                for (i, &page_id) in ids.iter().enumerate() {
                    let guard = pool.fetch_page_read(page_id).unwrap();
                    assert_eq!(guard[0], i as u8, "round {round}");
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(pool.pinned_frames(), 0);
}

#[test]
fn writers_exclude_readers_per_page() {
    let dir = tempdir().unwrap();
    let pool = open_pool(&dir, 4);

    let mut guard = pool.new_page_write().unwrap();
    let page_id = guard.page_id();
    guard[0] = 1;
    guard[1] = 1;
    drop(guard);

    let pool2 = Arc::clone(&pool);
    let writer = std::thread::spawn(move || {
        for _ in 0..1000 {
            let mut guard = pool2.fetch_page_write(page_id).unwrap();
            guard[0] = guard[0].wrapping_add(1);
            guard[1] = guard[0];
        }
    });

    // Under the latch both bytes always agree; a reader observing a torn
    // write would see them diverge.
    for _ in 0..1000 {
        let guard = pool.fetch_page_read(page_id).unwrap();
        assert_eq!(guard[0], guard[1]);
    }
    writer.join().unwrap();
}
