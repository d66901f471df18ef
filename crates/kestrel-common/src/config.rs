//! Engine configuration and compile-time constants.

use crate::ids::PageId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Size of a database page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Page id of the header page, which maps index names to root page ids.
pub const HEADER_PAGE_ID: PageId = PageId(0);

/// Default capacity of an extendible hash bucket.
pub const BUCKET_SIZE: usize = 50;

/// Configuration for the disk manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskManagerConfig {
    /// Path of the single backing database file.
    pub path: PathBuf,
    /// Call fsync after every page write.
    pub fsync_enabled: bool,
}

impl DiskManagerConfig {
    /// Configuration for the given file path with durability enabled.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fsync_enabled: true,
        }
    }
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self::new("./kestrel.db")
    }
}

/// Configuration for the buffer pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub pool_size: usize,
    /// Capacity of the page-table hash buckets.
    pub bucket_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1024,
            bucket_size: BUCKET_SIZE,
        }
    }
}

impl BufferPoolConfig {
    /// Configuration with an explicit frame count.
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Default::default()
        }
    }

    /// Total buffer pool size in bytes.
    pub fn pool_size_bytes(&self) -> usize {
        self.pool_size * PAGE_SIZE
    }
}
