//! Buffer management for KestrelDB.
//!
//! This crate provides:
//! - Disk manager for page-granular I/O against the single database file
//! - Extendible hash table used for the page table and inside the replacer
//! - LRU replacer tracking unpinned frames
//! - Buffer pool manager with pin counting and RAII page guards

pub mod disk;
pub mod extendible;
pub mod frame;
pub mod lru;
pub mod pool;

pub use disk::DiskManager;
pub use extendible::ExtendibleHashTable;
pub use frame::{Frame, FrameId};
pub use lru::LruReplacer;
pub use pool::{BufferPoolManager, PageReadGuard, PageWriteGuard};
