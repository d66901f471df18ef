//! Common definitions for KestrelDB.
//!
//! This crate provides:
//! - Engine-wide constants (page size, header page id, hash bucket size)
//! - Identifier types (page ids, record ids, transaction ids)
//! - Configuration structures
//! - The shared error type

pub mod config;
pub mod error;
pub mod ids;

pub use config::{BufferPoolConfig, DiskManagerConfig, BUCKET_SIZE, HEADER_PAGE_ID, PAGE_SIZE};
pub use error::{KestrelError, Result};
pub use ids::{PageId, Rid, TxnId};
