//! Error types for KestrelDB.

use thiserror::Error;

/// Result type alias using KestrelError.
pub type Result<T> = std::result::Result<T, KestrelError>;

/// Errors that can occur in KestrelDB storage operations.
#[derive(Debug, Error)]
pub enum KestrelError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Buffer pool errors
    #[error("buffer pool full, all frames pinned")]
    BufferPoolFull,

    // Header page errors
    #[error("index name too long: {0}")]
    IndexNameTooLong(String),

    #[error("index already registered: {0}")]
    IndexAlreadyExists(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("header page full")]
    HeaderPageFull,

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}
