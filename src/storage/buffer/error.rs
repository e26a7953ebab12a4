use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::disk::DiskManagerError;

/// Error type for buffer pool operations
#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("Disk error: {0}")]
    DiskError(#[from] DiskManagerError),

    #[error("Page {0} is not in the buffer pool")]
    PageNotFound(PageId),

    #[error("Buffer pool is full: all frames are pinned")]
    BufferPoolFull,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for buffer pool operations
pub type Result<T> = std::result::Result<T, BufferPoolError>;
