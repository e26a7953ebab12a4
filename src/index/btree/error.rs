use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::buffer::BufferPoolError;

/// Error type for B+ tree operations
#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Page {0} does not hold a valid tree node")]
    InvalidPageFormat(PageId),

    #[error("Tree integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),
}

/// Result type for B+ tree operations
pub type Result<T> = std::result::Result<T, BTreeError>;
