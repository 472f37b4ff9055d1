//! Block store error types.

use std::io;
use thiserror::Error;

/// Block store error type.
#[derive(Debug, Error)]
pub enum BlockError {
    /// The container or a block header does not describe a valid layout.
    #[error("corrupt container at offset {position}: {reason}")]
    Corrupt { position: u64, reason: String },

    /// Negative seek target.
    #[error("invalid offset: {0}")]
    InvalidOffset(i64),

    /// Block size too small to hold a head block's metadata.
    #[error("invalid block size: {0}")]
    InvalidBlockSize(u64),

    /// Write attempted through a read-only stream.
    #[error("stream is read-only")]
    ReadOnly,

    /// I/O error on the container file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BlockError {
    /// Create a Corrupt error.
    pub fn corrupt(position: u64, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            position,
            reason: reason.into(),
        }
    }
}

/// Convert BlockError to std::io::Error so streams can implement `std::io` traits.
impl From<BlockError> for io::Error {
    fn from(e: BlockError) -> Self {
        match e {
            BlockError::Io(e) => e,
            BlockError::InvalidOffset(offset) => io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid offset: {offset}"),
            ),
            BlockError::ReadOnly => {
                io::Error::new(io::ErrorKind::PermissionDenied, "stream is read-only")
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

/// Block store result type.
pub type BlockResult<T> = Result<T, BlockError>;
