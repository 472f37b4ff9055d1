//! VFS error types.

use std::io;

use kakera_blocks::BlockError;
use thiserror::Error;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// A node lock could not be taken without waiting.
    #[error("locked: {0}")]
    Locked(String),

    /// A sibling of the same kind already has this name.
    #[error("name already in use: {0}")]
    NotUnique(String),

    /// Names must not be empty.
    #[error("name must not be empty")]
    EmptyName,

    /// The node was removed.
    #[error("already deleted: {0}")]
    AlreadyDeleted(String),

    /// The node has no parent (the root of a tree).
    #[error("cannot remove or move a root: {0}")]
    Unremovable(String),

    /// Content access on a node not attached to any container.
    #[error("no storage context for {0}")]
    NoStorageContext(String),

    /// Negative stream offset.
    #[error("invalid offset: {0}")]
    InvalidOffset(i64),

    /// The iterator has no further elements.
    #[error("no more elements")]
    NoSuchElement,

    /// The tree changed under an iterator.
    #[error("concurrent modification of {0}")]
    ConcurrentModification(String),

    /// Move or copy target inside the node itself or in another container.
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// Name or path lookup failed.
    #[error("not found: {0}")]
    NotFound(String),

    /// Host path is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Tree snapshot could not be encoded or decoded.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Configuration could not be parsed or is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Search pattern is not a valid regular expression.
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Block store failure.
    #[error(transparent)]
    Block(BlockError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VfsError {
    /// Create a Locked error.
    pub fn locked(what: impl Into<String>) -> Self {
        Self::Locked(what.into())
    }

    /// Create a NotUnique error.
    pub fn not_unique(name: impl Into<String>) -> Self {
        Self::NotUnique(name.into())
    }

    /// Create an AlreadyDeleted error.
    pub fn already_deleted(name: impl Into<String>) -> Self {
        Self::AlreadyDeleted(name.into())
    }

    /// Create an Unremovable error.
    pub fn unremovable(name: impl Into<String>) -> Self {
        Self::Unremovable(name.into())
    }

    /// Create a NoStorageContext error.
    pub fn no_storage_context(name: impl Into<String>) -> Self {
        Self::NoStorageContext(name.into())
    }

    /// Create a ConcurrentModification error.
    pub fn concurrent_modification(name: impl Into<String>) -> Self {
        Self::ConcurrentModification(name.into())
    }

    /// Create an InvalidDestination error.
    pub fn invalid_destination(reason: impl Into<String>) -> Self {
        Self::InvalidDestination(reason.into())
    }

    /// Create a NotFound error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create a Metadata error.
    pub fn metadata(reason: impl Into<String>) -> Self {
        Self::Metadata(reason.into())
    }

    /// Create a Config error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Whether the operation may succeed if simply tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VfsError::Locked(_))
    }
}

impl From<BlockError> for VfsError {
    fn from(e: BlockError) -> Self {
        match e {
            BlockError::InvalidOffset(offset) => VfsError::InvalidOffset(offset),
            BlockError::Io(e) => VfsError::Io(e),
            other => VfsError::Block(other),
        }
    }
}

/// Convert VfsError to std::io::Error so file handles can implement `std::io` traits.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        let kind = match &e {
            VfsError::Locked(_) => io::ErrorKind::WouldBlock,
            VfsError::NotUnique(_) => io::ErrorKind::AlreadyExists,
            VfsError::NotFound(_) => io::ErrorKind::NotFound,
            VfsError::InvalidOffset(_) | VfsError::EmptyName | VfsError::InvalidPattern(_) => {
                io::ErrorKind::InvalidInput
            }
            _ => io::ErrorKind::Other,
        };
        match e {
            VfsError::Io(e) => e,
            VfsError::Block(e) => e.into(),
            other => io::Error::new(kind, other.to_string()),
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;
