//! Directory trees stored inside kakera containers.
//!
//! A [`Container`] opens a container file and exposes its root
//! [`VirtualDirectory`]. Directories hold subdirectories and
//! [`VirtualFile`]s; file content lives in block chains managed by
//! `kakera-blocks` and is reached through a [`FileHandle`].
//!
//! Every node carries non-blocking reader/writer locks. Operations that span
//! several nodes gather all of their locks up front and fail with
//! [`VfsError::Locked`] instead of waiting, so under contention a call either
//! completes or changes nothing.
//!
//! # Key Types
//!
//! |------------------------|-----------------------------------------------|
//! | Type                   | Purpose                                       |
//! |------------------------|-----------------------------------------------|
//! | [`Container`]          | Opens a container file, owns the root         |
//! | [`VirtualDirectory`]   | Directory node, lock-down, copy/move/import   |
//! | [`VirtualFile`]        | File node, timestamps, content chain head     |
//! | [`FileHandle`]         | Open content stream plus its content lock     |
//! | [`FileMatches`]        | Lazy search over a subtree                    |
//! | [`MetadataStore`]      | Persists and loads tree snapshots             |
//! | [`ContainerConfig`]    | Block size, OS locks, persist policy          |
//! |------------------------|-----------------------------------------------|
//!
//! # Example
//!
//! ```no_run
//! use kakera_vfs::{AccessMode, Container, VfsNode};
//!
//! # fn main() -> kakera_vfs::VfsResult<()> {
//! let container = Container::open("notes.kkr")?;
//! let docs = container.mkdir("docs")?;
//! let file = docs.touch("todo.txt")?;
//!
//! let mut handle = file.open(AccessMode::ReadWrite)?;
//! handle.write(b"water the plants")?;
//! handle.close()?;
//!
//! assert_eq!(file.path(), "/docs/todo.txt");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod container;
pub mod directory;
pub mod error;
pub mod file;
pub mod handle;
pub mod host;
pub mod iter;
pub mod lock;
pub mod metadata;
pub mod node;

pub use config::ContainerConfig;
pub use container::{Container, StorageContext, ROOT_NAME};
pub use directory::VirtualDirectory;
pub use error::{VfsError, VfsResult};
pub use file::VirtualFile;
pub use handle::FileHandle;
pub use iter::{FileMatches, FilePredicate};
pub use lock::{LockGuard, LockMode, LockSet, NodeLock};
pub use metadata::{
    ChainMetadata, DirectorySnapshot, FileSnapshot, MemoryMetadata, MetadataStore, TreeSnapshot,
};
pub use node::VfsNode;

pub use kakera_blocks::{AccessMode, StoreStats};
