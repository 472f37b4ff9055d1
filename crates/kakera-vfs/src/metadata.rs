//! Tree metadata snapshots and where they are kept.
//!
//! The block layer only knows chains. Names, hierarchy and timestamps live in
//! a [`TreeSnapshot`] that a [`MetadataStore`] persists after mutations and
//! hands back when a container is opened. The default store,
//! [`ChainMetadata`], keeps the snapshot as a `postcard` blob in the chain
//! whose head is the container's first block.

use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use kakera_blocks::layout::FIRST_BLOCK;
use kakera_blocks::{AccessMode, BlockStore, VirtualStream, NO_BLOCK};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::container::StorageContext;
use crate::directory::VirtualDirectory;
use crate::error::{VfsError, VfsResult};
use crate::file::VirtualFile;
use crate::node::VfsNode;

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// The whole tree at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub version: u32,
    pub root: DirectorySnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub name: String,
    pub directories: Vec<DirectorySnapshot>,
    pub files: Vec<FileSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub name: String,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
    /// Head of the content chain, `-1` when empty.
    pub head: i64,
}

impl TreeSnapshot {
    /// Capture a tree. The caller holds a read lock-down on `root`.
    pub fn capture(root: &VirtualDirectory) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            root: DirectorySnapshot::capture(root),
        }
    }

    pub fn to_bytes(&self) -> VfsResult<Vec<u8>> {
        postcard::to_stdvec(self).map_err(|e| VfsError::metadata(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> VfsResult<Self> {
        let snapshot: TreeSnapshot =
            postcard::from_bytes(bytes).map_err(|e| VfsError::metadata(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(VfsError::metadata(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    /// Rebuild the tree as a container root attached to `storage`.
    pub(crate) fn restore(&self, storage: Arc<StorageContext>) -> VfsResult<VirtualDirectory> {
        let root = VirtualDirectory::new_root(&self.root.name, storage)?;
        self.root.restore_children(&root)?;
        Ok(root)
    }
}

impl DirectorySnapshot {
    fn capture(dir: &VirtualDirectory) -> Self {
        Self {
            name: dir.name(),
            directories: dir
                .directories_unlocked()
                .iter()
                .map(DirectorySnapshot::capture)
                .collect(),
            files: dir
                .files_unlocked()
                .iter()
                .map(FileSnapshot::capture)
                .collect(),
        }
    }

    fn restore_children(&self, dir: &VirtualDirectory) -> VfsResult<()> {
        for child in &self.directories {
            let restored = VirtualDirectory::child_of(&child.name, dir.node())?;
            child.restore_children(&restored)?;
            dir.attach_dir(restored);
        }
        for file in &self.files {
            dir.attach_file(VirtualFile::create(
                &file.name,
                dir.node(),
                file.created_at,
                file.modified_at,
                file.head,
            )?);
        }
        Ok(())
    }

    /// Number of files in this subtree.
    pub fn file_count(&self) -> usize {
        self.files.len() + self.directories.iter().map(Self::file_count).sum::<usize>()
    }
}

impl FileSnapshot {
    fn capture(file: &VirtualFile) -> Self {
        Self {
            name: file.name(),
            created_at: file.created_at(),
            modified_at: file.modified_at(),
            head: file.head_block_position(),
        }
    }
}

/// Persists and loads tree snapshots for a container.
pub trait MetadataStore: Send + Sync + fmt::Debug {
    /// Store `snapshot`, replacing whatever was stored before.
    fn persist(&self, snapshot: &TreeSnapshot) -> VfsResult<()>;

    /// The last stored snapshot, `None` for a fresh container.
    fn load(&self) -> VfsResult<Option<TreeSnapshot>>;
}

/// Keeps the snapshot in the chain that starts at the container's first block.
#[derive(Debug)]
pub struct ChainMetadata {
    store: Arc<BlockStore>,
    initialised: AtomicBool,
}

impl ChainMetadata {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self {
            store,
            initialised: AtomicBool::new(false),
        }
    }
}

impl MetadataStore for ChainMetadata {
    fn persist(&self, snapshot: &TreeSnapshot) -> VfsResult<()> {
        let bytes = snapshot.to_bytes()?;
        let head = if self.initialised.load(Ordering::Acquire) {
            FIRST_BLOCK as i64
        } else {
            NO_BLOCK
        };

        let mut stream = VirtualStream::open(self.store.clone(), head, AccessMode::ReadWrite)?;
        stream.write_all(&bytes)?;
        stream.set_length(bytes.len() as u64)?;
        let summary = stream.close()?;
        if summary.head != FIRST_BLOCK as i64 {
            return Err(VfsError::metadata(format!(
                "metadata chain starts at {} instead of the first block",
                summary.head
            )));
        }
        self.initialised.store(true, Ordering::Release);

        debug!("persisted {} byte tree snapshot", bytes.len());
        Ok(())
    }

    fn load(&self) -> VfsResult<Option<TreeSnapshot>> {
        if self.store.file_len()? <= FIRST_BLOCK {
            return Ok(None);
        }

        let mut stream =
            VirtualStream::open(self.store.clone(), FIRST_BLOCK as i64, AccessMode::ReadOnly)?;
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes)?;
        let snapshot = TreeSnapshot::from_bytes(&bytes)?;
        self.initialised.store(true, Ordering::Release);
        Ok(Some(snapshot))
    }
}

/// Keeps the snapshot in memory. Useful for tests and throwaway containers.
#[derive(Debug, Default)]
pub struct MemoryMetadata {
    snapshot: Mutex<Option<TreeSnapshot>>,
    persists: Mutex<usize>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot.
    pub fn with_snapshot(snapshot: TreeSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            persists: Mutex::new(0),
        }
    }

    /// Last persisted snapshot.
    pub fn snapshot(&self) -> Option<TreeSnapshot> {
        self.snapshot.lock().clone()
    }

    /// How many times `persist` ran.
    pub fn persist_count(&self) -> usize {
        *self.persists.lock()
    }
}

impl MetadataStore for MemoryMetadata {
    fn persist(&self, snapshot: &TreeSnapshot) -> VfsResult<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        *self.persists.lock() += 1;
        Ok(())
    }

    fn load(&self) -> VfsResult<Option<TreeSnapshot>> {
        Ok(self.snapshot.lock().clone())
    }
}

/// Shared collaborators can be handed to several containers.
impl<T: MetadataStore + ?Sized> MetadataStore for Arc<T> {
    fn persist(&self, snapshot: &TreeSnapshot) -> VfsResult<()> {
        (**self).persist(snapshot)
    }

    fn load(&self) -> VfsResult<Option<TreeSnapshot>> {
        (**self).load()
    }
}
