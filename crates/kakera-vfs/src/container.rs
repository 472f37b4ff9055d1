//! Containers: a block store, the directory tree stored in it and the
//! metadata collaborator that keeps the two in step.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kakera_blocks::{BlockStore, StoreStats};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ContainerConfig;
use crate::directory::VirtualDirectory;
use crate::error::{VfsError, VfsResult};
use crate::file::VirtualFile;
use crate::iter::FileMatches;
use crate::lock::LockMode;
use crate::metadata::{ChainMetadata, MetadataStore, TreeSnapshot};

/// Name given to the root directory of a new container.
pub const ROOT_NAME: &str = "root";

/// What every node of a container tree reaches through its root.
#[derive(Debug)]
pub struct StorageContext {
    store: Arc<BlockStore>,
    metadata: Box<dyn MetadataStore>,
    auto_persist: bool,
    pending: AtomicBool,
    persist_lock: Mutex<()>,
}

impl StorageContext {
    fn new(store: Arc<BlockStore>, metadata: Box<dyn MetadataStore>, auto_persist: bool) -> Self {
        Self {
            store,
            metadata,
            auto_persist,
            pending: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    /// Whether a persist was skipped and is still owed.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Persist after a mutation. A busy tree defers the persist instead of
    /// failing the mutation that already happened.
    pub(crate) fn persist(&self, root: &VirtualDirectory) -> VfsResult<()> {
        if !self.auto_persist {
            self.pending.store(true, Ordering::Release);
            return Ok(());
        }
        match root.lock_down(LockMode::Read) {
            Ok(locks) => {
                self.save(root)?;
                drop(locks);
                Ok(())
            }
            Err(VfsError::Locked(what)) => {
                self.pending.store(true, Ordering::Release);
                debug!("tree busy ({}), deferring metadata persist", what);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Snapshot and hand the tree to the collaborator. The caller holds a
    /// lock-down on `root`.
    pub(crate) fn save(&self, root: &VirtualDirectory) -> VfsResult<()> {
        let _serial = self.persist_lock.lock();
        let snapshot = TreeSnapshot::capture(root);
        self.metadata.persist(&snapshot)?;
        self.pending.store(false, Ordering::Release);
        Ok(())
    }
}

/// Whether two nodes live in the same container (or both in none).
pub(crate) fn same_storage(
    a: Option<&Arc<StorageContext>>,
    b: Option<&Arc<StorageContext>>,
) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// A container file opened as a directory tree.
#[derive(Debug)]
pub struct Container {
    root: VirtualDirectory,
    storage: Arc<StorageContext>,
}

impl Container {
    /// Open or create a container with default options.
    pub fn open(path: impl AsRef<Path>) -> VfsResult<Self> {
        Self::open_with(path, &ContainerConfig::default())
    }

    /// Open or create a container. The tree metadata lives in the container's
    /// first chain.
    pub fn open_with(path: impl AsRef<Path>, config: &ContainerConfig) -> VfsResult<Self> {
        let store = Arc::new(BlockStore::open(path.as_ref(), &config.store_config())?);
        let metadata = ChainMetadata::new(store.clone());
        Self::assemble(store, Box::new(metadata), config.persist)
    }

    /// Build a container whose tree metadata is kept by `metadata`.
    pub fn with_metadata(
        store: Arc<BlockStore>,
        metadata: impl MetadataStore + 'static,
    ) -> VfsResult<Self> {
        Self::assemble(store, Box::new(metadata), true)
    }

    fn assemble(
        store: Arc<BlockStore>,
        metadata: Box<dyn MetadataStore>,
        auto_persist: bool,
    ) -> VfsResult<Self> {
        let loaded = metadata.load()?;
        let storage = Arc::new(StorageContext::new(store, metadata, auto_persist));

        let root = match loaded {
            Some(snapshot) => {
                let root = snapshot.restore(storage.clone())?;
                info!(
                    "loaded container {} ({} files)",
                    storage.store().path().display(),
                    snapshot.root.file_count()
                );
                root
            }
            None => {
                let root = VirtualDirectory::new_root(ROOT_NAME, storage.clone())?;
                storage.save(&root)?;
                info!(
                    "created container {} (block size {})",
                    storage.store().path().display(),
                    storage.store().block_size()
                );
                root
            }
        };

        Ok(Self { root, storage })
    }

    pub fn root(&self) -> &VirtualDirectory {
        &self.root
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        self.storage.store()
    }

    pub fn path(&self) -> &Path {
        self.storage.store().path()
    }

    /// Whether a persist was deferred because the tree was busy.
    pub fn has_pending_persist(&self) -> bool {
        self.storage.is_pending()
    }

    // ========================================================================
    // Root delegates
    // ========================================================================

    pub fn mkdir(&self, name: &str) -> VfsResult<VirtualDirectory> {
        self.root.mkdir(name)
    }

    pub fn touch(&self, name: &str) -> VfsResult<VirtualFile> {
        self.root.touch(name)
    }

    pub fn directories(&self) -> VfsResult<Vec<VirtualDirectory>> {
        self.root.directories()
    }

    pub fn files(&self) -> VfsResult<Vec<VirtualFile>> {
        self.root.files()
    }

    /// Files anywhere in the tree whose name contains `fragment`.
    pub fn find_name(&self, fragment: &str) -> VfsResult<FileMatches> {
        self.root.find_name(fragment, true)
    }

    /// Files anywhere in the tree whose whole name matches `pattern`.
    pub fn find_pattern(&self, pattern: &str) -> VfsResult<FileMatches> {
        self.root.find_pattern(pattern, true)
    }

    pub fn import_content(&self, source: &VirtualDirectory) -> VfsResult<()> {
        self.root.import_content(source)
    }

    pub fn import_folder(&self, folder: impl AsRef<Path>) -> VfsResult<()> {
        self.root.import_folder(folder)
    }

    pub fn export_folder(&self, folder: impl AsRef<Path>) -> VfsResult<()> {
        self.root.export_folder(folder)
    }

    /// Block usage of the container file.
    pub fn stats(&self) -> VfsResult<StoreStats> {
        Ok(self.storage.store().stats()?)
    }

    // ========================================================================
    // Path lookup
    // ========================================================================

    /// Directory at a slash-separated path below the root. `/` and the empty
    /// path are the root itself.
    pub fn directory_at(&self, path: &str) -> VfsResult<VirtualDirectory> {
        let mut dir = self.root.clone();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            dir = dir.directory(part)?;
        }
        Ok(dir)
    }

    /// File at a slash-separated path below the root.
    pub fn file_at(&self, path: &str) -> VfsResult<VirtualFile> {
        let trimmed = path.trim_end_matches('/');
        let (dir, name) = match trimmed.rsplit_once('/') {
            Some((dir, name)) => (self.directory_at(dir)?, name),
            None => (self.root.clone(), trimmed),
        };
        if name.is_empty() {
            return Err(VfsError::not_found(path));
        }
        dir.file(name)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Persist now. Fails with `Locked` while any writer holds part of the
    /// tree.
    pub fn sync(&self) -> VfsResult<()> {
        let locks = self.root.lock_down(LockMode::Read)?;
        self.storage.save(&self.root)?;
        drop(locks);
        self.storage.store().sync()?;
        Ok(())
    }

    /// Persist and flush with the whole tree write-locked, which fails with
    /// `Locked` while any file is open. The container stays usable.
    pub fn close(&self) -> VfsResult<()> {
        let locks = self.root.lock_down(LockMode::Write)?;
        self.storage.save(&self.root)?;
        drop(locks);
        self.storage.store().sync()?;
        debug!("closed container {}", self.path().display());
        Ok(())
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if !self.storage.is_pending() {
            return;
        }
        let result = self
            .root
            .lock_down(LockMode::Read)
            .and_then(|_locks| self.storage.save(&self.root));
        if let Err(e) = result {
            warn!(
                "container {} dropped with unsaved metadata: {}",
                self.path().display(),
                e
            );
        }
    }
}
