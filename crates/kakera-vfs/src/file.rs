//! Virtual files: a named block chain plus timestamps.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use kakera_blocks::{AccessMode, BlockStore, VirtualStream, NO_BLOCK};
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::container::{same_storage, StorageContext};
use crate::directory::{DirectoryNode, VirtualDirectory};
use crate::error::{VfsError, VfsResult};
use crate::handle::FileHandle;
use crate::lock::{LockGuard, LockMode, LockSet, NodeLock};
use crate::node::{NodeCore, VfsNode};

#[derive(Debug)]
pub(crate) struct FileNode {
    pub(crate) core: NodeCore,
    content_lock: NodeLock,
    created_at: Mutex<SystemTime>,
    modified_at: Mutex<SystemTime>,
    head: AtomicI64,
}

/// A file in the tree. Cloning gives another handle to the same node.
#[derive(Debug, Clone)]
pub struct VirtualFile {
    node: Arc<FileNode>,
}

impl VirtualFile {
    pub(crate) fn create(
        name: &str,
        parent: &Arc<DirectoryNode>,
        created_at: SystemTime,
        modified_at: SystemTime,
        head: i64,
    ) -> VfsResult<Self> {
        Ok(Self {
            node: Arc::new(FileNode {
                core: NodeCore::new(name, Some(parent))?,
                content_lock: NodeLock::new(),
                created_at: Mutex::new(created_at),
                modified_at: Mutex::new(modified_at),
                head: AtomicI64::new(head),
            }),
        })
    }

    pub(crate) fn core(&self) -> &NodeCore {
        &self.node.core
    }

    pub fn created_at(&self) -> SystemTime {
        *self.node.created_at.lock()
    }

    pub fn modified_at(&self) -> SystemTime {
        *self.node.modified_at.lock()
    }

    /// Position of the content chain's head block, `-1` when empty.
    pub fn head_block_position(&self) -> i64 {
        self.node.head.load(Ordering::Acquire)
    }

    /// Content length as recorded in the head block.
    pub fn len(&self) -> VfsResult<u64> {
        let head = self.head_block_position();
        if head == NO_BLOCK {
            return Ok(0);
        }
        let storage = self
            .storage()
            .ok_or_else(|| VfsError::no_storage_context(self.name()))?;
        Ok(storage.store().read_head_meta(head as u64)?.size)
    }

    /// Whether both values refer to the same node.
    pub fn ptr_eq(&self, other: &VirtualFile) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Whether the content lock is currently held in any mode.
    pub fn is_open(&self) -> bool {
        self.node.content_lock.is_write_locked() || self.node.content_lock.readers() > 0
    }

    /// Open the content. `ReadWrite` takes the exclusive content lock,
    /// `ReadOnly` a shared one; both fail with `Locked` instead of waiting.
    #[instrument(skip(self), fields(file = %self.name()))]
    pub fn open(&self, mode: AccessMode) -> VfsResult<FileHandle> {
        let storage = self
            .storage()
            .ok_or_else(|| VfsError::no_storage_context(self.name()))?;
        let guard = self.lock_content(match mode {
            AccessMode::ReadOnly => LockMode::Read,
            AccessMode::ReadWrite => LockMode::Write,
        })?;
        if self.is_deleted() {
            return Err(VfsError::no_storage_context(self.name()));
        }

        let stream = VirtualStream::open(storage.store().clone(), self.head_block_position(), mode)?;
        Ok(FileHandle::new(self.clone(), stream, guard, storage))
    }

    /// Copy this file into `dest`. Works across containers.
    #[instrument(skip(self, dest), fields(file = %self.name(), dest = %dest.name()))]
    pub fn copy_to(&self, dest: &VirtualDirectory) -> VfsResult<VirtualFile> {
        self.core().check_alive()?;
        dest.core().check_alive()?;

        let mut locks = LockSet::new();
        locks.push(self.lock_content(LockMode::Read)?);
        locks.push(dest.lock_files(LockMode::Write)?);
        self.core().check_alive()?;

        let name = self.name();
        if dest.contains_file(&name, None) {
            return Err(VfsError::not_unique(name));
        }
        let source = self.storage();
        let target = dest.storage();
        let copy = self.clone_into(dest.node(), source.as_deref(), target.as_deref())?;
        dest.attach_file(copy.clone());
        drop(locks);

        debug!("copied file {} into {}", name, dest.path());
        dest.persist_tree()?;
        Ok(copy)
    }

    // ========================================================================
    // Crate internals
    // ========================================================================

    pub(crate) fn lock_content(&self, mode: LockMode) -> VfsResult<LockGuard> {
        self.node
            .content_lock
            .try_acquire(mode)
            .ok_or_else(|| VfsError::locked(format!("content of {}", self.name())))
    }

    pub(crate) fn parent_dir(&self) -> Option<VirtualDirectory> {
        self.node.core.parent().map(VirtualDirectory::from_node)
    }

    /// Re-check, under lock, that the node is alive and still sits in `parent`.
    ///
    /// A concurrent operation may have removed or moved it between the first
    /// look and the lock.
    fn check_parent(&self, parent: &VirtualDirectory) -> VfsResult<()> {
        self.core().check_alive()?;
        match self.parent_dir() {
            Some(current) if current.ptr_eq(parent) => Ok(()),
            _ => Err(VfsError::locked(format!("{} moved concurrently", self.name()))),
        }
    }

    pub(crate) fn storage(&self) -> Option<Arc<StorageContext>> {
        self.parent_dir().and_then(|dir| dir.storage())
    }

    /// Record what a closed stream reported.
    pub(crate) fn publish(&self, head: i64, modified: bool) {
        self.node.head.store(head, Ordering::Release);
        if modified {
            self.touch_modified();
        }
    }

    pub(crate) fn touch_modified(&self) {
        *self.node.modified_at.lock() = SystemTime::now();
    }

    /// Free the content chain. The caller holds the content write lock.
    pub(crate) fn free_content(&self, storage: Option<&StorageContext>) -> VfsResult<()> {
        let head = self.head_block_position();
        if head == NO_BLOCK {
            return Ok(());
        }
        let storage = storage.ok_or_else(|| VfsError::no_storage_context(self.name()))?;
        let mut stream = VirtualStream::open(storage.store().clone(), head, AccessMode::ReadWrite)?;
        stream.set_length(0)?;
        let summary = stream.close()?;
        self.node.head.store(summary.head, Ordering::Release);
        Ok(())
    }

    /// Remove with every lock already held by the caller.
    pub(crate) fn remove_locked(&self, storage: Option<&StorageContext>) -> VfsResult<()> {
        self.free_content(storage)?;
        self.node.core.detach();
        self.node.core.mark_deleted();
        Ok(())
    }

    /// New, unattached file under `dest` with this file's name, timestamps and
    /// a byte copy of its content.
    pub(crate) fn clone_into(
        &self,
        dest: &Arc<DirectoryNode>,
        source: Option<&StorageContext>,
        target: Option<&StorageContext>,
    ) -> VfsResult<VirtualFile> {
        let head = match self.head_block_position() {
            NO_BLOCK => NO_BLOCK,
            head => {
                let (Some(source), Some(target)) = (source, target) else {
                    return Err(VfsError::no_storage_context(self.name()));
                };
                copy_content(head, source.store(), target.store())?
            }
        };
        VirtualFile::create(&self.name(), dest, self.created_at(), self.modified_at(), head)
    }
}

/// Byte-copy a chain, possibly between containers. Returns the new head.
pub(crate) fn copy_content(
    head: i64,
    from: &Arc<BlockStore>,
    to: &Arc<BlockStore>,
) -> VfsResult<i64> {
    let mut reader = VirtualStream::open(from.clone(), head, AccessMode::ReadOnly)?;
    let mut writer = VirtualStream::open(to.clone(), NO_BLOCK, AccessMode::ReadWrite)?;
    io::copy(&mut reader, &mut writer)?;
    Ok(writer.close()?.head)
}

impl VfsNode for VirtualFile {
    fn name(&self) -> String {
        self.node.core.name()
    }

    fn parent(&self) -> Option<VirtualDirectory> {
        self.parent_dir()
    }

    fn is_deleted(&self) -> bool {
        self.node.core.is_deleted()
    }

    #[instrument(skip(self), fields(file = %self.name()))]
    fn rename(&self, new_name: &str) -> VfsResult<()> {
        self.core().check_rename(new_name)?;

        let mut locks = LockSet::new();
        locks.push(self.lock_content(LockMode::Write)?);
        let parent = self.parent_dir();
        if let Some(parent) = &parent {
            locks.push(parent.lock_files(LockMode::Write)?);
            if parent.contains_file(new_name, Some(self)) {
                return Err(VfsError::not_unique(new_name));
            }
        }
        self.core().check_alive()?;

        self.core().set_name(new_name);
        self.touch_modified();
        drop(locks);

        match parent {
            Some(parent) => parent.persist_tree(),
            None => Ok(()),
        }
    }

    #[instrument(skip(self), fields(file = %self.name()))]
    fn remove(&self) -> VfsResult<()> {
        let parent = VirtualDirectory::from_node(self.core().check_remove()?);

        let mut locks = LockSet::new();
        locks.push(self.lock_content(LockMode::Write)?);
        locks.push(parent.lock_files(LockMode::Write)?);
        self.check_parent(&parent)?;

        let storage = parent.storage();
        self.remove_locked(storage.as_deref())?;
        parent.detach_file(self);
        drop(locks);

        debug!("removed file {}", self.name());
        parent.persist_tree()
    }

    #[instrument(skip(self, dest), fields(file = %self.name(), dest = %dest.name()))]
    fn move_to(&self, dest: &VirtualDirectory) -> VfsResult<()> {
        let parent = VirtualDirectory::from_node(self.core().check_remove()?);
        dest.core().check_alive()?;

        let name = self.name();
        if parent.ptr_eq(dest) {
            return Err(VfsError::not_unique(name));
        }
        if !same_storage(parent.storage().as_ref(), dest.storage().as_ref()) {
            return Err(VfsError::invalid_destination(format!(
                "{name} cannot move to another container"
            )));
        }

        let mut locks = LockSet::new();
        locks.push(self.lock_content(LockMode::Write)?);
        locks.push(dest.lock_files(LockMode::Write)?);
        locks.push(parent.lock_files(LockMode::Write)?);
        self.check_parent(&parent)?;
        if dest.contains_file(&name, None) {
            return Err(VfsError::not_unique(name));
        }

        parent.detach_file(self);
        dest.attach_file(self.clone());
        drop(locks);

        debug!("moved file {} to {}", name, dest.path());
        dest.persist_tree()
    }
}

impl PartialEq for VirtualFile {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for VirtualFile {}
