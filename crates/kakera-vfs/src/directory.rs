//! Virtual directories and the subtree lock-down protocol.
//!
//! A directory carries three node locks: its own name, its list of child
//! directories and its list of child files. Whole-subtree operations gather
//! locks with [`VirtualDirectory::lock_down`]: this directory's three locks,
//! then every child directory's subtree, then every child file's content lock.
//! The first lock that is busy aborts the whole traversal and everything
//! gathered so far is released, so a failed operation leaves no trace.
//!
//! The child lists themselves sit behind short `parking_lot` data locks that
//! are never held while a node lock is being tried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use kakera_blocks::NO_BLOCK;
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::container::{same_storage, StorageContext};
use crate::error::{VfsError, VfsResult};
use crate::file::VirtualFile;
use crate::iter::FileMatches;
use crate::lock::{LockGuard, LockMode, LockSet, NodeLock};
use crate::node::{validate_name, NodeCore, VfsNode};

#[derive(Debug)]
pub(crate) struct DirectoryNode {
    pub(crate) core: NodeCore,
    name_lock: NodeLock,
    dirs_lock: NodeLock,
    files_lock: NodeLock,
    directories: RwLock<Vec<VirtualDirectory>>,
    files: RwLock<Vec<VirtualFile>>,
    modifying: AtomicBool,
    /// Set on container roots only; descendants find it through their parents.
    storage: RwLock<Option<Arc<StorageContext>>>,
}

/// A directory in the tree. Cloning gives another handle to the same node.
#[derive(Debug, Clone)]
pub struct VirtualDirectory {
    node: Arc<DirectoryNode>,
}

impl VirtualDirectory {
    /// A standalone tree root that is not backed by any container.
    ///
    /// Files created below it have no content storage; opening them fails with
    /// `NoStorageContext`.
    pub fn new(name: &str) -> VfsResult<Self> {
        Self::build(name, None, None)
    }

    pub(crate) fn new_root(name: &str, storage: Arc<StorageContext>) -> VfsResult<Self> {
        Self::build(name, None, Some(storage))
    }

    /// Unattached directory whose parent link already points at `parent`.
    pub(crate) fn child_of(name: &str, parent: &Arc<DirectoryNode>) -> VfsResult<Self> {
        Self::build(name, Some(parent), None)
    }

    fn build(
        name: &str,
        parent: Option<&Arc<DirectoryNode>>,
        storage: Option<Arc<StorageContext>>,
    ) -> VfsResult<Self> {
        Ok(Self {
            node: Arc::new(DirectoryNode {
                core: NodeCore::new(name, parent)?,
                name_lock: NodeLock::new(),
                dirs_lock: NodeLock::new(),
                files_lock: NodeLock::new(),
                directories: RwLock::new(Vec::new()),
                files: RwLock::new(Vec::new()),
                modifying: AtomicBool::new(false),
                storage: RwLock::new(storage),
            }),
        })
    }

    pub(crate) fn from_node(node: Arc<DirectoryNode>) -> Self {
        Self { node }
    }

    pub(crate) fn node(&self) -> &Arc<DirectoryNode> {
        &self.node
    }

    pub(crate) fn core(&self) -> &NodeCore {
        &self.node.core
    }

    /// Whether both values refer to the same node.
    pub fn ptr_eq(&self, other: &VirtualDirectory) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Whether this directory is the top of its tree.
    pub fn is_root(&self) -> bool {
        self.node.core.parent().is_none() && !self.is_deleted()
    }

    /// Best-effort flag raised while a child list is being changed.
    pub fn is_modifying(&self) -> bool {
        self.node.modifying.load(Ordering::Acquire)
    }

    // ========================================================================
    // Locking
    // ========================================================================

    fn lock(&self, lock: &NodeLock, what: &str, mode: LockMode) -> VfsResult<LockGuard> {
        lock.try_acquire(mode)
            .ok_or_else(|| VfsError::locked(format!("{what} of {}", self.name())))
    }

    pub(crate) fn lock_name(&self, mode: LockMode) -> VfsResult<LockGuard> {
        self.lock(&self.node.name_lock, "name", mode)
    }

    pub(crate) fn lock_dirs(&self, mode: LockMode) -> VfsResult<LockGuard> {
        self.lock(&self.node.dirs_lock, "directory list", mode)
    }

    pub(crate) fn lock_files(&self, mode: LockMode) -> VfsResult<LockGuard> {
        self.lock(&self.node.files_lock, "file list", mode)
    }

    /// Lock this directory's whole subtree in `mode`, all or nothing.
    pub fn lock_down(&self, mode: LockMode) -> VfsResult<LockSet> {
        let mut locks = LockSet::new();
        self.lock_down_into(mode, &mut locks)?;
        Ok(locks)
    }

    fn lock_down_into(&self, mode: LockMode, locks: &mut LockSet) -> VfsResult<()> {
        locks.push(self.lock_name(mode)?);
        locks.push(self.lock_dirs(mode)?);
        locks.push(self.lock_files(mode)?);
        for dir in self.directories_unlocked() {
            dir.lock_down_into(mode, locks)?;
        }
        for file in self.files_unlocked() {
            locks.push(file.lock_content(mode)?);
        }
        Ok(())
    }

    // ========================================================================
    // Child lists (callers hold the matching node locks)
    // ========================================================================

    pub(crate) fn directories_unlocked(&self) -> Vec<VirtualDirectory> {
        self.node.directories.read().clone()
    }

    pub(crate) fn files_unlocked(&self) -> Vec<VirtualFile> {
        self.node.files.read().clone()
    }

    pub(crate) fn find_directory_unlocked(&self, name: &str) -> Option<VirtualDirectory> {
        self.node
            .directories
            .read()
            .iter()
            .find(|dir| dir.core().has_name(name))
            .cloned()
    }

    pub(crate) fn find_file_unlocked(&self, name: &str) -> Option<VirtualFile> {
        self.node
            .files
            .read()
            .iter()
            .find(|file| file.core().has_name(name))
            .cloned()
    }

    pub(crate) fn contains_directory(&self, name: &str, except: Option<&VirtualDirectory>) -> bool {
        self.node
            .directories
            .read()
            .iter()
            .any(|dir| dir.core().has_name(name) && !except.is_some_and(|e| e.ptr_eq(dir)))
    }

    pub(crate) fn contains_file(&self, name: &str, except: Option<&VirtualFile>) -> bool {
        self.node
            .files
            .read()
            .iter()
            .any(|file| file.core().has_name(name) && !except.is_some_and(|e| e.ptr_eq(file)))
    }

    fn mutate<R>(&self, f: impl FnOnce(&DirectoryNode) -> R) -> R {
        self.node.modifying.store(true, Ordering::Release);
        let result = f(&self.node);
        self.node.modifying.store(false, Ordering::Release);
        result
    }

    pub(crate) fn attach_dir(&self, dir: VirtualDirectory) {
        dir.core().set_parent(&self.node);
        self.mutate(|node| node.directories.write().push(dir));
    }

    pub(crate) fn detach_dir(&self, dir: &VirtualDirectory) {
        self.mutate(|node| node.directories.write().retain(|d| !d.ptr_eq(dir)));
    }

    pub(crate) fn attach_file(&self, file: VirtualFile) {
        file.core().set_parent(&self.node);
        self.mutate(|node| node.files.write().push(file));
    }

    pub(crate) fn detach_file(&self, file: &VirtualFile) {
        self.mutate(|node| node.files.write().retain(|f| !f.ptr_eq(file)));
    }

    // ========================================================================
    // Tree position and storage
    // ========================================================================

    pub(crate) fn parent_dir(&self) -> Option<VirtualDirectory> {
        self.node.core.parent().map(Self::from_node)
    }

    /// Topmost ancestor.
    pub(crate) fn tree_root(&self) -> VirtualDirectory {
        let mut node = self.node.clone();
        while let Some(parent) = node.core.parent() {
            node = parent;
        }
        Self::from_node(node)
    }

    /// Whether `self` is `ancestor` or lies below it.
    pub(crate) fn is_within(&self, ancestor: &VirtualDirectory) -> bool {
        let mut node = Some(self.node.clone());
        while let Some(current) = node {
            if Arc::ptr_eq(&current, &ancestor.node) {
                return true;
            }
            node = current.core.parent();
        }
        false
    }

    /// Container backing this tree, if any.
    pub(crate) fn storage(&self) -> Option<Arc<StorageContext>> {
        let mut node = self.node.clone();
        loop {
            if let Some(storage) = node.storage.read().as_ref() {
                return Some(storage.clone());
            }
            let parent = node.core.parent()?;
            node = parent;
        }
    }

    /// Hand the tree to the container's metadata collaborator.
    pub(crate) fn persist_tree(&self) -> VfsResult<()> {
        let root = self.tree_root();
        let storage = root.node.storage.read().clone();
        match storage {
            Some(storage) => storage.persist(&root),
            None => Ok(()),
        }
    }

    fn check_parent(&self, parent: &VirtualDirectory) -> VfsResult<()> {
        self.core().check_alive()?;
        match self.parent_dir() {
            Some(current) if current.ptr_eq(parent) => Ok(()),
            _ => Err(VfsError::locked(format!("{} moved concurrently", self.name()))),
        }
    }

    // ========================================================================
    // Children
    // ========================================================================

    /// Create a subdirectory.
    #[instrument(skip(self), fields(dir = %self.name()))]
    pub fn mkdir(&self, name: &str) -> VfsResult<VirtualDirectory> {
        validate_name(name)?;
        self.core().check_alive()?;

        let guard = self.lock_dirs(LockMode::Write)?;
        self.core().check_alive()?;
        if self.contains_directory(name, None) {
            return Err(VfsError::not_unique(name));
        }
        let dir = Self::child_of(name, &self.node)?;
        self.attach_dir(dir.clone());
        drop(guard);

        debug!("created directory {}", dir.path());
        self.persist_tree()?;
        Ok(dir)
    }

    /// Create an empty file.
    #[instrument(skip(self), fields(dir = %self.name()))]
    pub fn touch(&self, name: &str) -> VfsResult<VirtualFile> {
        validate_name(name)?;
        self.core().check_alive()?;

        let guard = self.lock_files(LockMode::Write)?;
        self.core().check_alive()?;
        if self.contains_file(name, None) {
            return Err(VfsError::not_unique(name));
        }
        let now = SystemTime::now();
        let file = VirtualFile::create(name, &self.node, now, now, NO_BLOCK)?;
        self.attach_file(file.clone());
        drop(guard);

        debug!("created file {}", file.path());
        self.persist_tree()?;
        Ok(file)
    }

    /// Snapshot of the child directories, in insertion order.
    pub fn directories(&self) -> VfsResult<Vec<VirtualDirectory>> {
        let _guard = self.lock_dirs(LockMode::Read)?;
        Ok(self.directories_unlocked())
    }

    /// Snapshot of the child files, in insertion order.
    pub fn files(&self) -> VfsResult<Vec<VirtualFile>> {
        let _guard = self.lock_files(LockMode::Read)?;
        Ok(self.files_unlocked())
    }

    /// Child directory by name.
    pub fn directory(&self, name: &str) -> VfsResult<VirtualDirectory> {
        let _guard = self.lock_dirs(LockMode::Read)?;
        self.find_directory_unlocked(name)
            .ok_or_else(|| VfsError::not_found(name))
    }

    /// Child file by name.
    pub fn file(&self, name: &str) -> VfsResult<VirtualFile> {
        let _guard = self.lock_files(LockMode::Read)?;
        self.find_file_unlocked(name)
            .ok_or_else(|| VfsError::not_found(name))
    }

    // ========================================================================
    // Copy and import
    // ========================================================================

    /// Deep-copy this directory into `dest`. Works across containers.
    #[instrument(skip(self, dest), fields(dir = %self.name(), dest = %dest.name()))]
    pub fn copy_to(&self, dest: &VirtualDirectory) -> VfsResult<VirtualDirectory> {
        self.core().check_alive()?;
        dest.core().check_alive()?;
        if dest.is_within(self) {
            return Err(VfsError::invalid_destination(format!(
                "{} cannot be copied into itself",
                self.path()
            )));
        }

        let mut locks = self.lock_down(LockMode::Read)?;
        locks.push(dest.lock_dirs(LockMode::Write)?);
        self.core().check_alive()?;

        let name = self.name();
        if dest.contains_directory(&name, None) {
            return Err(VfsError::not_unique(name));
        }
        let source = self.storage();
        let target = dest.storage();
        let copy = self.clone_into(dest.node(), source.as_deref(), target.as_deref())?;
        dest.attach_dir(copy.clone());
        drop(locks);

        debug!("copied directory {} into {}", name, dest.path());
        dest.persist_tree()?;
        Ok(copy)
    }

    /// Merge the children of `source` into this directory.
    ///
    /// Directories with the same name merge recursively; a file whose name is
    /// already taken rejects the whole import with `NotUnique` before anything
    /// changes.
    #[instrument(skip(self, source), fields(dir = %self.name(), source = %source.name()))]
    pub fn import_content(&self, source: &VirtualDirectory) -> VfsResult<()> {
        self.core().check_alive()?;
        source.core().check_alive()?;
        if self.is_within(source) {
            return Err(VfsError::invalid_destination(format!(
                "{} cannot be imported into itself",
                source.path()
            )));
        }

        let mut locks = source.lock_down(LockMode::Read)?;
        Self::plan_merge(self, source, &mut locks)?;

        let from = source.storage();
        let to = self.storage();
        Self::apply_merge(self, source, from.as_deref(), to.as_deref())?;
        drop(locks);

        self.persist_tree()
    }

    /// Lock every merge target's lists and check for file collisions.
    fn plan_merge(
        target: &VirtualDirectory,
        source: &VirtualDirectory,
        locks: &mut LockSet,
    ) -> VfsResult<()> {
        locks.push(target.lock_dirs(LockMode::Write)?);
        locks.push(target.lock_files(LockMode::Write)?);
        target.core().check_alive()?;

        for file in source.files_unlocked() {
            let name = file.name();
            if target.contains_file(&name, None) {
                return Err(VfsError::not_unique(name));
            }
        }
        for dir in source.directories_unlocked() {
            if let Some(existing) = target.find_directory_unlocked(&dir.name()) {
                Self::plan_merge(&existing, &dir, locks)?;
            }
        }
        Ok(())
    }

    fn apply_merge(
        target: &VirtualDirectory,
        source: &VirtualDirectory,
        from: Option<&StorageContext>,
        to: Option<&StorageContext>,
    ) -> VfsResult<()> {
        for dir in source.directories_unlocked() {
            match target.find_directory_unlocked(&dir.name()) {
                Some(existing) => Self::apply_merge(&existing, &dir, from, to)?,
                None => target.attach_dir(dir.clone_into(target.node(), from, to)?),
            }
        }
        for file in source.files_unlocked() {
            target.attach_file(file.clone_into(target.node(), from, to)?);
        }
        Ok(())
    }

    /// New, unattached deep copy under `dest`. Content written for a copy that
    /// fails half-way is freed again.
    pub(crate) fn clone_into(
        &self,
        dest: &Arc<DirectoryNode>,
        source: Option<&StorageContext>,
        target: Option<&StorageContext>,
    ) -> VfsResult<VirtualDirectory> {
        let copy = Self::child_of(&self.name(), dest)?;
        if let Err(e) = self.fill_clone(&copy, source, target) {
            copy.discard_contents(target);
            return Err(e);
        }
        Ok(copy)
    }

    fn fill_clone(
        &self,
        copy: &VirtualDirectory,
        source: Option<&StorageContext>,
        target: Option<&StorageContext>,
    ) -> VfsResult<()> {
        for dir in self.directories_unlocked() {
            copy.attach_dir(dir.clone_into(copy.node(), source, target)?);
        }
        for file in self.files_unlocked() {
            copy.attach_file(file.clone_into(copy.node(), source, target)?);
        }
        Ok(())
    }

    pub(crate) fn discard_contents(&self, storage: Option<&StorageContext>) {
        for dir in self.directories_unlocked() {
            dir.discard_contents(storage);
        }
        for file in self.files_unlocked() {
            if let Err(e) = file.free_content(storage) {
                warn!("failed to free content of abandoned copy {}: {}", file.name(), e);
            }
        }
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Remove the whole subtree with every lock already held by the caller.
    pub(crate) fn remove_locked(&self, storage: Option<&StorageContext>) -> VfsResult<()> {
        let result = self.remove_children(storage);
        // Children that did go stay gone even if a later one failed.
        self.mutate(|node| {
            node.files.write().retain(|f| !f.is_deleted());
            node.directories.write().retain(|d| !d.is_deleted());
        });
        result?;

        self.node.core.detach();
        self.node.core.mark_deleted();
        Ok(())
    }

    fn remove_children(&self, storage: Option<&StorageContext>) -> VfsResult<()> {
        for file in self.files_unlocked() {
            file.remove_locked(storage)?;
        }
        for dir in self.directories_unlocked() {
            dir.remove_locked(storage)?;
        }
        Ok(())
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Lazily iterate the files accepted by `predicate`.
    pub fn find<P>(&self, predicate: P, recursive: bool) -> VfsResult<FileMatches>
    where
        P: Fn(&VirtualFile) -> bool + Send + Sync + 'static,
    {
        FileMatches::new(self.clone(), Arc::new(predicate), recursive)
    }

    /// Files whose name contains `fragment`.
    pub fn find_name(&self, fragment: &str, recursive: bool) -> VfsResult<FileMatches> {
        let fragment = fragment.to_string();
        self.find(move |file| file.name().contains(&fragment), recursive)
    }

    /// Files whose whole name matches the regular expression `pattern`.
    pub fn find_pattern(&self, pattern: &str, recursive: bool) -> VfsResult<FileMatches> {
        let regex = Regex::new(&format!("^(?:{pattern})$"))?;
        self.find(move |file| regex.is_match(&file.name()), recursive)
    }
}

impl VfsNode for VirtualDirectory {
    fn name(&self) -> String {
        self.node.core.name()
    }

    fn parent(&self) -> Option<VirtualDirectory> {
        self.parent_dir()
    }

    fn is_deleted(&self) -> bool {
        self.node.core.is_deleted()
    }

    #[instrument(skip(self), fields(dir = %self.name()))]
    fn rename(&self, new_name: &str) -> VfsResult<()> {
        self.core().check_rename(new_name)?;

        let mut locks = LockSet::new();
        locks.push(self.lock_name(LockMode::Write)?);
        if let Some(parent) = self.parent_dir() {
            locks.push(parent.lock_dirs(LockMode::Write)?);
            if parent.contains_directory(new_name, Some(self)) {
                return Err(VfsError::not_unique(new_name));
            }
        }
        self.core().check_alive()?;

        self.core().set_name(new_name);
        drop(locks);
        self.persist_tree()
    }

    #[instrument(skip(self), fields(dir = %self.name()))]
    fn remove(&self) -> VfsResult<()> {
        let parent = Self::from_node(self.core().check_remove()?);

        let mut locks = self.lock_down(LockMode::Write)?;
        locks.push(parent.lock_dirs(LockMode::Write)?);
        self.check_parent(&parent)?;

        let storage = parent.storage();
        let result = self.remove_locked(storage.as_deref());
        if self.is_deleted() {
            parent.detach_dir(self);
        }
        drop(locks);
        result?;

        debug!("removed directory {} from {}", self.name(), parent.path());
        parent.persist_tree()
    }

    #[instrument(skip(self, dest), fields(dir = %self.name(), dest = %dest.name()))]
    fn move_to(&self, dest: &VirtualDirectory) -> VfsResult<()> {
        let parent = Self::from_node(self.core().check_remove()?);
        dest.core().check_alive()?;

        let name = self.name();
        if parent.ptr_eq(dest) {
            return Err(VfsError::not_unique(name));
        }
        if dest.is_within(self) {
            return Err(VfsError::invalid_destination(format!(
                "{} cannot move into itself",
                self.path()
            )));
        }
        if !same_storage(self.storage().as_ref(), dest.storage().as_ref()) {
            return Err(VfsError::invalid_destination(format!(
                "{name} cannot move to another container"
            )));
        }

        let mut locks = self.lock_down(LockMode::Write)?;
        locks.push(parent.lock_dirs(LockMode::Write)?);
        locks.push(dest.lock_dirs(LockMode::Write)?);
        self.check_parent(&parent)?;
        if dest.contains_directory(&name, None) {
            return Err(VfsError::not_unique(name));
        }

        parent.detach_dir(self);
        dest.attach_dir(self.clone());
        drop(locks);

        debug!("moved directory {} to {}", name, dest.path());
        dest.persist_tree()
    }
}

impl PartialEq for VirtualDirectory {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for VirtualDirectory {}
