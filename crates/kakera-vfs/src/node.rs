//! Identity and preconditions shared by files and directories.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::directory::{DirectoryNode, VirtualDirectory};
use crate::error::{VfsError, VfsResult};

/// Operations every tree node supports.
pub trait VfsNode {
    /// Current name.
    fn name(&self) -> String;

    /// Enclosing directory, `None` for a tree root or a removed node.
    fn parent(&self) -> Option<VirtualDirectory>;

    /// Whether the node was removed. Terminal.
    fn is_deleted(&self) -> bool;

    /// Rename, keeping names unique among same-kind siblings.
    fn rename(&self, new_name: &str) -> VfsResult<()>;

    /// Detach the node from its parent, freeing any content below it.
    fn remove(&self) -> VfsResult<()>;

    /// Re-parent the node under `dest`.
    fn move_to(&self, dest: &VirtualDirectory) -> VfsResult<()>;

    /// Slash-separated location below the tree root, `/` for the root itself.
    fn path(&self) -> String {
        let mut parts = Vec::new();
        let mut parent = self.parent();
        if parent.is_some() {
            parts.push(self.name());
        }
        while let Some(dir) = parent {
            let up = dir.parent();
            if up.is_some() {
                parts.push(dir.name());
            }
            parent = up;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }
}

/// Reject empty names.
pub(crate) fn validate_name(name: &str) -> VfsResult<()> {
    if name.is_empty() {
        return Err(VfsError::EmptyName);
    }
    Ok(())
}

/// Name, parent link and deletion flag.
#[derive(Debug)]
pub(crate) struct NodeCore {
    name: RwLock<String>,
    parent: RwLock<Weak<DirectoryNode>>,
    deleted: AtomicBool,
}

impl NodeCore {
    pub(crate) fn new(name: &str, parent: Option<&Arc<DirectoryNode>>) -> VfsResult<Self> {
        validate_name(name)?;
        Ok(Self {
            name: RwLock::new(name.to_string()),
            parent: RwLock::new(parent.map(Arc::downgrade).unwrap_or_default()),
            deleted: AtomicBool::new(false),
        })
    }

    pub(crate) fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn has_name(&self, name: &str) -> bool {
        *self.name.read() == name
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    pub(crate) fn parent(&self) -> Option<Arc<DirectoryNode>> {
        self.parent.read().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &Arc<DirectoryNode>) {
        *self.parent.write() = Arc::downgrade(parent);
    }

    /// Sever the parent link for good.
    pub(crate) fn detach(&self) {
        *self.parent.write() = Weak::new();
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub(crate) fn check_alive(&self) -> VfsResult<()> {
        if self.is_deleted() {
            return Err(VfsError::already_deleted(self.name()));
        }
        Ok(())
    }

    /// Base checks of a rename. Uniqueness is up to the caller.
    pub(crate) fn check_rename(&self, new_name: &str) -> VfsResult<()> {
        validate_name(new_name)?;
        self.check_alive()
    }

    /// Base checks of a remove or move. Returns the parent.
    pub(crate) fn check_remove(&self) -> VfsResult<Arc<DirectoryNode>> {
        self.check_alive()?;
        self.parent()
            .ok_or_else(|| VfsError::unremovable(self.name()))
    }
}
