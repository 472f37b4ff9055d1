//! Lazy search over a directory's files.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::directory::VirtualDirectory;
use crate::error::{VfsError, VfsResult};
use crate::file::VirtualFile;
use crate::lock::LockMode;
use crate::node::VfsNode;

/// Shared file filter.
pub type FilePredicate = Arc<dyn Fn(&VirtualFile) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    LocalFiles,
    Subdirectories,
    Exhausted,
}

/// Files of a directory (and, when recursive, of its subtree) accepted by a
/// predicate.
///
/// Works on snapshots of the child lists taken at construction, descending
/// into subdirectories lazily, left to right. Not restartable.
pub struct FileMatches {
    dir: VirtualDirectory,
    predicate: FilePredicate,
    recursive: bool,
    phase: Phase,
    files: VecDeque<VirtualFile>,
    subdirs: VecDeque<VirtualDirectory>,
    child: Option<Box<FileMatches>>,
    peeked: Option<VirtualFile>,
}

impl FileMatches {
    /// Snapshot `dir`'s lists. A list busy with a writer surfaces as
    /// `ConcurrentModification`.
    pub fn new(dir: VirtualDirectory, predicate: FilePredicate, recursive: bool) -> VfsResult<Self> {
        let busy = |_| VfsError::concurrent_modification(dir.name());
        let files = {
            let _guard = dir.lock_files(LockMode::Read).map_err(busy)?;
            dir.files_unlocked()
        };
        let subdirs = if recursive {
            let _guard = dir.lock_dirs(LockMode::Read).map_err(busy)?;
            dir.directories_unlocked()
        } else {
            Vec::new()
        };

        Ok(Self {
            dir,
            predicate,
            recursive,
            phase: Phase::LocalFiles,
            files: files.into(),
            subdirs: subdirs.into(),
            child: None,
            peeked: None,
        })
    }

    /// Advance to the next match without consuming it.
    pub fn has_next(&mut self) -> VfsResult<bool> {
        if self.peeked.is_some() {
            return Ok(true);
        }
        if self.phase == Phase::Exhausted {
            return Ok(false);
        }
        if self.dir.is_modifying() {
            return Err(VfsError::concurrent_modification(self.dir.name()));
        }

        loop {
            match self.phase {
                Phase::LocalFiles => {
                    while let Some(file) = self.files.pop_front() {
                        if (self.predicate)(&file) {
                            self.peeked = Some(file);
                            return Ok(true);
                        }
                    }
                    self.phase = if self.recursive {
                        Phase::Subdirectories
                    } else {
                        Phase::Exhausted
                    };
                }
                Phase::Subdirectories => {
                    if let Some(child) = self.child.as_mut() {
                        if child.has_next()? {
                            self.peeked = child.peeked.take();
                            return Ok(true);
                        }
                        self.child = None;
                    }
                    match self.subdirs.pop_front() {
                        Some(dir) => {
                            let child = FileMatches::new(dir, self.predicate.clone(), true)?;
                            self.child = Some(Box::new(child));
                        }
                        None => self.phase = Phase::Exhausted,
                    }
                }
                Phase::Exhausted => return Ok(false),
            }
        }
    }

    /// The next match, or `NoSuchElement` once exhausted.
    pub fn next_match(&mut self) -> VfsResult<VirtualFile> {
        if !self.has_next()? {
            return Err(VfsError::NoSuchElement);
        }
        self.peeked.take().ok_or(VfsError::NoSuchElement)
    }
}

impl Iterator for FileMatches {
    type Item = VfsResult<VirtualFile>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => self.peeked.take().map(Ok),
            Ok(false) => None,
            Err(e) => {
                // One error ends the iteration.
                self.phase = Phase::Exhausted;
                self.files.clear();
                self.child = None;
                Some(Err(e))
            }
        }
    }
}

impl fmt::Debug for FileMatches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMatches")
            .field("dir", &self.dir.name())
            .field("recursive", &self.recursive)
            .field("phase", &self.phase)
            .field("pending_files", &self.files.len())
            .field("pending_dirs", &self.subdirs.len())
            .finish()
    }
}
