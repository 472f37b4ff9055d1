//! Copying trees between a container and the host filesystem.
//!
//! Imports follow the same policy as [`VirtualDirectory::import_content`]:
//! host folders merge into existing directories of the same name, host files
//! collide with existing files and reject the whole import before anything
//! changes. Exports overwrite host files and stamp them with the virtual
//! modification time.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use kakera_blocks::{AccessMode, VirtualStream, NO_BLOCK};
use tracing::{debug, instrument, warn};

use crate::container::StorageContext;
use crate::directory::{DirectoryNode, VirtualDirectory};
use crate::error::{VfsError, VfsResult};
use crate::file::VirtualFile;
use crate::lock::{LockMode, LockSet};
use crate::node::{validate_name, VfsNode};

/// One host directory entry, split by kind and sorted by name.
struct HostListing {
    dirs: Vec<(String, PathBuf)>,
    files: Vec<(String, PathBuf)>,
}

impl HostListing {
    fn read(folder: &Path) -> VfsResult<Self> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in fs::read_dir(folder)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            // Follows symlinks; sockets and the like are skipped.
            let meta = fs::metadata(&path)?;
            if meta.is_dir() {
                dirs.push((name, path));
            } else if meta.is_file() {
                files.push((name, path));
            } else {
                debug!("skipping {}", path.display());
            }
        }
        dirs.sort();
        files.sort();
        Ok(Self { dirs, files })
    }
}

impl VirtualDirectory {
    /// Merge the contents of a host folder into this directory.
    #[instrument(skip(self, folder), fields(dir = %self.name(), folder = %folder.as_ref().display()))]
    pub fn import_folder(&self, folder: impl AsRef<Path>) -> VfsResult<()> {
        let folder = folder.as_ref();
        if !folder.is_dir() {
            return Err(VfsError::not_a_directory(folder.display().to_string()));
        }
        self.core().check_alive()?;
        let storage = self
            .storage()
            .ok_or_else(|| VfsError::no_storage_context(self.name()))?;

        let mut locks = LockSet::new();
        plan_folder(self, folder, &mut locks)?;
        let imported = apply_folder(self, folder, &storage)?;
        drop(locks);

        debug!("imported {} files from {}", imported, folder.display());
        self.persist_tree()
    }

    /// Import one host file into this directory.
    #[instrument(skip(self, path), fields(dir = %self.name(), path = %path.as_ref().display()))]
    pub fn import_file(&self, path: impl AsRef<Path>) -> VfsResult<VirtualFile> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(VfsError::not_found(path.display().to_string()));
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| VfsError::not_found(path.display().to_string()))?;
        validate_name(&name)?;
        self.core().check_alive()?;
        let storage = self
            .storage()
            .ok_or_else(|| VfsError::no_storage_context(self.name()))?;

        let guard = self.lock_files(LockMode::Write)?;
        self.core().check_alive()?;
        if self.contains_file(&name, None) {
            return Err(VfsError::not_unique(name));
        }
        let file = read_host_file(path, &name, self.node(), &storage)?;
        self.attach_file(file.clone());
        drop(guard);

        self.persist_tree()?;
        Ok(file)
    }

    /// Write this directory's contents into a host folder, creating it if
    /// needed. Existing host files with the same names are overwritten.
    #[instrument(skip(self, folder), fields(dir = %self.name(), folder = %folder.as_ref().display()))]
    pub fn export_folder(&self, folder: impl AsRef<Path>) -> VfsResult<()> {
        let folder = folder.as_ref();
        if folder.exists() && !folder.is_dir() {
            return Err(VfsError::not_a_directory(folder.display().to_string()));
        }
        self.core().check_alive()?;

        let locks = self.lock_down(LockMode::Read)?;
        let storage = self.storage();
        let exported = export_into(self, folder, storage.as_deref())?;
        drop(locks);

        debug!("exported {} files to {}", exported, folder.display());
        Ok(())
    }
}

/// Take write locks on every directory the import touches and reject file
/// collisions before anything is written.
fn plan_folder(target: &VirtualDirectory, folder: &Path, locks: &mut LockSet) -> VfsResult<()> {
    locks.push(target.lock_dirs(LockMode::Write)?);
    locks.push(target.lock_files(LockMode::Write)?);
    target.core().check_alive()?;

    let listing = HostListing::read(folder)?;
    for (name, _) in &listing.files {
        validate_name(name)?;
        if target.contains_file(name, None) {
            return Err(VfsError::not_unique(name.clone()));
        }
    }
    for (name, path) in &listing.dirs {
        if let Some(existing) = target.find_directory_unlocked(name) {
            plan_folder(&existing, path, locks)?;
        }
    }
    Ok(())
}

fn apply_folder(
    target: &VirtualDirectory,
    folder: &Path,
    storage: &Arc<StorageContext>,
) -> VfsResult<usize> {
    let listing = HostListing::read(folder)?;
    let mut imported = 0;

    for (name, path) in &listing.dirs {
        match target.find_directory_unlocked(name) {
            Some(existing) => imported += apply_folder(&existing, path, storage)?,
            None => {
                let dir = VirtualDirectory::child_of(name, target.node())?;
                match apply_folder(&dir, path, storage) {
                    Ok(count) => imported += count,
                    Err(e) => {
                        dir.discard_contents(Some(storage));
                        return Err(e);
                    }
                }
                target.attach_dir(dir);
            }
        }
    }
    for (name, path) in &listing.files {
        // The host may have gained a same-named file since planning.
        if target.contains_file(name, None) {
            return Err(VfsError::not_unique(name.clone()));
        }
        target.attach_file(read_host_file(path, name, target.node(), storage)?);
        imported += 1;
    }
    Ok(imported)
}

fn read_host_file(
    path: &Path,
    name: &str,
    parent: &Arc<DirectoryNode>,
    storage: &StorageContext,
) -> VfsResult<VirtualFile> {
    let meta = fs::metadata(path)?;
    let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
    let created = meta.created().unwrap_or(modified);

    let head = if meta.len() == 0 {
        NO_BLOCK
    } else {
        let mut source = fs::File::open(path)?;
        let mut stream =
            VirtualStream::open(storage.store().clone(), NO_BLOCK, AccessMode::ReadWrite)?;
        io::copy(&mut source, &mut stream)?;
        stream.close()?.head
    };
    VirtualFile::create(name, parent, created, modified, head)
}

fn export_into(
    dir: &VirtualDirectory,
    folder: &Path,
    storage: Option<&StorageContext>,
) -> VfsResult<usize> {
    fs::create_dir_all(folder)?;
    let mut exported = 0;

    for child in dir.directories_unlocked() {
        exported += export_into(&child, &folder.join(child.name()), storage)?;
    }
    for file in dir.files_unlocked() {
        let path = folder.join(file.name());
        let mut out = fs::File::create(&path)?;
        let head = file.head_block_position();
        if head != NO_BLOCK {
            let storage = storage.ok_or_else(|| VfsError::no_storage_context(file.name()))?;
            let mut stream =
                VirtualStream::open(storage.store().clone(), head, AccessMode::ReadOnly)?;
            io::copy(&mut stream, &mut out)?;
        }
        if let Err(e) = out.set_modified(file.modified_at()) {
            warn!("could not set mtime on {}: {}", path.display(), e);
        }
        exported += 1;
    }
    Ok(exported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;

    fn container(dir: &tempfile::TempDir) -> Container {
        let config = crate::ContainerConfig::new()
            .with_block_size(64)
            .with_os_locks(false);
        Container::open_with(dir.path().join("host.kkr"), &config).unwrap()
    }

    #[test]
    fn test_listing_is_sorted_and_split() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("b")).unwrap();
        fs::create_dir(tmp.path().join("a")).unwrap();
        fs::write(tmp.path().join("z.txt"), b"z").unwrap();
        fs::write(tmp.path().join("y.txt"), b"y").unwrap();

        let listing = HostListing::read(tmp.path()).unwrap();
        let dirs: Vec<_> = listing.dirs.iter().map(|(n, _)| n.as_str()).collect();
        let files: Vec<_> = listing.files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(dirs, ["a", "b"]);
        assert_eq!(files, ["y.txt", "z.txt"]);
    }

    #[test]
    fn test_import_file_keeps_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().join("notes.txt");
        fs::write(&host, b"remember the milk").unwrap();

        let c = container(&tmp);
        let file = c.root().import_file(&host).unwrap();
        assert_eq!(file.name(), "notes.txt");
        assert_eq!(file.len().unwrap(), 17);

        let mut handle = file.open(AccessMode::ReadOnly).unwrap();
        assert_eq!(handle.read_to_end().unwrap(), b"remember the milk");
        handle.close().unwrap();

        assert!(matches!(
            c.root().import_file(&host),
            Err(VfsError::NotUnique(_))
        ));
    }

    #[test]
    fn test_import_file_rejects_folders() {
        let tmp = tempfile::tempdir().unwrap();
        let c = container(&tmp);
        assert!(matches!(
            c.root().import_file(tmp.path()),
            Err(VfsError::NotFound(_))
        ));
        assert!(matches!(
            c.root().import_folder(tmp.path().join("missing")),
            Err(VfsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_empty_host_file_has_no_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().join("empty");
        fs::write(&host, b"").unwrap();

        let c = container(&tmp);
        let file = c.root().import_file(&host).unwrap();
        assert_eq!(file.head_block_position(), NO_BLOCK);
    }
}
