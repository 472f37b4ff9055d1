//! Open file handles.

use std::io;
use std::sync::Arc;

use kakera_blocks::{AccessMode, VirtualStream};
use tracing::warn;

use crate::container::StorageContext;
use crate::error::{VfsError, VfsResult};
use crate::file::VirtualFile;
use crate::lock::LockGuard;
use crate::node::VfsNode;

/// An open file: the content stream plus the content lock that guards it.
///
/// `close()` publishes the new head position and modification time to the
/// file, releases the lock and persists the tree. Dropping an unclosed handle
/// does the same and logs failures.
#[derive(Debug)]
pub struct FileHandle {
    file: VirtualFile,
    stream: Option<VirtualStream>,
    guard: Option<LockGuard>,
    storage: Arc<StorageContext>,
}

impl FileHandle {
    pub(crate) fn new(
        file: VirtualFile,
        stream: VirtualStream,
        guard: LockGuard,
        storage: Arc<StorageContext>,
    ) -> Self {
        Self {
            file,
            stream: Some(stream),
            guard: Some(guard),
            storage,
        }
    }

    /// The file this handle was opened on.
    pub fn file(&self) -> &VirtualFile {
        &self.file
    }

    pub fn mode(&self) -> VfsResult<AccessMode> {
        Ok(self.stream_ref()?.mode())
    }

    pub fn len(&self) -> VfsResult<u64> {
        Ok(self.stream_ref()?.len())
    }

    pub fn is_empty(&self) -> VfsResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn position(&self) -> VfsResult<u64> {
        Ok(self.stream_ref()?.position())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        Ok(self.stream_mut()?.read_bytes(buf)?)
    }

    pub fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        Ok(self.stream_mut()?.write_bytes(data)?)
    }

    /// Move to `position`, clamped to the length. Negative is `InvalidOffset`.
    pub fn seek(&mut self, position: i64) -> VfsResult<u64> {
        Ok(self.stream_mut()?.seek_to(position)?)
    }

    pub fn set_length(&mut self, len: u64) -> VfsResult<()> {
        Ok(self.stream_mut()?.set_length(len)?)
    }

    pub fn flush(&mut self) -> VfsResult<()> {
        Ok(self.stream_mut()?.flush()?)
    }

    /// Read everything from the current position to the end.
    pub fn read_to_end(&mut self) -> VfsResult<Vec<u8>> {
        let stream = self.stream_mut()?;
        let remaining = stream.len().saturating_sub(stream.position());
        let mut out = vec![0u8; remaining as usize];
        let n = stream.read_bytes(&mut out)?;
        out.truncate(n);
        Ok(out)
    }

    pub fn close(mut self) -> VfsResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> VfsResult<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };

        let closed = stream.close();
        if let Ok(summary) = &closed {
            self.file.publish(summary.head, summary.modified);
        }
        // Release the content lock before persisting so the tree can be read.
        drop(self.guard.take());
        let summary = closed?;

        if summary.modified || self.storage.is_pending() {
            if let Some(parent) = self.file.parent() {
                parent.persist_tree()?;
            }
        }
        Ok(())
    }

    fn stream_ref(&self) -> VfsResult<&VirtualStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| VfsError::Io(io::Error::other("handle is closed")))
    }

    fn stream_mut(&mut self) -> VfsResult<&mut VirtualStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| VfsError::Io(io::Error::other("handle is closed")))
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("failed to close {}: {}", self.file.name(), e);
        }
    }
}

impl io::Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(FileHandle::read(self, buf)?)
    }
}

impl io::Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(FileHandle::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(FileHandle::flush(self)?)
    }
}

impl io::Seek for FileHandle {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let stream = self.stream_mut()?;
        Ok(io::Seek::seek(stream, pos)?)
    }
}
