//! Random-access byte stream over one block chain.
//!
//! A stream keeps exactly one block's payload in memory. Reads and writes work
//! on that buffer; crossing a block boundary flushes it through the
//! [`BlockStore`] and loads (or starts) the next block.

use std::io;
use std::sync::Arc;

use tracing::trace;

use crate::error::{BlockError, BlockResult};
use crate::layout::{block_ptr, Geometry, NO_BLOCK};
use crate::store::BlockStore;

/// How a stream may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn is_writable(self) -> bool {
        matches!(self, AccessMode::ReadWrite)
    }
}

/// What a closed stream reports back to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    /// Head block position, or `-1` for an empty stream.
    pub head: i64,
    /// Logical length at close.
    pub len: u64,
    /// Whether anything was written or truncated.
    pub modified: bool,
}

/// Where the buffered block sits in the chain.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    /// Physical position, `None` while the block is not allocated yet.
    block: Option<u64>,
    /// Previous block in the chain.
    prev: Option<u64>,
    /// Logical offset of the block's first payload byte.
    start: u64,
    /// Raw next pointer read from the block header.
    next: i64,
}

impl Cursor {
    fn unallocated(prev: Option<u64>, start: u64) -> Self {
        Self {
            block: None,
            prev,
            start,
            next: NO_BLOCK,
        }
    }

    fn is_head(&self) -> bool {
        self.start == 0
    }
}

/// A virtual file's content, addressed by logical offset.
#[derive(Debug)]
pub struct VirtualStream {
    store: Arc<BlockStore>,
    geometry: Geometry,
    mode: AccessMode,
    head: Option<u64>,
    size: u64,
    position: u64,
    cursor: Cursor,
    buffer: Vec<u8>,
    dirty: bool,
    modified: bool,
}

impl VirtualStream {
    /// Open the chain starting at `head` (`-1` for an empty stream).
    pub fn open(store: Arc<BlockStore>, head: i64, mode: AccessMode) -> BlockResult<Self> {
        let geometry = store.geometry();
        let head = block_ptr(head);
        let size = match head {
            Some(head) => store.read_head_meta(head)?.size,
            None => 0,
        };

        let mut stream = Self {
            store,
            geometry,
            mode,
            head,
            size,
            position: 0,
            cursor: Cursor::unallocated(None, 0),
            buffer: Vec::new(),
            dirty: false,
            modified: false,
        };
        stream.load_head()?;
        Ok(stream)
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Head block position, or `-1` while the stream is empty.
    pub fn head(&self) -> i64 {
        self.head.map_or(NO_BLOCK, |head| head as i64)
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Read up to `out.len()` bytes at the current position.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> BlockResult<usize> {
        let mut read = 0;
        while read < out.len() && self.position < self.size {
            let end = self.block_end();
            if self.position == end {
                self.advance()?;
                continue;
            }
            let offset = (self.position - self.cursor.start) as usize;
            let n = (end - self.position)
                .min(self.size - self.position)
                .min((out.len() - read) as u64) as usize;
            out[read..read + n].copy_from_slice(&self.buffer[offset..offset + n]);
            self.position += n as u64;
            read += n;
        }
        Ok(read)
    }

    /// Write `data` at the current position, extending the stream as needed.
    pub fn write_bytes(&mut self, data: &[u8]) -> BlockResult<usize> {
        if !self.mode.is_writable() {
            return Err(BlockError::ReadOnly);
        }

        let mut written = 0;
        while written < data.len() {
            let end = self.block_end();
            if self.position == end {
                self.advance()?;
                continue;
            }
            let offset = (self.position - self.cursor.start) as usize;
            let n = ((end - self.position) as usize).min(data.len() - written);
            self.buffer[offset..offset + n].copy_from_slice(&data[written..written + n]);
            self.position += n as u64;
            self.size = self.size.max(self.position);
            self.dirty = true;
            self.modified = true;
            written += n;
        }
        Ok(written)
    }

    /// Move to `target`, clamped to the stream length.
    pub fn seek_to(&mut self, target: i64) -> BlockResult<u64> {
        if target < 0 {
            return Err(BlockError::InvalidOffset(target));
        }
        let target = (target as u64).min(self.size);
        self.flush_block()?;

        if target < self.cursor.start || target > self.block_end() {
            self.walk_to(target)?;
        }
        self.position = target;
        Ok(target)
    }

    /// Grow with zero bytes or shrink to `len`. Leaves the position at `len`.
    pub fn set_length(&mut self, len: u64) -> BlockResult<()> {
        if !self.mode.is_writable() {
            return Err(BlockError::ReadOnly);
        }

        if len > self.size {
            let zeros = vec![0u8; self.geometry.block_size() as usize];
            self.seek_to(self.size as i64)?;
            while self.size < len {
                let n = (len - self.size).min(zeros.len() as u64) as usize;
                self.write_bytes(&zeros[..n])?;
            }
            self.flush_block()?;
            return Ok(());
        }
        if len == self.size {
            self.seek_to(len as i64)?;
            return Ok(());
        }

        self.flush_block()?;
        if len == 0 {
            if let Some(head) = self.head.take() {
                self.store.free_chain(head)?;
            }
            self.size = 0;
            self.load_head()?;
        } else {
            // Land on the block that holds the new last byte. A plain seek may
            // stay on the previous block when `len - 1` sits on its end.
            self.walk_to(len - 1)?;
            let (Some(head), Some(block)) = (self.head, self.cursor.block) else {
                return Err(BlockError::corrupt(0, "truncating an unallocated chain"));
            };
            let used = len - self.cursor.start;
            self.store.truncate_after(head, block, used, len)?;
            self.size = len;
            self.cursor.next = NO_BLOCK;
            self.buffer[used as usize..].fill(0);
        }
        self.position = len;
        self.modified = true;
        trace!("stream {} truncated to {}", self.head(), len);
        Ok(())
    }

    /// Write the buffered block out if it is dirty.
    pub fn flush(&mut self) -> BlockResult<()> {
        self.flush_block()
    }

    /// Flush and report the chain's head and whether it changed.
    pub fn close(mut self) -> BlockResult<StreamSummary> {
        self.flush_block()?;
        Ok(self.summary())
    }

    /// Current head, length and modification state.
    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            head: self.head(),
            len: self.size,
            modified: self.modified,
        }
    }

    // ========================================================================
    // Block navigation
    // ========================================================================

    fn capacity(&self) -> u64 {
        self.geometry.capacity(self.cursor.is_head())
    }

    /// Logical offset one past the buffered block.
    fn block_end(&self) -> u64 {
        self.cursor.start + self.capacity()
    }

    fn load_head(&mut self) -> BlockResult<()> {
        self.position = 0;
        match self.head {
            Some(head) => self.load_block(head, None, 0),
            None => {
                self.start_unallocated(None, 0);
                Ok(())
            }
        }
    }

    fn start_unallocated(&mut self, prev: Option<u64>, start: u64) {
        self.cursor = Cursor::unallocated(prev, start);
        let capacity = self.capacity() as usize;
        self.buffer.clear();
        self.buffer.resize(capacity, 0);
    }

    fn load_block(&mut self, block: u64, prev: Option<u64>, start: u64) -> BlockResult<()> {
        let header = self.store.read_block_header(block)?;
        if header.is_free() {
            return Err(BlockError::corrupt(block, "chain points at a free block"));
        }

        self.cursor = Cursor {
            block: Some(block),
            prev,
            start,
            next: header.next,
        };
        let capacity = self.capacity();
        let valid = capacity.min(self.size.saturating_sub(start)) as usize;
        self.buffer.clear();
        self.buffer.resize(capacity as usize, 0);
        self.store
            .read_payload(block, self.cursor.is_head(), &mut self.buffer[..valid])?;
        Ok(())
    }

    /// Move the buffer to the block following the current one.
    fn advance(&mut self) -> BlockResult<()> {
        self.flush_block()?;
        let prev = self.cursor.block;
        let start = self.block_end();
        match block_ptr(self.cursor.next) {
            Some(next) => self.load_block(next, prev, start),
            None => {
                if prev.is_none() {
                    return Err(BlockError::corrupt(0, "advancing past an unallocated block"));
                }
                self.start_unallocated(prev, start);
                Ok(())
            }
        }
    }

    /// Walk from the head to the block holding `target`, following headers only.
    fn walk_to(&mut self, target: u64) -> BlockResult<()> {
        let Some(head) = self.head else {
            return self.load_head();
        };

        let mut block = head;
        let mut prev = None;
        let mut start = 0u64;
        loop {
            let header = self.store.read_block_header(block)?;
            let end = start + self.geometry.capacity(start == 0);
            match block_ptr(header.next) {
                Some(next) if target >= end => {
                    if end > self.size {
                        return Err(BlockError::corrupt(block, "chain longer than its size"));
                    }
                    prev = Some(block);
                    block = next;
                    start = end;
                }
                _ => break,
            }
        }
        self.load_block(block, prev, start)
    }

    fn flush_block(&mut self) -> BlockResult<()> {
        if !self.dirty {
            return Ok(());
        }

        let used = self.capacity().min(self.size - self.cursor.start) as usize;
        let payload = &self.buffer[..used];
        match self.cursor.block {
            Some(block) => {
                let head = self.head.unwrap_or(block);
                self.store.overwrite_block(head, block, payload, self.size)?;
            }
            None => {
                let tail = self.head.zip(self.cursor.prev);
                let pos = self.store.append_block(tail, payload, self.size)?;
                if self.head.is_none() {
                    self.head = Some(pos);
                }
                self.cursor.block = Some(pos);
                self.cursor.next = NO_BLOCK;
            }
        }
        self.dirty = false;
        Ok(())
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        if let Err(e) = self.flush_block() {
            tracing::warn!("failed to flush stream {} on drop: {}", self.head(), e);
        }
    }
}

impl io::Read for VirtualStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_bytes(buf)?)
    }
}

impl io::Write for VirtualStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_bytes(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.flush_block()?)
    }
}

impl io::Seek for VirtualStream {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(n) => i64::try_from(n).unwrap_or(i64::MAX),
            io::SeekFrom::End(delta) => (self.size as i64).saturating_add(delta),
            io::SeekFrom::Current(delta) => (self.position as i64).saturating_add(delta),
        };
        Ok(self.seek_to(target)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn store(block_size: u64) -> (tempfile::TempDir, Arc<BlockStore>) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new().with_block_size(block_size);
        let store = BlockStore::open(dir.path().join("container"), &config).unwrap();
        (dir, Arc::new(store))
    }

    fn read_all(store: &Arc<BlockStore>, head: i64) -> Vec<u8> {
        let mut stream = VirtualStream::open(store.clone(), head, AccessMode::ReadOnly).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_empty_stream_has_no_chain() {
        let (_dir, store) = store(32);
        let stream = VirtualStream::open(store.clone(), -1, AccessMode::ReadWrite).unwrap();
        let summary = stream.close().unwrap();
        assert_eq!(summary, StreamSummary { head: -1, len: 0, modified: false });
        assert_eq!(store.file_len().unwrap(), 8);
    }

    #[test]
    fn test_multi_block_roundtrip() {
        let (_dir, store) = store(32);
        let data: Vec<u8> = (0..200u8).collect();

        let mut stream = VirtualStream::open(store.clone(), -1, AccessMode::ReadWrite).unwrap();
        stream.write_all(&data).unwrap();
        let summary = stream.close().unwrap();
        assert_eq!(summary.head, 8);
        assert_eq!(summary.len, 200);
        assert!(summary.modified);

        assert_eq!(read_all(&store, summary.head), data);
        // 16 bytes in the head, 32 in each following block
        assert_eq!(store.stats().unwrap().blocks, 1 + 6);
    }

    #[test]
    fn test_seek_and_overwrite_in_middle() {
        let (_dir, store) = store(32);
        let mut stream = VirtualStream::open(store.clone(), -1, AccessMode::ReadWrite).unwrap();
        stream.write_all(&[b'a'; 100]).unwrap();
        stream.seek(SeekFrom::Start(40)).unwrap();
        stream.write_all(b"XYZ").unwrap();
        assert_eq!(stream.len(), 100);

        stream.seek(SeekFrom::Start(38)).unwrap();
        let mut window = [0u8; 7];
        stream.read_exact(&mut window).unwrap();
        assert_eq!(&window, b"aaXYZaa");
        let head = stream.close().unwrap().head;

        let content = read_all(&store, head);
        assert_eq!(content.len(), 100);
        assert_eq!(&content[40..43], b"XYZ");
    }

    #[test]
    fn test_seek_clamps_to_length() {
        let (_dir, store) = store(32);
        let mut stream = VirtualStream::open(store, -1, AccessMode::ReadWrite).unwrap();
        stream.write_all(b"hello").unwrap();
        assert_eq!(stream.seek_to(1000).unwrap(), 5);
        assert_eq!(stream.seek(SeekFrom::End(10)).unwrap(), 5);
        assert_eq!(stream.len(), 5);
    }

    #[test]
    fn test_negative_seek_rejected() {
        let (_dir, store) = store(32);
        let mut stream = VirtualStream::open(store, -1, AccessMode::ReadWrite).unwrap();
        assert!(matches!(stream.seek_to(-1), Err(BlockError::InvalidOffset(-1))));
        let err = stream.seek(SeekFrom::Current(-3)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let (_dir, store) = store(32);
        let mut stream = VirtualStream::open(store, -1, AccessMode::ReadOnly).unwrap();
        assert!(matches!(stream.write_bytes(b"x"), Err(BlockError::ReadOnly)));
        assert!(matches!(stream.set_length(4), Err(BlockError::ReadOnly)));
    }

    #[test]
    fn test_grow_with_zeros() {
        let (_dir, store) = store(32);
        let mut stream = VirtualStream::open(store.clone(), -1, AccessMode::ReadWrite).unwrap();
        stream.write_all(b"abc").unwrap();
        stream.set_length(70).unwrap();
        assert_eq!(stream.position(), 70);
        let head = stream.close().unwrap().head;

        let content = read_all(&store, head);
        assert_eq!(content.len(), 70);
        assert_eq!(&content[..3], b"abc");
        assert!(content[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_shrink_frees_tail_blocks() {
        let (_dir, store) = store(32);
        let mut stream = VirtualStream::open(store.clone(), -1, AccessMode::ReadWrite).unwrap();
        stream.write_all(&[7u8; 150]).unwrap();
        stream.set_length(20).unwrap();
        assert_eq!(stream.len(), 20);
        assert_eq!(stream.position(), 20);
        let head = stream.close().unwrap().head;

        assert_eq!(read_all(&store, head), vec![7u8; 20]);
        let stats = store.stats().unwrap();
        // head + the block holding bytes 16..20 stay in use
        assert_eq!(stats.blocks - stats.free_blocks, 2);
    }

    #[test]
    fn test_shrink_then_grow_reads_zeros() {
        let (_dir, store) = store(32);
        let mut stream = VirtualStream::open(store.clone(), -1, AccessMode::ReadWrite).unwrap();
        stream.write_all(&[9u8; 60]).unwrap();
        stream.set_length(10).unwrap();
        stream.set_length(30).unwrap();
        let head = stream.close().unwrap().head;

        let content = read_all(&store, head);
        assert_eq!(&content[..10], &[9u8; 10]);
        assert_eq!(&content[10..], &[0u8; 20]);
    }

    #[test]
    fn test_shrink_from_head_onto_next_block() {
        let (_dir, store) = store(32);
        let data: Vec<u8> = (1..=40u8).collect();
        let mut stream = VirtualStream::open(store.clone(), -1, AccessMode::ReadWrite).unwrap();
        stream.write_all(&data).unwrap();
        stream.seek_to(0).unwrap();
        stream.set_length(17).unwrap();
        assert_eq!(stream.position(), 17);
        let head = stream.close().unwrap().head;

        assert_eq!(read_all(&store, head), &data[..17]);
        let stats = store.stats().unwrap();
        assert_eq!(stats.blocks - stats.free_blocks, 2);
    }

    /// Blocks a chain of `len` bytes needs with 32-byte blocks.
    fn blocks_for(len: u64) -> u64 {
        if len <= 16 { 1 } else { 1 + (len - 16).div_ceil(32) }
    }

    #[test]
    fn test_shrink_at_block_edges() {
        let data: Vec<u8> = (0..120u8).collect();
        // Head holds 0..16, then 16..48, 48..80, 80..112, 112..120.
        for len in [1u64, 15, 16, 17, 47, 48, 49, 79, 80, 81, 112, 113] {
            for start in [0i64, 16, 47, 48, 120] {
                let (_dir, store) = store(32);
                let mut stream =
                    VirtualStream::open(store.clone(), -1, AccessMode::ReadWrite).unwrap();
                stream.write_all(&data).unwrap();
                stream.seek_to(start).unwrap();
                stream.set_length(len).unwrap();

                // Appending after the cut continues the chain cleanly.
                stream.write_all(&[0xEE]).unwrap();
                let head = stream.close().unwrap().head;

                let mut expected = data[..len as usize].to_vec();
                expected.push(0xEE);
                assert_eq!(read_all(&store, head), expected, "len {len} from {start}");
                let stats = store.stats().unwrap();
                assert_eq!(
                    stats.blocks - stats.free_blocks,
                    blocks_for(len + 1),
                    "len {len} from {start}"
                );
            }
        }
    }

    #[test]
    fn test_truncate_to_zero_frees_chain() {
        let (_dir, store) = store(32);
        let mut stream = VirtualStream::open(store.clone(), -1, AccessMode::ReadWrite).unwrap();
        stream.write_all(&[1u8; 80]).unwrap();
        stream.set_length(0).unwrap();
        let summary = stream.close().unwrap();
        assert_eq!(summary.head, -1);
        assert!(summary.modified);

        let stats = store.stats().unwrap();
        assert_eq!(stats.free_blocks, stats.blocks);
    }
}
