//! Block store: one physical container file seen as a sequence of blocks.
//!
//! # Concurrency Model
//!
//! - Positional reads and writes on a shared `File`, no seek state
//! - Every physical write happens under a byte-range lock ([`RangeLocks`])
//! - Lock conflicts inside the store are retried, never surfaced
//! - The free-block scan cursor is shared by every stream of the container
//!
//! Free blocks are found by a linear scan from the cursor. The cursor only
//! moves forward past blocks that are confirmed in use and is rewound when a
//! block below it is freed, so allocation is first-fit. Heavy fragmentation
//! makes allocation O(blocks).

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::StoreConfig;
use crate::error::{BlockError, BlockResult};
use crate::layout::{
    block_ptr, BlockHeader, Geometry, HeadMeta, BLOCK_HEADER_LEN, CONTAINER_HEADER_LEN,
    FIRST_BLOCK, FREE_MARKER, HEAD_META_LEN, MIN_BLOCK_SIZE, NO_BLOCK,
};
use crate::range_lock::{RangeGuard, RangeLocks};

/// Full image of one block, as handed to [`BlockStore::write_block`].
#[derive(Debug, Clone, Copy)]
pub struct BlockImage<'a> {
    pub header: BlockHeader,
    /// Present for head blocks only.
    pub meta: Option<HeadMeta>,
    /// Payload bytes; shorter payloads are zero-padded to the block capacity.
    pub payload: &'a [u8],
}

/// Container statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Body size of each block.
    pub block_size: u64,
    /// Physical blocks in the container, used or free.
    pub blocks: u64,
    /// Tombstoned blocks available for reuse.
    pub free_blocks: u64,
    /// Container file length in bytes.
    pub file_len: u64,
}

/// A container file managed as fixed-size blocks.
#[derive(Debug)]
pub struct BlockStore {
    file: File,
    path: PathBuf,
    geometry: Geometry,
    free_cursor: Mutex<u64>,
    locks: RangeLocks,
}

impl BlockStore {
    /// Open a container, creating it and writing its header when the file is
    /// shorter than the header.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> BlockResult<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let locks = Self::range_locks(&file, config.os_locks);
        let block_size = {
            let _header = lock_range(&locks, 0, CONTAINER_HEADER_LEN)?;
            if file.metadata()?.len() < CONTAINER_HEADER_LEN {
                file.set_len(0)?;
                pio::write_all_at(&file, &(config.block_size as i64).to_be_bytes(), 0)?;
                debug!(
                    "initialised container {} with block size {}",
                    path.display(),
                    config.block_size
                );
                config.block_size
            } else {
                let mut raw = [0u8; 8];
                pio::read_exact_at(&file, &mut raw, 0)?;
                let size = i64::from_be_bytes(raw);
                if size < MIN_BLOCK_SIZE as i64 {
                    return Err(BlockError::corrupt(0, format!("block size {size} in header")));
                }
                size as u64
            }
        };

        Ok(Self {
            file,
            path,
            geometry: Geometry::new(block_size),
            free_cursor: Mutex::new(FIRST_BLOCK),
            locks,
        })
    }

    #[cfg(unix)]
    fn range_locks(file: &File, os_locks: bool) -> RangeLocks {
        use std::os::unix::io::AsRawFd;
        if os_locks {
            RangeLocks::with_os_locks(file.as_raw_fd())
        } else {
            RangeLocks::in_process()
        }
    }

    #[cfg(not(unix))]
    fn range_locks(_file: &File, _os_locks: bool) -> RangeLocks {
        RangeLocks::in_process()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> u64 {
        self.geometry.block_size()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Current length of the container file.
    pub fn file_len(&self) -> BlockResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    // ========================================================================
    // Raw block access
    // ========================================================================

    /// Read the end-marker and next pointer of the block at `pos`.
    pub fn read_block_header(&self, pos: u64) -> BlockResult<BlockHeader> {
        self.check_block_offset(pos)?;
        let mut buf = [0u8; BLOCK_HEADER_LEN as usize];
        pio::read_exact_at(&self.file, &mut buf, pos).map_err(|e| eof_as_corrupt(e, pos))?;
        Ok(BlockHeader::decode(&buf))
    }

    /// Read the size and last-block pointer stored in a head block.
    pub fn read_head_meta(&self, head: u64) -> BlockResult<HeadMeta> {
        self.check_block_offset(head)?;
        let mut buf = [0u8; HEAD_META_LEN as usize];
        let offset = self.geometry.head_meta_offset(head);
        pio::read_exact_at(&self.file, &mut buf, offset).map_err(|e| eof_as_corrupt(e, head))?;
        Ok(HeadMeta::decode(&buf))
    }

    /// Fill `buf` with the payload of a block. `buf` may be shorter than the
    /// block capacity.
    pub fn read_payload(&self, block: u64, is_head: bool, buf: &mut [u8]) -> BlockResult<()> {
        debug_assert!(buf.len() as u64 <= self.geometry.capacity(is_head));
        let offset = self.geometry.payload_start(block, is_head);
        pio::read_exact_at(&self.file, buf, offset).map_err(|e| eof_as_corrupt(e, block))?;
        Ok(())
    }

    /// Write a whole block without taking any lock.
    ///
    /// Callers are responsible for holding the block's range.
    pub fn write_block(&self, pos: u64, image: &BlockImage<'_>) -> BlockResult<()> {
        self.check_block_offset(pos)?;
        let is_head = image.meta.is_some();
        let capacity = self.geometry.capacity(is_head) as usize;
        if image.payload.len() > capacity {
            return Err(BlockError::corrupt(
                pos,
                format!("payload of {} bytes exceeds capacity {}", image.payload.len(), capacity),
            ));
        }

        let mut buf = Vec::with_capacity(self.geometry.stride() as usize);
        buf.extend_from_slice(&image.header.encode());
        if let Some(meta) = &image.meta {
            buf.extend_from_slice(&meta.encode());
        }
        buf.extend_from_slice(image.payload);
        buf.resize(self.geometry.stride() as usize, 0);

        pio::write_all_at(&self.file, &buf, pos)?;
        Ok(())
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Find the first free block at or after the scan cursor.
    ///
    /// Returns either a tombstoned block or the end of the file. The cursor is
    /// left on the returned position, it only moves past blocks in use.
    pub fn find_free_block(&self) -> BlockResult<u64> {
        let mut cursor = self.free_cursor.lock();
        let len = self.file_len()?;
        loop {
            if *cursor + BLOCK_HEADER_LEN > len {
                return Ok(*cursor);
            }
            if self.read_block_header(*cursor)?.is_free() {
                return Ok(*cursor);
            }
            *cursor += self.geometry.stride();
        }
    }

    /// Whether a block position is free or past the end of the file.
    fn is_unclaimed(&self, pos: u64) -> BlockResult<bool> {
        if pos + BLOCK_HEADER_LEN > self.file_len()? {
            return Ok(true);
        }
        Ok(self.read_block_header(pos)?.is_free())
    }

    /// Allocate a block, fill it and link it at the end of a chain.
    ///
    /// With `tail == None` the block becomes the head of a new chain and
    /// carries `size` in its metadata. Otherwise `tail` is `(head, prev)`: the
    /// chain's head block and its current last block. Returns the new block's
    /// position.
    pub fn append_block(
        &self,
        tail: Option<(u64, u64)>,
        payload: &[u8],
        size: u64,
    ) -> BlockResult<u64> {
        let is_head = tail.is_none();
        let used = payload.len() as u64;
        let mut attempts = 0u64;

        loop {
            attempts += 1;
            let pos = self.find_free_block()?;

            let Some(_block) = self.locks.try_lock(pos, self.geometry.stride())? else {
                thread::yield_now();
                continue;
            };
            if !self.is_unclaimed(pos)? {
                // Someone else claimed it between the scan and the lock.
                continue;
            }

            let _links = match tail {
                Some((head, prev)) => {
                    let Some(next_field) = self.locks.try_lock(self.geometry.next_offset(prev), 8)?
                    else {
                        thread::yield_now();
                        continue;
                    };
                    let Some(meta_field) =
                        self.locks.try_lock(self.geometry.head_meta_offset(head), HEAD_META_LEN)?
                    else {
                        thread::yield_now();
                        continue;
                    };
                    Some((next_field, meta_field))
                }
                None => None,
            };

            let header = BlockHeader {
                end: self.geometry.end_marker(pos, is_head, used),
                next: NO_BLOCK,
            };
            let meta = is_head.then_some(HeadMeta {
                size,
                last: pos as i64,
            });
            self.write_block(pos, &BlockImage { header, meta, payload })?;

            if let Some((head, prev)) = tail {
                self.write_i64(self.geometry.next_offset(prev), pos as i64)?;
                self.write_head_meta(head, &HeadMeta { size, last: pos as i64 })?;
            }

            if attempts > 1 {
                trace!("allocated block {} after {} attempts", pos, attempts);
            }
            debug!(
                "allocated {} block {} ({} bytes)",
                if is_head { "head" } else { "chain" },
                pos,
                used
            );
            return Ok(pos);
        }
    }

    /// Rewrite the payload of a block the caller's chain already owns and
    /// publish the stream size in the head block.
    pub fn overwrite_block(
        &self,
        head: u64,
        block: u64,
        payload: &[u8],
        size: u64,
    ) -> BlockResult<()> {
        let is_head = head == block;
        let used = payload.len() as u64;
        let _guards = self.lock_block_and_meta(head, block)?;

        let end = self.geometry.end_marker(block, is_head, used);
        let current = self.read_block_header(block)?;
        if current.is_free() {
            return Err(BlockError::corrupt(block, "overwriting a free block"));
        }
        if end > current.end {
            self.write_i64(block, end)?;
        }
        pio::write_all_at(&self.file, payload, self.geometry.payload_start(block, is_head))?;
        self.write_i64(self.geometry.head_meta_offset(head), size as i64)?;
        Ok(())
    }

    /// Cut a chain after `keep`, which becomes the last block holding `used`
    /// payload bytes, record `size` in the head and free the remainder.
    ///
    /// Returns the number of blocks freed.
    pub fn truncate_after(&self, head: u64, keep: u64, used: u64, size: u64) -> BlockResult<u64> {
        let is_head = head == keep;
        let rest = {
            let _guards = self.lock_block_and_meta(head, keep)?;
            let current = self.read_block_header(keep)?;
            let header = BlockHeader {
                end: self.geometry.end_marker(keep, is_head, used),
                next: NO_BLOCK,
            };
            pio::write_all_at(&self.file, &header.encode(), keep)?;
            self.write_head_meta(
                head,
                &HeadMeta {
                    size,
                    last: keep as i64,
                },
            )?;
            block_ptr(current.next)
        };

        match rest {
            Some(next) => self.free_chain(next),
            None => Ok(0),
        }
    }

    /// Tombstone every block from `pos` to the end of its chain.
    ///
    /// Returns the number of blocks freed.
    pub fn free_chain(&self, pos: u64) -> BlockResult<u64> {
        let limit = self.file_len()? / self.geometry.stride() + 1;
        let mut current = Some(pos);
        let mut freed = 0u64;

        while let Some(block) = current {
            let header = {
                let _field = lock_range(&self.locks, block, BLOCK_HEADER_LEN)?;
                let header = self.read_block_header(block)?;
                if header.is_free() {
                    return Err(BlockError::corrupt(block, "chain runs into a free block"));
                }
                self.write_i64(block, FREE_MARKER)?;
                header
            };

            let mut cursor = self.free_cursor.lock();
            if block < *cursor {
                *cursor = block;
            }
            drop(cursor);

            freed += 1;
            if freed > limit {
                return Err(BlockError::corrupt(pos, "chain does not terminate"));
            }
            current = block_ptr(header.next);
        }

        debug!("freed {} block(s) starting at {}", freed, pos);
        Ok(freed)
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Walk every physical block and count the free ones.
    pub fn stats(&self) -> BlockResult<StoreStats> {
        let file_len = self.file_len()?;
        let stride = self.geometry.stride();
        let mut stats = StoreStats {
            block_size: self.block_size(),
            file_len,
            ..StoreStats::default()
        };

        let mut pos = FIRST_BLOCK;
        while pos + BLOCK_HEADER_LEN <= file_len {
            stats.blocks += 1;
            if self.read_block_header(pos)?.is_free() {
                stats.free_blocks += 1;
            }
            pos += stride;
        }
        Ok(stats)
    }

    /// Flush file data to the device.
    pub fn sync(&self) -> BlockResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn check_block_offset(&self, pos: u64) -> BlockResult<()> {
        if !self.geometry.is_block_offset(pos) {
            return Err(BlockError::corrupt(pos, "not a block boundary"));
        }
        Ok(())
    }

    fn write_i64(&self, offset: u64, value: i64) -> BlockResult<()> {
        pio::write_all_at(&self.file, &value.to_be_bytes(), offset)?;
        Ok(())
    }

    fn write_head_meta(&self, head: u64, meta: &HeadMeta) -> BlockResult<()> {
        pio::write_all_at(&self.file, &meta.encode(), self.geometry.head_meta_offset(head))?;
        Ok(())
    }

    /// Lock a block's extent and, when it is not the head, the head's
    /// metadata field. Both or neither.
    fn lock_block_and_meta(
        &self,
        head: u64,
        block: u64,
    ) -> BlockResult<(RangeGuard<'_>, Option<RangeGuard<'_>>)> {
        loop {
            let Some(extent) = self.locks.try_lock(block, self.geometry.stride())? else {
                thread::yield_now();
                continue;
            };
            if head == block {
                return Ok((extent, None));
            }
            match self.locks.try_lock(self.geometry.head_meta_offset(head), HEAD_META_LEN)? {
                Some(meta) => return Ok((extent, Some(meta))),
                None => {
                    drop(extent);
                    thread::yield_now();
                }
            }
        }
    }
}

/// Spin on a single range until it is free.
fn lock_range(locks: &RangeLocks, start: u64, len: u64) -> BlockResult<RangeGuard<'_>> {
    loop {
        if let Some(guard) = locks.try_lock(start, len)? {
            return Ok(guard);
        }
        thread::yield_now();
    }
}

fn eof_as_corrupt(e: io::Error, pos: u64) -> BlockError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        BlockError::corrupt(pos, "block extends past end of file")
    } else {
        BlockError::Io(e)
    }
}

/// Positional I/O that leaves no shared cursor behind.
mod pio {
    use std::fs::File;
    use std::io;

    #[cfg(unix)]
    pub(super) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
    }

    #[cfg(unix)]
    pub(super) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
    }

    #[cfg(windows)]
    pub(super) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match file.seek_read(buf, offset)? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    pub(super) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match file.seek_write(buf, offset)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }
}
