//! On-disk layout of a container file.
//!
//! ```text
//! offset 0      8                                        8 + (B + 16)
//!        +------+----------------------------------------+------ ...
//!        |  B   | block 0                                | block 1
//!        +------+----------------------------------------+------ ...
//!
//! block:  [end: i64][next: i64][body: B bytes]
//! head:   [end: i64][next: i64][size: i64][last: i64][payload: B - 16]
//! ```
//!
//! All integers are big-endian. `end` is the absolute offset of the last used
//! byte of the block, or [`FREE_MARKER`] for a free block. `next` is the
//! absolute offset of the following block or [`NO_BLOCK`].

/// Size of the container header (the block size as `i64`).
pub const CONTAINER_HEADER_LEN: u64 = 8;

/// Size of the per-block header (end marker + next pointer).
pub const BLOCK_HEADER_LEN: u64 = 16;

/// Size of the metadata a head block carries in front of its payload.
pub const HEAD_META_LEN: u64 = 16;

/// Block size used when a container is created without an explicit one.
pub const DEFAULT_BLOCK_SIZE: u64 = 1024;

/// Smallest block size that still leaves payload room in a head block.
pub const MIN_BLOCK_SIZE: u64 = HEAD_META_LEN + 1;

/// End-marker value of a free block.
pub const FREE_MARKER: i64 = -2;

/// Chain pointer value meaning "no block".
pub const NO_BLOCK: i64 = -1;

/// Offset of the first block in every container.
pub const FIRST_BLOCK: u64 = CONTAINER_HEADER_LEN;

/// Header fields shared by every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Absolute offset of the last used byte, or [`FREE_MARKER`].
    pub end: i64,
    /// Absolute offset of the next block, or [`NO_BLOCK`].
    pub next: i64,
}

impl BlockHeader {
    pub fn is_free(&self) -> bool {
        self.end == FREE_MARKER
    }

    pub fn is_last(&self) -> bool {
        self.next == NO_BLOCK
    }

    pub fn encode(&self) -> [u8; BLOCK_HEADER_LEN as usize] {
        let mut buf = [0u8; BLOCK_HEADER_LEN as usize];
        buf[..8].copy_from_slice(&self.end.to_be_bytes());
        buf[8..].copy_from_slice(&self.next.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; BLOCK_HEADER_LEN as usize]) -> Self {
        Self {
            end: read_i64(&buf[..8]),
            next: read_i64(&buf[8..]),
        }
    }
}

/// Stream metadata stored at the front of a chain's head block body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadMeta {
    /// Logical length of the stream.
    pub size: u64,
    /// Absolute offset of the chain's last block.
    pub last: i64,
}

impl HeadMeta {
    pub fn encode(&self) -> [u8; HEAD_META_LEN as usize] {
        let mut buf = [0u8; HEAD_META_LEN as usize];
        buf[..8].copy_from_slice(&(self.size as i64).to_be_bytes());
        buf[8..].copy_from_slice(&self.last.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEAD_META_LEN as usize]) -> Self {
        Self {
            size: read_i64(&buf[..8]).max(0) as u64,
            last: read_i64(&buf[8..]),
        }
    }
}

/// Geometry derived from a container's block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    block_size: u64,
}

impl Geometry {
    pub fn new(block_size: u64) -> Self {
        Self { block_size }
    }

    /// Body size of every block (`B`).
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Distance between consecutive block offsets.
    pub fn stride(&self) -> u64 {
        self.block_size + BLOCK_HEADER_LEN
    }

    /// Payload bytes a block can hold.
    pub fn capacity(&self, is_head: bool) -> u64 {
        if is_head {
            self.block_size - HEAD_META_LEN
        } else {
            self.block_size
        }
    }

    /// Absolute offset of a block's first payload byte.
    pub fn payload_start(&self, block: u64, is_head: bool) -> u64 {
        if is_head {
            block + BLOCK_HEADER_LEN + HEAD_META_LEN
        } else {
            block + BLOCK_HEADER_LEN
        }
    }

    /// End-marker for a block holding `used` payload bytes.
    ///
    /// Head blocks count their metadata as used, so an empty head still ends
    /// after its size/last fields.
    pub fn end_marker(&self, block: u64, is_head: bool, used: u64) -> i64 {
        (self.payload_start(block, is_head) + used) as i64 - 1
    }

    /// Offset of the size/last metadata of a head block.
    pub fn head_meta_offset(&self, head: u64) -> u64 {
        head + BLOCK_HEADER_LEN
    }

    /// Offset of a block's next pointer.
    pub fn next_offset(&self, block: u64) -> u64 {
        block + 8
    }

    /// Whether `offset` sits on a block boundary of this geometry.
    pub fn is_block_offset(&self, offset: u64) -> bool {
        offset >= FIRST_BLOCK && (offset - FIRST_BLOCK) % self.stride() == 0
    }
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    i64::from_be_bytes(raw)
}

/// Convert a raw chain pointer into an offset, treating negatives as "none".
pub fn block_ptr(raw: i64) -> Option<u64> {
    if raw < 0 { None } else { Some(raw as u64) }
}
