//! Block-chain storage engine for kakera containers.
//!
//! One physical file holds many independent byte streams. Each stream is a
//! chain of fixed-size blocks; freed blocks are tombstoned and reused
//! first-fit. Concurrent writers are kept apart with non-blocking byte-range
//! locks.
//!
//! # Key Types
//!
//! |--------------------|---------------------------------------------|
//! | Type               | Purpose                                     |
//! |--------------------|---------------------------------------------|
//! | [`BlockStore`]     | Container file, allocation, free-block scan |
//! | [`VirtualStream`]  | Random-access stream over one chain         |
//! | [`StoreConfig`]    | Block size and OS lock options              |
//! | [`Geometry`]       | Offsets derived from the block size         |
//! | [`RangeLocks`]     | Byte-range lock table (threads + processes) |
//! |--------------------|---------------------------------------------|

pub mod config;
pub mod error;
pub mod layout;
pub mod range_lock;
pub mod store;
pub mod stream;

pub use config::StoreConfig;
pub use error::{BlockError, BlockResult};
pub use layout::{BlockHeader, Geometry, HeadMeta, DEFAULT_BLOCK_SIZE, FREE_MARKER, NO_BLOCK};
pub use range_lock::{RangeGuard, RangeLocks};
pub use store::{BlockImage, BlockStore, StoreStats};
pub use stream::{AccessMode, StreamSummary, VirtualStream};
