//! Block store configuration.

use serde::{Deserialize, Serialize};

use crate::error::{BlockError, BlockResult};
use crate::layout::{DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Options used when opening a container file.
///
/// `block_size` only matters when the container is created; an existing
/// container always keeps the block size recorded in its header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Body size of each block in bytes.
    pub block_size: u64,

    /// Also take OS advisory locks so other processes are excluded.
    pub os_locks: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            os_locks: cfg!(unix),
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the block size for newly created containers.
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Enable or disable OS advisory locks.
    pub fn with_os_locks(mut self, enabled: bool) -> Self {
        self.os_locks = enabled;
        self
    }

    pub fn validate(&self) -> BlockResult<()> {
        if self.block_size < MIN_BLOCK_SIZE || self.block_size > i64::MAX as u64 / 2 {
            return Err(BlockError::InvalidBlockSize(self.block_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.block_size, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tiny_block_size_rejected() {
        let config = StoreConfig::new().with_block_size(16);
        assert!(matches!(config.validate(), Err(BlockError::InvalidBlockSize(16))));
        assert!(StoreConfig::new().with_block_size(17).validate().is_ok());
    }
}
