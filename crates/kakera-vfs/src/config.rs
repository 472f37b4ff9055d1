//! Container configuration.
//!
//! Stored as RON:
//!
//! ```ron
//! (
//!     block_size: 4096,
//!     os_locks: true,
//!     persist: true,
//! )
//! ```
//!
//! Missing fields keep their defaults.

use std::path::Path;

use kakera_blocks::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::error::{VfsError, VfsResult};

/// Options used when opening a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Block size for new containers. Existing containers keep the size
    /// recorded in their header.
    pub block_size: u64,

    /// Take OS advisory locks on the byte ranges being written.
    pub os_locks: bool,

    /// Persist the tree after every mutation. When off, the tree is only
    /// written by `sync()` and `close()`.
    pub persist: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            block_size: store.block_size,
            os_locks: store.os_locks,
            persist: true,
        }
    }
}

impl ContainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_os_locks(mut self, enabled: bool) -> Self {
        self.os_locks = enabled;
        self
    }

    pub fn with_persist(mut self, enabled: bool) -> Self {
        self.persist = enabled;
        self
    }

    /// The block store half of the options.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new()
            .with_block_size(self.block_size)
            .with_os_locks(self.os_locks)
    }

    /// Parse a RON document.
    pub fn from_ron(source: &str) -> VfsResult<Self> {
        let config: ContainerConfig =
            ron::from_str(source).map_err(|e| VfsError::config(e.to_string()))?;
        config
            .store_config()
            .validate()
            .map_err(|e| VfsError::config(e.to_string()))?;
        Ok(config)
    }

    /// Read and parse a RON file.
    pub fn load(path: impl AsRef<Path>) -> VfsResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_ron(&source)
    }
}
