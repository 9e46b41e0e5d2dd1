use serde::{Deserialize, Serialize};

use crate::types::{Result, StoreError};

/// Default block size for every index.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// How index blocks are stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Blocks live in memory and vanish with the process.
    Memory,
    /// Blocks are read and written through positioned file I/O.
    File,
    /// Blocks are memory-mapped read-only.
    Mapped,
}

/// Geometry and caching of the block stores behind every index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexParams {
    /// Bytes per block; fixed once an index is created.
    pub block_size: usize,
    /// Blocks kept in each file-backed store's read cache.
    pub read_cache_blocks: usize,
    /// Dirty blocks a write transaction buffers per index before spilling.
    pub write_cache_blocks: usize,
    /// Storage backend.
    pub mode: StorageMode,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            read_cache_blocks: 1000,
            write_cache_blocks: 1024,
            mode: StorageMode::File,
        }
    }
}

impl IndexParams {
    /// Sets the block size.
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Sets the read cache size in blocks.
    pub fn read_cache_blocks(mut self, blocks: usize) -> Self {
        self.read_cache_blocks = blocks;
        self
    }

    /// Sets the write cache size in blocks.
    pub fn write_cache_blocks(mut self, blocks: usize) -> Self {
        self.write_cache_blocks = blocks;
        self
    }

    /// Selects the storage backend.
    pub fn mode(mut self, mode: StorageMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parses the `params.toml` form.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|err| StoreError::CorruptionOwned(format!("params.toml: {err}")))
    }

    /// Renders the `params.toml` form.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| {
            StoreError::InvalidOwned(format!("cannot serialize index params: {err}"))
        })
    }
}

/// Options applied when connecting to a location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Index geometry and backend.
    pub params: IndexParams,
    /// Node table LRU capacity per direction.
    pub node_cache_size: usize,
    /// Whether to hold the location's lock file.
    pub use_lock_file: bool,
    /// Commits between journal truncations.
    pub journal_checkpoint_interval: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            params: IndexParams::default(),
            node_cache_size: 10_000,
            use_lock_file: true,
            journal_checkpoint_interval: 1,
        }
    }
}

impl StoreOptions {
    /// Sets the index parameters.
    pub fn params(mut self, params: IndexParams) -> Self {
        self.params = params;
        self
    }

    /// Sets the node cache capacity.
    pub fn node_cache_size(mut self, entries: usize) -> Self {
        self.node_cache_size = entries;
        self
    }

    /// Enables or disables the location lock file.
    pub fn use_lock_file(mut self, enabled: bool) -> Self {
        self.use_lock_file = enabled;
        self
    }

    /// Sets how many commits pass between journal truncations.
    pub fn journal_checkpoint_interval(mut self, commits: u64) -> Self {
        self.journal_checkpoint_interval = commits.max(1);
        self
    }
}
