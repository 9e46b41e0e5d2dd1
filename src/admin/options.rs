use crate::storage::{StorageMode, DEFAULT_BLOCK_SIZE};

/// Common options used when opening a dataset for administrative commands.
#[derive(Clone, Debug)]
pub struct AdminOpenOptions {
    /// How index files are accessed. `Mapped` opens read-only: recovery is
    /// skipped, a journal with pending commits is refused, and only the lock
    /// file is written.
    pub mode: StorageMode,
    /// Blocks kept by each index's read cache.
    pub read_cache_blocks: usize,
    /// Whether to take the location lock while the dataset is open.
    pub use_lock_file: bool,
    /// Whether to create an empty dataset if the directory holds none.
    pub create_if_missing: bool,
    /// Block size for a dataset created through `create_if_missing`.
    pub block_size: usize,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        Self {
            mode: StorageMode::File,
            read_cache_blocks: 256,
            use_lock_file: true,
            create_if_missing: false,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}
