#![allow(unsafe_code)]

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use tracing::debug;

use super::{BlockStats, BlockStatsSnapshot, BlockStore};
use crate::types::{BlockId, Result, StoreError};

/// Read-only block store over a memory-mapped file.
///
/// Blocks are copied out of the mapping on every `get`; the page cache
/// already holds them, so there is no block-level cache.
pub struct MappedBlockStore {
    map: Option<Mmap>,
    block_size: usize,
    limit: u64,
    closed: AtomicBool,
    stats: BlockStats,
}

impl MappedBlockStore {
    /// Maps the block file at `path`.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(StoreError::Invalid("block size must be non-zero"));
        }
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len % block_size as u64 != 0 {
            return Err(StoreError::CorruptionOwned(format!(
                "block file length {len} is not a multiple of block size {block_size}"
            )));
        }
        // The mapping stays valid only while nobody truncates the file; the
        // location lock keeps other writers out.
        let map = if len == 0 {
            None
        } else {
            Some(unsafe { MmapOptions::new().map(&file) }?)
        };
        let limit = len / block_size as u64;
        debug!(path = %path.as_ref().display(), blocks = limit, "block.mapped.open");
        Ok(Self {
            map,
            block_size,
            limit,
            closed: AtomicBool::new(false),
            stats: BlockStats::default(),
        })
    }

    fn read_only() -> StoreError {
        StoreError::Invalid("mapped block store is read-only")
    }
}

impl BlockStore for MappedBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&self) -> Result<BlockId> {
        Err(Self::read_only())
    }

    fn get(&self, id: BlockId) -> Result<Arc<[u8]>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let map = match &self.map {
            Some(map) if id.0 < self.limit => map,
            _ => return Err(StoreError::NotFound("block")),
        };
        let start = id.0 as usize * self.block_size;
        self.stats.record_read();
        Ok(Arc::from(&map[start..start + self.block_size]))
    }

    fn put(&self, _id: BlockId, _data: &[u8]) -> Result<()> {
        Err(Self::read_only())
    }

    fn free(&self, _id: BlockId) -> Result<()> {
        Err(Self::read_only())
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn truncate(&self, limit: u64) -> Result<()> {
        if limit >= self.limit {
            return Ok(());
        }
        Err(Self::read_only())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn stats(&self) -> BlockStatsSnapshot {
        self.stats.snapshot()
    }
}
