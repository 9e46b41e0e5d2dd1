#![forbid(unsafe_code)]

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use super::{check_block_len, AllocState, BlockStats, BlockStatsSnapshot, BlockStore};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{BlockId, Result, StoreError};

/// Block store over positioned file I/O; block `n` lives at `n * block_size`.
///
/// Reads go through an LRU cache of `read_cache_blocks` entries; writes are
/// written through and refresh the cached copy.
pub struct FileBlockStore {
    io: Arc<dyn FileIo>,
    block_size: usize,
    cache: Option<Mutex<LruCache<u64, Arc<[u8]>>>>,
    alloc: Mutex<AllocState>,
    closed: AtomicBool,
    stats: BlockStats,
}

impl FileBlockStore {
    /// Opens or creates the block file at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        block_size: usize,
        read_cache_blocks: usize,
    ) -> Result<Self> {
        let io = StdFileIo::open(path.as_ref())?;
        Self::with_io(Arc::new(io), block_size, read_cache_blocks)
    }

    /// Builds a store over an existing [`FileIo`].
    pub fn with_io(
        io: Arc<dyn FileIo>,
        block_size: usize,
        read_cache_blocks: usize,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(StoreError::Invalid("block size must be non-zero"));
        }
        let len = io.len()?;
        if len % block_size as u64 != 0 {
            return Err(StoreError::CorruptionOwned(format!(
                "block file length {len} is not a multiple of block size {block_size}"
            )));
        }
        let limit = len / block_size as u64;
        debug!(blocks = limit, block_size, "block.file.open");
        Ok(Self {
            io,
            block_size,
            cache: NonZeroUsize::new(read_cache_blocks).map(|cap| Mutex::new(LruCache::new(cap))),
            alloc: Mutex::new(AllocState {
                limit,
                free: Vec::new(),
            }),
            closed: AtomicBool::new(false),
            stats: BlockStats::default(),
        })
    }

    fn offset(&self, id: BlockId) -> u64 {
        id.0 * self.block_size as u64
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl BlockStore for FileBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&self) -> Result<BlockId> {
        self.ensure_open()?;
        let id = self.alloc.lock().allocate();
        self.put(id, &vec![0u8; self.block_size])?;
        Ok(id)
    }

    fn get(&self, id: BlockId) -> Result<Arc<[u8]>> {
        self.ensure_open()?;
        if id.0 >= self.alloc.lock().limit {
            return Err(StoreError::NotFound("block"));
        }
        self.stats.record_read();
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().get(&id.0) {
                self.stats.record_cache(true);
                return Ok(Arc::clone(hit));
            }
            self.stats.record_cache(false);
        }
        let mut buf = vec![0u8; self.block_size];
        self.io.read_at(self.offset(id), &mut buf)?;
        let block: Arc<[u8]> = Arc::from(buf);
        if let Some(cache) = &self.cache {
            cache.lock().put(id.0, Arc::clone(&block));
        }
        Ok(block)
    }

    fn put(&self, id: BlockId, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        check_block_len(self.block_size, data)?;
        self.io.write_at(self.offset(id), data)?;
        self.alloc.lock().extend_to(id);
        if let Some(cache) = &self.cache {
            cache.lock().put(id.0, Arc::from(data));
        }
        self.stats.record_write();
        Ok(())
    }

    fn free(&self, id: BlockId) -> Result<()> {
        self.ensure_open()?;
        self.alloc.lock().release(id)?;
        if let Some(cache) = &self.cache {
            cache.lock().pop(&id.0);
        }
        Ok(())
    }

    fn limit(&self) -> u64 {
        self.alloc.lock().limit
    }

    fn truncate(&self, limit: u64) -> Result<()> {
        self.ensure_open()?;
        let mut alloc = self.alloc.lock();
        if limit >= alloc.limit {
            return Ok(());
        }
        self.io.truncate(limit * self.block_size as u64)?;
        alloc.truncate(limit);
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            let stale: Vec<u64> = cache
                .iter()
                .map(|(&id, _)| id)
                .filter(|&id| id >= limit)
                .collect();
            for id in stale {
                cache.pop(&id);
            }
        }
        debug!(limit, "block.file.truncate");
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.io.sync_all()?;
        self.stats.record_sync();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.io.sync_all()?;
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
        Ok(())
    }

    fn stats(&self) -> BlockStatsSnapshot {
        self.stats.snapshot()
    }
}
