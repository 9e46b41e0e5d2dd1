#![deny(unsafe_code)]
//! Fixed-size block allocation over memory, files and read-only mappings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{BlockId, Result, StoreError};

mod file;
mod mapped;

pub use file::FileBlockStore;
pub use mapped::MappedBlockStore;

/// Page-granular storage addressed by [`BlockId`].
///
/// A `put` replaces the whole block; callers never observe a partially
/// written block.
pub trait BlockStore: Send + Sync + 'static {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;
    /// Reserves a block id, reusing a freed one when available.
    fn allocate(&self) -> Result<BlockId>;
    /// Returns the contents of `id`.
    fn get(&self, id: BlockId) -> Result<Arc<[u8]>>;
    /// Replaces the contents of `id`. Writing past [`BlockStore::limit`]
    /// extends the store.
    fn put(&self, id: BlockId, data: &[u8]) -> Result<()>;
    /// Returns `id` to the allocator.
    fn free(&self, id: BlockId) -> Result<()>;
    /// One past the highest block id ever written or allocated.
    fn limit(&self) -> u64;
    /// Drops every block at or above `limit`.
    fn truncate(&self, limit: u64) -> Result<()>;
    /// Forces written blocks to stable storage.
    fn sync(&self) -> Result<()>;
    /// Flushes and rejects further use.
    fn close(&self) -> Result<()>;
    /// True when writes are rejected.
    fn is_read_only(&self) -> bool {
        false
    }
    /// Returns I/O counters.
    fn stats(&self) -> BlockStatsSnapshot;
}

/// Shared counters for block store implementations.
#[derive(Default, Debug)]
pub struct BlockStats {
    reads: AtomicU64,
    writes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    syncs: AtomicU64,
}

/// Point-in-time copy of [`BlockStats`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BlockStatsSnapshot {
    /// Blocks returned by `get`.
    pub reads: u64,
    /// Blocks written by `put`.
    pub writes: u64,
    /// Reads served from the block cache.
    pub cache_hits: u64,
    /// Reads that went to the backing file.
    pub cache_misses: u64,
    /// Calls to `sync`.
    pub syncs: u64,
}

impl BlockStats {
    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache(&self, hit: bool) {
        let counter = if hit {
            &self.cache_hits
        } else {
            &self.cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters.
    pub fn snapshot(&self) -> BlockStatsSnapshot {
        BlockStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
        }
    }
}

/// Allocation bookkeeping shared by the writable stores.
#[derive(Debug, Default)]
pub(crate) struct AllocState {
    pub(crate) limit: u64,
    pub(crate) free: Vec<u64>,
}

impl AllocState {
    pub(crate) fn allocate(&mut self) -> BlockId {
        if let Some(id) = self.free.pop() {
            return BlockId(id);
        }
        let id = self.limit;
        self.limit += 1;
        BlockId(id)
    }

    pub(crate) fn release(&mut self, id: BlockId) -> Result<()> {
        if id.0 >= self.limit {
            return Err(StoreError::Invalid("free of unallocated block"));
        }
        if self.free.contains(&id.0) {
            return Err(StoreError::Invalid("block freed twice"));
        }
        self.free.push(id.0);
        Ok(())
    }

    pub(crate) fn extend_to(&mut self, id: BlockId) {
        if id.0 >= self.limit {
            self.limit = id.0 + 1;
        }
        self.free.retain(|&free| free != id.0);
    }

    pub(crate) fn truncate(&mut self, limit: u64) {
        self.limit = self.limit.min(limit);
        self.free.retain(|&free| free < limit);
    }
}

pub(crate) fn check_block_len(block_size: usize, data: &[u8]) -> Result<()> {
    if data.len() != block_size {
        return Err(StoreError::InvalidOwned(format!(
            "block buffer is {} bytes, expected {}",
            data.len(),
            block_size
        )));
    }
    Ok(())
}

/// In-memory block store for ephemeral locations and tests.
pub struct MemBlockStore {
    block_size: usize,
    blocks: Mutex<HashMap<u64, Arc<[u8]>>>,
    alloc: Mutex<AllocState>,
    closed: AtomicBool,
    stats: BlockStats,
}

impl MemBlockStore {
    /// Creates an empty store.
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(StoreError::Invalid("block size must be non-zero"));
        }
        Ok(Self {
            block_size,
            blocks: Mutex::new(HashMap::new()),
            alloc: Mutex::new(AllocState::default()),
            closed: AtomicBool::new(false),
            stats: BlockStats::default(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl BlockStore for MemBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&self) -> Result<BlockId> {
        self.ensure_open()?;
        let id = self.alloc.lock().allocate();
        self.blocks
            .lock()
            .insert(id.0, Arc::from(vec![0u8; self.block_size]));
        Ok(id)
    }

    fn get(&self, id: BlockId) -> Result<Arc<[u8]>> {
        self.ensure_open()?;
        self.stats.record_read();
        self.blocks
            .lock()
            .get(&id.0)
            .cloned()
            .ok_or(StoreError::NotFound("block"))
    }

    fn put(&self, id: BlockId, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        check_block_len(self.block_size, data)?;
        self.alloc.lock().extend_to(id);
        self.blocks.lock().insert(id.0, Arc::from(data));
        self.stats.record_write();
        Ok(())
    }

    fn free(&self, id: BlockId) -> Result<()> {
        self.ensure_open()?;
        self.alloc.lock().release(id)?;
        self.blocks.lock().remove(&id.0);
        Ok(())
    }

    fn limit(&self) -> u64 {
        self.alloc.lock().limit
    }

    fn truncate(&self, limit: u64) -> Result<()> {
        self.ensure_open()?;
        self.alloc.lock().truncate(limit);
        self.blocks.lock().retain(|&id, _| id < limit);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.stats.record_sync();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn stats(&self) -> BlockStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(store: &dyn BlockStore) -> Result<()> {
        let bs = store.block_size();
        let a = store.allocate()?;
        let b = store.allocate()?;
        assert_ne!(a, b);
        store.put(a, &vec![7u8; bs])?;
        store.put(b, &vec![9u8; bs])?;
        assert!(store.get(a)?.iter().all(|&x| x == 7));
        assert!(store.get(b)?.iter().all(|&x| x == 9));
        assert!(store.put(a, &[1, 2, 3]).is_err());

        store.free(a)?;
        let reused = store.allocate()?;
        assert_eq!(reused, a);

        store.put(BlockId(5), &vec![3u8; bs])?;
        assert_eq!(store.limit(), 6);
        store.truncate(2)?;
        assert_eq!(store.limit(), 2);
        assert!(store.get(BlockId(5)).is_err());
        store.sync()
    }

    #[test]
    fn mem_store_contract() -> Result<()> {
        let store = MemBlockStore::new(64)?;
        exercise(&store)?;
        let err = store.get(BlockId(40)).unwrap_err();
        assert!(err.is_not_found());
        store.close()?;
        assert!(matches!(store.get(BlockId(0)), Err(StoreError::Closed)));
        Ok(())
    }

    #[test]
    fn file_store_contract() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = FileBlockStore::open(dir.path().join("blocks.dat"), 128, 4)?;
        exercise(&store)?;
        Ok(())
    }

    #[test]
    fn file_store_persists_and_caches() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        {
            let store = FileBlockStore::open(&path, 128, 2)?;
            for fill in 0u8..4 {
                let id = store.allocate()?;
                store.put(id, &vec![fill; 128])?;
            }
            store.close()?;
        }
        let store = FileBlockStore::open(&path, 128, 2)?;
        assert_eq!(store.limit(), 4);
        assert_eq!(store.get(BlockId(2))?[0], 2);
        assert_eq!(store.get(BlockId(2))?[0], 2);
        let stats = store.stats();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);
        assert!(store.get(BlockId(4)).unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn mapped_store_reads_but_rejects_writes() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        {
            let store = FileBlockStore::open(&path, 64, 0)?;
            let id = store.allocate()?;
            store.put(id, &vec![0xAB; 64])?;
            store.close()?;
        }
        let mapped = MappedBlockStore::open(&path, 64)?;
        assert!(mapped.is_read_only());
        assert_eq!(mapped.limit(), 1);
        assert!(mapped.get(BlockId(0))?.iter().all(|&b| b == 0xAB));
        assert!(mapped.get(BlockId(1)).unwrap_err().is_not_found());
        assert!(mapped.put(BlockId(0), &vec![0; 64]).is_err());
        assert!(mapped.allocate().is_err());
        assert_eq!(mapped.stats().cache_hits, 0);
        Ok(())
    }
}
