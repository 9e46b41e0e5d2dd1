#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::info;

use super::ops::{self, CheckReport, NodeRead, NodeWrite, RangeIter, Shape};
use super::page::Node;
use super::params::{Record, TreeParams};
use super::stats::{TreeStats, TreeStatsSnapshot};
use super::tree::TreeRoot;
use crate::primitives::block::BlockStore;
use crate::primitives::io::FileIo;
use crate::storage::meta::StateFile;
use crate::types::{BlockId, Result, StoreError};

struct DirectAccess<'a> {
    store: &'a dyn BlockStore,
    params: TreeParams,
}

impl NodeRead for DirectAccess<'_> {
    fn read_node(&self, id: BlockId) -> Result<Node> {
        let buf = self.store.get(id)?;
        Node::decode(&buf, &self.params)
    }
}

impl NodeWrite for DirectAccess<'_> {
    fn write_node(&mut self, id: BlockId, node: Node) -> Result<BlockId> {
        self.store.put(id, &node.encode(&self.params)?)?;
        Ok(id)
    }

    fn alloc_node(&mut self, node: Node) -> Result<BlockId> {
        let id = self.store.allocate()?;
        self.write_node(id, node)
    }

    fn free_node(&mut self, id: BlockId) -> Result<()> {
        self.store.free(id)
    }
}

/// Non-transactional tree for bulk loading.
///
/// Blocks are modified in place and freed blocks are recycled by the block
/// store. Once loaded, [`TreeBuilder::freeze`] persists the root so the
/// index can be opened as a [`super::BPlusTree`].
pub struct TreeBuilder {
    params: TreeParams,
    store: Arc<dyn BlockStore>,
    shape: Shape,
    stats: TreeStats,
}

impl TreeBuilder {
    /// Starts an empty tree in `store`, which must hold no blocks.
    pub fn new(params: TreeParams, store: Arc<dyn BlockStore>) -> Result<Self> {
        if store.block_size() != params.block_size() {
            return Err(StoreError::Invalid("block store size does not match tree params"));
        }
        if store.limit() != 0 {
            return Err(StoreError::Invalid("tree builder needs an empty block store"));
        }
        let root = store.allocate()?;
        store.put(root, &Node::empty_leaf().encode(&params)?)?;
        Ok(Self {
            params,
            store,
            shape: Shape {
                root,
                height: 1,
                count: 0,
            },
            stats: TreeStats::default(),
        })
    }

    fn access(&self) -> DirectAccess<'_> {
        DirectAccess {
            store: self.store.as_ref(),
            params: self.params,
        }
    }

    /// Inserts or overwrites `record`; `true` when the key is new.
    pub fn insert(&mut self, record: &Record) -> Result<bool> {
        self.params.check_record(record)?;
        let mut access = DirectAccess {
            store: self.store.as_ref(),
            params: self.params,
        };
        let (shape, added) =
            ops::insert(&mut access, &self.params, &self.stats, self.shape, record.as_bytes())?;
        self.shape = shape;
        Ok(added)
    }

    /// Removes `key`; `true` when a record was removed.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.params.check_key(key)?;
        let mut access = DirectAccess {
            store: self.store.as_ref(),
            params: self.params,
        };
        let (shape, removed) =
            ops::delete(&mut access, &self.params, &self.stats, self.shape, key)?;
        self.shape = shape;
        Ok(removed)
    }

    /// Looks up `key`.
    pub fn find(&self, key: &[u8]) -> Result<Option<Record>> {
        self.params.check_key(key)?;
        self.stats.inc_searches();
        ops::find(&self.access(), &self.params, self.shape.root, key)
    }

    /// Records with `low <= key < high` in key order.
    pub fn range(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> Result<RangeIter<'_>> {
        self.stats.inc_range_scans();
        RangeIter::new(Box::new(self.access()), &self.params, self.shape.root, low, high)
    }

    /// Number of records.
    pub fn len(&self) -> u64 {
        self.shape.count
    }

    /// True when the tree holds no records.
    pub fn is_empty(&self) -> bool {
        self.shape.count == 0
    }

    /// Levels from root to leaves.
    pub fn height(&self) -> u32 {
        self.shape.height
    }

    /// Verifies the tree structure.
    pub fn check(&self) -> Result<CheckReport> {
        ops::check(&self.access(), &self.params, self.shape)
    }

    /// Operation counters.
    pub fn stats(&self) -> TreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Syncs the blocks and writes the root to `root_io`.
    pub fn freeze(self, root_io: Arc<dyn FileIo>) -> Result<TreeRoot> {
        self.store.sync()?;
        let root = TreeRoot {
            root: self.shape.root,
            height: self.shape.height,
            count: self.shape.count,
            limit: self.store.limit(),
            generation: 0,
        };
        let (root_file, _) = StateFile::open(root_io)?;
        root_file.write(&root.encode())?;
        info!(
            records = root.count,
            height = root.height,
            blocks = root.limit,
            "btree.builder.freeze"
        );
        Ok(root)
    }
}
