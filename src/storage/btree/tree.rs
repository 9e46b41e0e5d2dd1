#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::builder::TreeBuilder;
use super::ops::{self, CheckReport, NodeRead, NodeWrite, RangeIter, Shape};
use super::page::Node;
use super::params::{Record, TreeParams};
use super::stats::{TreeStats, TreeStatsSnapshot};
use crate::primitives::block::BlockStore;
use crate::primitives::io::FileIo;
use crate::storage::meta::StateFile;
use crate::txn::{Transaction, TransactionalComponent};
use crate::types::{BlockId, ComponentId, Result, StoreError, TxnId, TxnMode};

const TREE_ROOT_LEN: usize = 40;

/// Committed version of a tree, persisted in the index's root file and
/// carried in the journal as the tree's recovery payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct TreeRoot {
    /// Root block.
    pub root: BlockId,
    /// Levels from root to leaves.
    pub height: u32,
    /// Live records.
    pub count: u64,
    /// One past the highest block id the tree may reference.
    pub limit: u64,
    /// Incremented by every commit that changed the tree.
    pub generation: u64,
}

impl TreeRoot {
    pub(crate) fn empty(root: BlockId) -> Self {
        Self {
            root,
            height: 1,
            count: 0,
            limit: root.0 + 1,
            generation: 0,
        }
    }

    pub(crate) fn encode(&self) -> [u8; TREE_ROOT_LEN] {
        let mut buf = [0u8; TREE_ROOT_LEN];
        buf[0..8].copy_from_slice(&self.root.0.to_be_bytes());
        buf[8..12].copy_from_slice(&self.height.to_be_bytes());
        buf[16..24].copy_from_slice(&self.count.to_be_bytes());
        buf[24..32].copy_from_slice(&self.limit.to_be_bytes());
        buf[32..40].copy_from_slice(&self.generation.to_be_bytes());
        buf
    }

    pub(crate) fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != TREE_ROOT_LEN {
            return Err(StoreError::Corruption("tree root has the wrong length"));
        }
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&src[at..at + 8]);
            u64::from_be_bytes(raw)
        };
        let root = Self {
            root: BlockId(u64_at(0)),
            height: u32::from_be_bytes([src[8], src[9], src[10], src[11]]),
            count: u64_at(16),
            limit: u64_at(24),
            generation: u64_at(32),
        };
        if root.height == 0 || root.root.0 >= root.limit {
            return Err(StoreError::Corruption("tree root out of range"));
        }
        Ok(root)
    }

    fn shape(&self) -> Shape {
        Shape {
            root: self.root,
            height: self.height,
            count: self.count,
        }
    }
}

/// Identity and sizing of one transactional tree.
#[derive(Clone, Debug)]
pub struct TreeOptions {
    /// Journal identity.
    pub component: ComponentId,
    /// Name used in logs and reports.
    pub label: String,
    /// Block and record geometry.
    pub params: TreeParams,
    /// Dirty blocks a write transaction buffers before spilling them to
    /// the block store.
    pub write_cache_blocks: usize,
}

impl TreeOptions {
    /// Options with a 1024-block write cache.
    pub fn new(component: ComponentId, label: impl Into<String>, params: TreeParams) -> Self {
        Self {
            component,
            label: label.into(),
            params,
            write_cache_blocks: 1024,
        }
    }

    /// Sets the write cache size in blocks.
    pub fn write_cache_blocks(mut self, blocks: usize) -> Self {
        self.write_cache_blocks = blocks.max(1);
        self
    }
}

struct Shared {
    committed: TreeRoot,
    /// Active readers by snapshot generation.
    readers: BTreeMap<u64, usize>,
    /// Blocks unreachable from every root at or after the tagged generation.
    retired: VecDeque<(u64, Vec<BlockId>)>,
    pool: Vec<BlockId>,
    recovered: bool,
}

/// Per-transaction view of a tree.
pub struct TreeTxnState {
    mode: TxnMode,
    base: TreeRoot,
    shape: Shape,
    dirty: HashMap<BlockId, Node>,
    /// Blocks this transaction allocated; only these are written in place.
    owned: HashSet<BlockId>,
    retired: Vec<BlockId>,
    pool: Vec<BlockId>,
    taken: Vec<BlockId>,
    recycled: Vec<BlockId>,
    next_fresh: u64,
    prepared: Option<TreeRoot>,
}

impl TreeTxnState {
    fn new(mode: TxnMode, base: TreeRoot) -> Self {
        Self {
            mode,
            base,
            shape: base.shape(),
            dirty: HashMap::new(),
            owned: HashSet::new(),
            retired: Vec::new(),
            pool: Vec::new(),
            taken: Vec::new(),
            recycled: Vec::new(),
            next_fresh: base.limit,
            prepared: None,
        }
    }

    fn is_modified(&self) -> bool {
        self.shape != self.base.shape() || !self.owned.is_empty() || !self.retired.is_empty()
    }

    fn alloc_id(&mut self) -> BlockId {
        if let Some(id) = self.recycled.pop() {
            return id;
        }
        if let Some(id) = self.pool.pop() {
            self.taken.push(id);
            return id;
        }
        let id = BlockId(self.next_fresh);
        self.next_fresh += 1;
        id
    }
}

struct TxnView<'a> {
    tree: &'a BPlusTree,
    state: &'a TreeTxnState,
}

impl NodeRead for TxnView<'_> {
    fn read_node(&self, id: BlockId) -> Result<Node> {
        match self.state.dirty.get(&id) {
            Some(node) => Ok(node.clone()),
            None => self.tree.load(id),
        }
    }
}

struct TxnAccess<'a> {
    tree: &'a BPlusTree,
    state: &'a mut TreeTxnState,
}

impl NodeRead for TxnAccess<'_> {
    fn read_node(&self, id: BlockId) -> Result<Node> {
        match self.state.dirty.get(&id) {
            Some(node) => Ok(node.clone()),
            None => self.tree.load(id),
        }
    }
}

impl NodeWrite for TxnAccess<'_> {
    fn write_node(&mut self, id: BlockId, node: Node) -> Result<BlockId> {
        if self.state.owned.contains(&id) {
            self.state.dirty.insert(id, node);
            return Ok(id);
        }
        let copy = self.alloc_node(node)?;
        self.state.retired.push(id);
        self.tree.stats.inc_cow_copies();
        Ok(copy)
    }

    fn alloc_node(&mut self, node: Node) -> Result<BlockId> {
        let id = self.state.alloc_id();
        self.state.owned.insert(id);
        self.state.dirty.insert(id, node);
        Ok(id)
    }

    fn free_node(&mut self, id: BlockId) -> Result<()> {
        self.state.dirty.remove(&id);
        if self.state.owned.remove(&id) {
            self.state.recycled.push(id);
        } else {
            self.state.retired.push(id);
        }
        Ok(())
    }
}

/// Transactional B+Tree of fixed-length records over a [`BlockStore`].
///
/// Write transactions never modify a block reachable from a committed root:
/// the first change to such a block goes to a copy and the original is
/// retired until no reader can still see it.
pub struct BPlusTree {
    options: TreeOptions,
    store: Arc<dyn BlockStore>,
    root_file: StateFile,
    shared: Mutex<Shared>,
    stats: TreeStats,
}

impl fmt::Debug for BPlusTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BPlusTree")
            .field("label", &self.options.label)
            .field("params", &self.options.params)
            .field("committed", &self.committed_root())
            .finish()
    }
}

impl BPlusTree {
    /// Opens the tree whose committed root lives in `root_io`, creating an
    /// empty tree when the root file is empty.
    pub fn open(
        options: TreeOptions,
        store: Arc<dyn BlockStore>,
        root_io: Arc<dyn FileIo>,
    ) -> Result<Self> {
        let params = options.params;
        if store.block_size() != params.block_size() {
            return Err(StoreError::InvalidOwned(format!(
                "index {} uses {} byte blocks but the block store has {}",
                options.label,
                params.block_size(),
                store.block_size()
            )));
        }
        let (root_file, payload) = StateFile::open(root_io)?;
        let committed = match payload {
            Some(bytes) => TreeRoot::decode(&bytes)?,
            None => {
                if store.is_read_only() {
                    return Err(StoreError::Invalid("read-only index has no committed root"));
                }
                // No root was ever committed, so the block file holds nothing live.
                store.truncate(0)?;
                let root = TreeRoot::empty(BlockId(0));
                store.put(root.root, &Node::empty_leaf().encode(&params)?)?;
                store.sync()?;
                root_file.write(&root.encode())?;
                info!(index = %options.label, order = params.order(), "btree.create");
                root
            }
        };
        debug!(
            index = %options.label,
            root = %committed.root,
            count = committed.count,
            generation = committed.generation,
            "btree.open"
        );
        Ok(Self {
            options,
            store,
            root_file,
            shared: Mutex::new(Shared {
                committed,
                readers: BTreeMap::new(),
                retired: VecDeque::new(),
                pool: Vec::new(),
                recovered: false,
            }),
            stats: TreeStats::default(),
        })
    }

    /// Starts a non-transactional bulk build over an empty block store.
    pub fn builder(params: TreeParams, store: Arc<dyn BlockStore>) -> Result<TreeBuilder> {
        TreeBuilder::new(params, store)
    }

    /// Block and record geometry.
    pub fn params(&self) -> &TreeParams {
        &self.options.params
    }

    /// Name used in logs.
    pub fn label(&self) -> &str {
        &self.options.label
    }

    /// Latest committed version.
    pub fn committed_root(&self) -> TreeRoot {
        self.shared.lock().committed
    }

    /// Operation counters.
    pub fn stats(&self) -> TreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Backing block store.
    pub fn block_store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Looks up `key`.
    pub fn find(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Record>> {
        self.options.params.check_key(key)?;
        let state = self.state(txn)?;
        self.stats.inc_searches();
        ops::find(
            &TxnView { tree: self, state },
            &self.options.params,
            state.shape.root,
            key,
        )
    }

    /// True when `key` is present.
    pub fn contains(&self, txn: &Transaction, key: &[u8]) -> Result<bool> {
        Ok(self.find(txn, key)?.is_some())
    }

    /// Inserts `record`, replacing the value of an existing key. Returns
    /// `true` when the key was not present before.
    pub fn insert(&self, txn: &mut Transaction, record: &Record) -> Result<bool> {
        let params = self.options.params;
        params.check_record(record)?;
        let state = self.state_mut(txn)?;
        let mut access = TxnAccess { tree: self, state };
        let shape = access.state.shape;
        let (shape, added) =
            ops::insert(&mut access, &params, &self.stats, shape, record.as_bytes())?;
        access.state.shape = shape;
        self.maybe_spill(access.state)?;
        Ok(added)
    }

    /// Removes `key`; absent keys are not an error. Returns `true` when a
    /// record was removed.
    pub fn delete(&self, txn: &mut Transaction, key: &[u8]) -> Result<bool> {
        let params = self.options.params;
        params.check_key(key)?;
        let state = self.state_mut(txn)?;
        let mut access = TxnAccess { tree: self, state };
        let shape = access.state.shape;
        let (shape, removed) = ops::delete(&mut access, &params, &self.stats, shape, key)?;
        access.state.shape = shape;
        self.maybe_spill(access.state)?;
        Ok(removed)
    }

    /// Records with `low <= key < high` in key order. Either bound may be
    /// open and may be shorter than a full key (a prefix bound).
    pub fn find_range<'a>(
        &'a self,
        txn: &'a Transaction,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<RangeIter<'a>> {
        let state = self.state(txn)?;
        self.stats.inc_range_scans();
        RangeIter::new(
            Box::new(TxnView { tree: self, state }),
            &self.options.params,
            state.shape.root,
            low,
            high,
        )
    }

    /// Number of records visible to `txn`.
    pub fn size(&self, txn: &Transaction) -> Result<u64> {
        Ok(self.state(txn)?.shape.count)
    }

    /// Height of the tree visible to `txn`.
    pub fn height(&self, txn: &Transaction) -> Result<u32> {
        Ok(self.state(txn)?.shape.height)
    }

    /// Verifies the structure visible to `txn`.
    pub fn check(&self, txn: &Transaction) -> Result<CheckReport> {
        let state = self.state(txn)?;
        ops::check(&TxnView { tree: self, state }, &self.options.params, state.shape)
    }

    /// Flushes and closes the block store.
    pub fn close(&self) -> Result<()> {
        self.store.sync()?;
        self.store.close()
    }

    fn state<'a>(&self, txn: &'a Transaction) -> Result<&'a TreeTxnState> {
        txn.component_state::<TreeTxnState>(self.options.component)
    }

    fn state_mut<'a>(&self, txn: &'a mut Transaction) -> Result<&'a mut TreeTxnState> {
        let state = txn.component_state_mut::<TreeTxnState>(self.options.component)?;
        if state.mode != TxnMode::Write {
            return Err(StoreError::Invalid("write operation in a read transaction"));
        }
        Ok(state)
    }

    fn load(&self, id: BlockId) -> Result<Node> {
        let buf = self.store.get(id)?;
        Node::decode(&buf, &self.options.params)
    }

    fn flush(&self, state: &mut TreeTxnState) -> Result<()> {
        for (id, node) in state.dirty.drain() {
            self.store.put(id, &node.encode(&self.options.params)?)?;
        }
        Ok(())
    }

    fn maybe_spill(&self, state: &mut TreeTxnState) -> Result<()> {
        if state.dirty.len() <= self.options.write_cache_blocks {
            return Ok(());
        }
        trace!(index = %self.options.label, blocks = state.dirty.len(), "btree.spill");
        self.stats.inc_spills();
        // Owned blocks are unreachable from any committed root, so readers
        // cannot observe them early.
        self.flush(state)
    }

    fn reclaim(&self, shared: &mut Shared) {
        let oldest_reader = shared.readers.keys().next().copied();
        let mut reclaimed = 0u64;
        while let Some(&(generation, _)) = shared.retired.front() {
            if oldest_reader.is_some_and(|oldest| oldest < generation) {
                break;
            }
            if let Some((_, ids)) = shared.retired.pop_front() {
                reclaimed += ids.len() as u64;
                shared.pool.extend(ids);
            }
        }
        if reclaimed > 0 {
            self.stats.add_blocks_reclaimed(reclaimed);
            trace!(index = %self.options.label, blocks = reclaimed, "btree.reclaim");
        }
    }

    fn release_reader(&self, generation: u64) {
        let mut shared = self.shared.lock();
        if let Some(count) = shared.readers.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                shared.readers.remove(&generation);
            }
        }
    }
}

impl TransactionalComponent for BPlusTree {
    type State = TreeTxnState;

    fn component_id(&self) -> ComponentId {
        self.options.component
    }

    fn label(&self) -> &str {
        &self.options.label
    }

    fn begin(&self, txn: TxnId, mode: TxnMode) -> Result<TreeTxnState> {
        let mut shared = self.shared.lock();
        let base = shared.committed;
        let mut state = TreeTxnState::new(mode, base);
        match mode {
            TxnMode::Read => *shared.readers.entry(base.generation).or_insert(0) += 1,
            TxnMode::Write => {
                if self.store.is_read_only() {
                    return Err(StoreError::Invalid("index is opened read-only"));
                }
                self.reclaim(&mut shared);
                state.pool = std::mem::take(&mut shared.pool);
            }
        }
        trace!(index = %self.options.label, txn = %txn, generation = base.generation, "btree.begin");
        Ok(state)
    }

    fn commit_prepare(&self, _txn: TxnId, state: &mut TreeTxnState) -> Result<Vec<u8>> {
        if state.mode == TxnMode::Read || !state.is_modified() {
            return Ok(Vec::new());
        }
        self.flush(state)?;
        self.store.sync()?;
        let root = TreeRoot {
            root: state.shape.root,
            height: state.shape.height,
            count: state.shape.count,
            limit: state.next_fresh,
            generation: state.base.generation + 1,
        };
        state.prepared = Some(root);
        Ok(root.encode().to_vec())
    }

    fn commit(&self, txn: TxnId, state: &mut TreeTxnState) -> Result<()> {
        let Some(root) = state.prepared else {
            return Ok(());
        };
        self.root_file.write(&root.encode())?;
        let mut shared = self.shared.lock();
        shared.committed = root;
        let retired = std::mem::take(&mut state.retired);
        if !retired.is_empty() {
            shared.retired.push_back((root.generation, retired));
        }
        shared.pool.append(&mut state.pool);
        shared.pool.append(&mut state.recycled);
        state.taken.clear();
        debug!(
            index = %self.options.label,
            txn = %txn,
            root = %root.root,
            count = root.count,
            generation = root.generation,
            "btree.commit"
        );
        Ok(())
    }

    fn commit_end(&self, _txn: TxnId, state: TreeTxnState) {
        if state.mode == TxnMode::Read {
            self.release_reader(state.base.generation);
        }
    }

    fn abort(&self, txn: TxnId, mut state: TreeTxnState) -> Result<()> {
        if state.mode == TxnMode::Read {
            self.release_reader(state.base.generation);
            return Ok(());
        }
        {
            let mut shared = self.shared.lock();
            shared.pool.append(&mut state.pool);
            shared.pool.append(&mut state.taken);
        }
        // Once prepared, the journal may already hold this root; its blocks
        // must survive until recovery decides.
        if state.prepared.is_none() && self.store.limit() > state.base.limit {
            self.store.truncate(state.base.limit)?;
        }
        debug!(index = %self.options.label, txn = %txn, "btree.abort");
        Ok(())
    }

    fn recover(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let root = TreeRoot::decode(payload)?;
        let mut shared = self.shared.lock();
        if root.generation >= shared.committed.generation {
            shared.committed = root;
            shared.recovered = true;
        }
        Ok(())
    }

    fn finish_recovery(&self) -> Result<()> {
        if self.store.is_read_only() {
            return Ok(());
        }
        let (committed, recovered) = {
            let mut shared = self.shared.lock();
            (shared.committed, std::mem::take(&mut shared.recovered))
        };
        if recovered {
            self.root_file.write(&committed.encode())?;
            info!(
                index = %self.options.label,
                root = %committed.root,
                generation = committed.generation,
                "btree.recover.root"
            );
        }
        if self.store.limit() > committed.limit {
            debug!(
                index = %self.options.label,
                from = self.store.limit(),
                to = committed.limit,
                "btree.recover.truncate"
            );
            self.store.truncate(committed.limit)?;
        }
        Ok(())
    }
}
