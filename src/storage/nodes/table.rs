#![forbid(unsafe_code)]

use std::fmt;
use std::hash::Hasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use siphasher::sip128::{Hasher128, SipHasher13};
use tracing::{debug, trace};

use super::inline;
use super::term::Term;
use crate::primitives::bytes::{buf, ord};
use crate::storage::btree::{BPlusTree, Record, TreeParams};
use crate::storage::object::TransObjectFile;
use crate::txn::{Transaction, TransactionalComponent};
use crate::types::{ComponentId, NodeId, Result, StoreError, TxnId, TxnMode};

/// Length of a term hash.
pub const TERM_HASH_LEN: usize = 16;
/// Forward index key: term hash followed by a `u16` chain sequence.
pub const FORWARD_KEY_LEN: usize = TERM_HASH_LEN + 2;
/// Encoded length of a [`NodeId`] and of an object offset.
pub const ID_LEN: usize = 8;

/// Hash applied to a term's canonical bytes.
pub type TermHasher = Arc<dyn Fn(&[u8]) -> [u8; TERM_HASH_LEN] + Send + Sync>;

/// SipHash-1-3-128 with zero keys.
pub fn sip_term_hash(bytes: &[u8]) -> [u8; TERM_HASH_LEN] {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(bytes);
    let hash = hasher.finish128();
    let mut out = [0u8; TERM_HASH_LEN];
    out[..8].copy_from_slice(&hash.h1.to_be_bytes());
    out[8..].copy_from_slice(&hash.h2.to_be_bytes());
    out
}

/// Geometry of the forward (term hash to id) index.
pub fn forward_params(block_size: usize) -> Result<TreeParams> {
    TreeParams::new(block_size, FORWARD_KEY_LEN, ID_LEN)
}

/// Geometry of the reverse (id to object offset) index.
pub fn reverse_params(block_size: usize) -> Result<TreeParams> {
    TreeParams::new(block_size, ID_LEN, ID_LEN)
}

/// Node table configuration.
#[derive(Clone)]
pub struct NodeTableOptions {
    /// Entries per direction kept in the LRU caches; `0` disables caching.
    pub cache_size: usize,
    /// Hash used to key the forward index.
    pub hasher: TermHasher,
}

impl Default for NodeTableOptions {
    fn default() -> Self {
        Self {
            cache_size: 10_000,
            hasher: Arc::new(sip_term_hash),
        }
    }
}

impl NodeTableOptions {
    /// Sets the per-direction cache capacity.
    pub fn cache_size(mut self, entries: usize) -> Self {
        self.cache_size = entries;
        self
    }

    /// Replaces the term hash.
    pub fn hasher(mut self, hasher: TermHasher) -> Self {
        self.hasher = hasher;
        self
    }
}

impl fmt::Debug for NodeTableOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTableOptions")
            .field("cache_size", &self.cache_size)
            .finish_non_exhaustive()
    }
}

/// Counters kept by a [`NodeTable`].
#[derive(Default)]
pub struct NodeTableStats {
    lookups: AtomicU64,
    cache_hits: AtomicU64,
    inline_hits: AtomicU64,
    allocations: AtomicU64,
    collisions: AtomicU64,
    resolves: AtomicU64,
}

/// Point-in-time copy of [`NodeTableStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct NodeTableStatsSnapshot {
    /// Term to id lookups, including those made while allocating.
    pub lookups: u64,
    /// Lookups or resolves answered from a cache.
    pub cache_hits: u64,
    /// Terms answered by the inline encoding.
    pub inline_hits: u64,
    /// New dictionary entries written.
    pub allocations: u64,
    /// Chain entries whose hash matched but whose bytes did not.
    pub collisions: u64,
    /// Id to term resolutions.
    pub resolves: u64,
}

impl NodeTableStats {
    /// Copies the counters.
    pub fn snapshot(&self) -> NodeTableStatsSnapshot {
        NodeTableStatsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            inline_hits: self.inline_hits.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            resolves: self.resolves.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-transaction state of the node table: ids allocated so far.
pub struct NodeTableState {
    mode: TxnMode,
    pending: Vec<(Term, NodeId)>,
}

struct Caches {
    by_term: Option<LruCache<Term, NodeId>>,
    by_id: Option<LruCache<NodeId, Term>>,
}

impl Caches {
    fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity);
        Self {
            by_term: cap.map(LruCache::new),
            by_id: cap.map(LruCache::new),
        }
    }

    fn insert(&mut self, term: Term, id: NodeId) {
        if let Some(by_id) = self.by_id.as_mut() {
            by_id.put(id, term.clone());
        }
        if let Some(by_term) = self.by_term.as_mut() {
            by_term.put(term, id);
        }
    }

    fn clear(&mut self) {
        if let Some(by_id) = self.by_id.as_mut() {
            by_id.clear();
        }
        if let Some(by_term) = self.by_term.as_mut() {
            by_term.clear();
        }
    }
}

struct Chain {
    found: Option<NodeId>,
    len: usize,
}

/// Dictionary between RDF terms and [`NodeId`]s.
///
/// Terms with an inline shape never touch the dictionary. Every other term
/// is appended to the object file and indexed twice: the forward index maps
/// `hash ‖ seq` to the id, the reverse index maps the id to the term's
/// object offset. Terms sharing a hash form a chain ordered by `seq` and
/// are told apart by comparing their stored bytes.
///
/// The caches only ever hold committed mappings.
pub struct NodeTable {
    component: ComponentId,
    objects: Arc<TransObjectFile>,
    forward: Arc<BPlusTree>,
    reverse: Arc<BPlusTree>,
    hasher: TermHasher,
    caches: Mutex<Caches>,
    stats: NodeTableStats,
}

impl NodeTable {
    /// Assembles a node table from its object file and two indexes. All
    /// four must be registered with the same coordinator.
    pub fn new(
        component: ComponentId,
        objects: Arc<TransObjectFile>,
        forward: Arc<BPlusTree>,
        reverse: Arc<BPlusTree>,
        options: NodeTableOptions,
    ) -> Result<Self> {
        let fwd = forward.params();
        if fwd.key_len() != FORWARD_KEY_LEN || fwd.value_len() != ID_LEN {
            return Err(StoreError::Invalid("forward node index has the wrong record shape"));
        }
        let rev = reverse.params();
        if rev.key_len() != ID_LEN || rev.value_len() != ID_LEN {
            return Err(StoreError::Invalid("reverse node index has the wrong record shape"));
        }
        Ok(Self {
            component,
            objects,
            forward,
            reverse,
            hasher: options.hasher,
            caches: Mutex::new(Caches::new(options.cache_size)),
            stats: NodeTableStats::default(),
        })
    }

    /// Returns the id of `term`, allocating one in a write transaction.
    pub fn id_for(&self, txn: &mut Transaction, term: &Term) -> Result<NodeId> {
        self.allocate(txn, term)
    }

    /// Allocates an id for `term`; an already known term keeps its id.
    pub fn allocate(&self, txn: &mut Transaction, term: &Term) -> Result<NodeId> {
        if let Some(id) = self.inline_id(term) {
            return Ok(id);
        }
        if self.state(txn)?.mode != TxnMode::Write {
            return Err(StoreError::Invalid("write operation in a read transaction"));
        }
        if let Some(id) = self.cached_id(txn, term)? {
            return Ok(id);
        }
        let encoded = term.encode();
        let hash = (self.hasher)(&encoded);
        let chain = self.scan_chain(txn, &hash, &encoded)?;
        if let Some(id) = chain.found {
            return Ok(id);
        }
        let seq = u16::try_from(chain.len)
            .map_err(|_| StoreError::Invalid("too many terms share one hash"))?;
        let id = NodeId::allocated(self.reverse.size(txn)?);
        let offset = self.objects.write(txn, &encoded)?;

        let mut key = [0u8; FORWARD_KEY_LEN];
        key[..TERM_HASH_LEN].copy_from_slice(&hash);
        key[TERM_HASH_LEN..].copy_from_slice(&seq.to_be_bytes());
        self.forward.insert(txn, &Record::new(&key, &id.to_be_bytes()))?;
        self.reverse
            .insert(txn, &Record::new(&id.to_be_bytes(), &offset.to_be_bytes()))?;

        self.state_mut(txn)?.pending.push((term.clone(), id));
        NodeTableStats::inc(&self.stats.allocations);
        trace!(id = %id, seq, offset, "nodes.allocate");
        Ok(id)
    }

    /// Returns the id of `term` without allocating.
    pub fn lookup(&self, txn: &Transaction, term: &Term) -> Result<Option<NodeId>> {
        if let Some(id) = self.inline_id(term) {
            return Ok(Some(id));
        }
        self.state(txn)?;
        if let Some(id) = self.cached_id(txn, term)? {
            return Ok(Some(id));
        }
        let encoded = term.encode();
        let hash = (self.hasher)(&encoded);
        let chain = self.scan_chain(txn, &hash, &encoded)?;
        if let Some(id) = chain.found {
            self.remember(term, id);
        }
        Ok(chain.found)
    }

    /// Returns the term behind `id`; `NotFound` for ids this table never
    /// issued.
    pub fn term_for(&self, txn: &Transaction, id: NodeId) -> Result<Term> {
        NodeTableStats::inc(&self.stats.resolves);
        if id.is_inline() {
            return inline::decode(id).ok_or(StoreError::NotFound("node id"));
        }
        if !id.is_allocated() || id.payload() >= self.reverse.size(txn)? {
            return Err(StoreError::NotFound("node id"));
        }
        let cached = self
            .caches
            .lock()
            .by_id
            .as_mut()
            .and_then(|cache| cache.get(&id).cloned());
        if let Some(term) = cached {
            NodeTableStats::inc(&self.stats.cache_hits);
            return Ok(term);
        }
        let term = Term::decode(&self.term_bytes(txn, id)?)?;
        self.remember(&term, id);
        Ok(term)
    }

    /// Number of allocated entries visible to `txn`.
    pub fn dictionary_size(&self, txn: &Transaction) -> Result<u64> {
        self.reverse.size(txn)
    }

    /// Hash of a term's canonical bytes as used by the forward index.
    pub fn term_hash(&self, encoded: &[u8]) -> [u8; TERM_HASH_LEN] {
        (self.hasher)(encoded)
    }

    /// Canonical bytes stored for an allocated `id`.
    pub fn term_bytes(&self, txn: &Transaction, id: NodeId) -> Result<Vec<u8>> {
        let record = self
            .reverse
            .find(txn, &id.to_be_bytes())?
            .ok_or(StoreError::NotFound("node id"))?;
        let (_, offset) = Self::reverse_entry(&record)?;
        self.objects.read(txn, offset)
    }

    /// Decodes an `id2node` record into its id and object offset.
    pub fn reverse_entry(record: &Record) -> Result<(NodeId, u64)> {
        let id = buf::Reader::new(record.key(), "id2node key").u64()?;
        let offset = buf::Reader::new(record.value(), "id2node value").u64()?;
        Ok((NodeId(id), offset))
    }

    /// Object file holding term bytes.
    pub fn objects(&self) -> &Arc<TransObjectFile> {
        &self.objects
    }

    /// Term hash to id index.
    pub fn forward(&self) -> &Arc<BPlusTree> {
        &self.forward
    }

    /// Id to object offset index.
    pub fn reverse(&self) -> &Arc<BPlusTree> {
        &self.reverse
    }

    /// Operation counters.
    pub fn stats(&self) -> NodeTableStatsSnapshot {
        self.stats.snapshot()
    }

    fn inline_id(&self, term: &Term) -> Option<NodeId> {
        NodeTableStats::inc(&self.stats.lookups);
        let id = inline::encode(term)?;
        NodeTableStats::inc(&self.stats.inline_hits);
        Some(id)
    }

    // A cached id is committed but may be newer than a reader's snapshot.
    fn cached_id(&self, txn: &Transaction, term: &Term) -> Result<Option<NodeId>> {
        let cached = self
            .caches
            .lock()
            .by_term
            .as_mut()
            .and_then(|cache| cache.get(term).copied());
        match cached {
            Some(id) if id.payload() < self.reverse.size(txn)? => {
                NodeTableStats::inc(&self.stats.cache_hits);
                Ok(Some(id))
            }
            _ => Ok(None),
        }
    }

    fn remember(&self, term: &Term, id: NodeId) {
        if id.payload() < self.reverse.committed_root().count {
            self.caches.lock().insert(term.clone(), id);
        }
    }

    fn scan_chain(
        &self,
        txn: &Transaction,
        hash: &[u8; TERM_HASH_LEN],
        encoded: &[u8],
    ) -> Result<Chain> {
        let high = ord::prefix_successor(hash);
        let entries: Vec<Record> = self
            .forward
            .find_range(txn, Some(hash.as_slice()), high.as_deref())?
            .collect::<Result<_>>()?;
        for record in &entries {
            let mut raw = [0u8; ID_LEN];
            raw.copy_from_slice(record.value());
            let id = NodeId::from_be_bytes(raw);
            if self.term_bytes(txn, id)? == encoded {
                return Ok(Chain {
                    found: Some(id),
                    len: entries.len(),
                });
            }
            NodeTableStats::inc(&self.stats.collisions);
        }
        Ok(Chain {
            found: None,
            len: entries.len(),
        })
    }

    fn state<'a>(&self, txn: &'a Transaction) -> Result<&'a NodeTableState> {
        txn.component_state::<NodeTableState>(self.component)
    }

    fn state_mut<'a>(&self, txn: &'a mut Transaction) -> Result<&'a mut NodeTableState> {
        txn.component_state_mut::<NodeTableState>(self.component)
    }
}

impl fmt::Debug for NodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTable")
            .field("component", &self.component)
            .field("forward", &self.forward.label())
            .field("reverse", &self.reverse.label())
            .finish()
    }
}

impl TransactionalComponent for NodeTable {
    type State = NodeTableState;

    fn component_id(&self) -> ComponentId {
        self.component
    }

    fn label(&self) -> &str {
        "nodes"
    }

    fn begin(&self, _txn: TxnId, mode: TxnMode) -> Result<NodeTableState> {
        Ok(NodeTableState {
            mode,
            pending: Vec::new(),
        })
    }

    fn commit_prepare(&self, _txn: TxnId, _state: &mut NodeTableState) -> Result<Vec<u8>> {
        // Everything durable lives in the object file and the two indexes.
        Ok(Vec::new())
    }

    fn commit(&self, _txn: TxnId, _state: &mut NodeTableState) -> Result<()> {
        Ok(())
    }

    fn commit_end(&self, txn: TxnId, state: NodeTableState) {
        if state.pending.is_empty() {
            return;
        }
        debug!(txn = %txn, allocated = state.pending.len(), "nodes.commit");
        let mut caches = self.caches.lock();
        for (term, id) in state.pending {
            caches.insert(term, id);
        }
    }

    fn abort(&self, txn: TxnId, state: NodeTableState) -> Result<()> {
        if state.mode == TxnMode::Write {
            self.caches.lock().clear();
            debug!(txn = %txn, discarded = state.pending.len(), "nodes.abort");
        }
        Ok(())
    }

    fn recover(&self, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
}
