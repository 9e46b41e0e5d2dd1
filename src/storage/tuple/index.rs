#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use crate::storage::btree::{BPlusTree, TreeParams};
use crate::types::{NodeId, Result, StoreError};

/// Column letters of a triple, in canonical order.
pub const TRIPLE_COLUMNS: &str = "SPO";
/// Column letters of a quad, in canonical order.
pub const QUAD_COLUMNS: &str = "GSPO";

/// Default triple index orders.
pub const TRIPLE_INDEXES: [&str; 3] = ["SPO", "POS", "OSP"];
/// Default quad index orders.
pub const QUAD_INDEXES: [&str; 6] = ["GSPO", "GPOS", "GOSP", "SPOG", "POSG", "OSPG"];

const SLOT: usize = 8;

/// Geometry of a tuple index: `arity` ids as key, no value.
pub fn tuple_params(block_size: usize, arity: usize) -> Result<TreeParams> {
    TreeParams::new(block_size, arity * SLOT, 0)
}

/// Canonical column letters for `arity`.
pub fn canonical_columns(arity: usize) -> Result<&'static str> {
    match arity {
        3 => Ok(TRIPLE_COLUMNS),
        4 => Ok(QUAD_COLUMNS),
        _ => Err(StoreError::InvalidOwned(format!(
            "tuples have 3 or 4 columns, not {arity}"
        ))),
    }
}

/// One permutation of the tuple columns backed by a B+Tree.
///
/// `order[i]` is the canonical column stored at key position `i`.
pub struct TupleIndex {
    name: String,
    order: Vec<usize>,
    tree: Arc<BPlusTree>,
}

impl TupleIndex {
    /// Builds the index named by a column-order string such as `"POS"`.
    pub fn new(name: &str, tree: Arc<BPlusTree>) -> Result<Self> {
        let canonical = canonical_columns(name.len())?;
        let mut order = Vec::with_capacity(name.len());
        for letter in name.chars() {
            let column = canonical.find(letter).ok_or_else(|| {
                StoreError::InvalidOwned(format!("index {name} uses unknown column {letter}"))
            })?;
            if order.contains(&column) {
                return Err(StoreError::InvalidOwned(format!(
                    "index {name} repeats column {letter}"
                )));
            }
            order.push(column);
        }
        let params = tree.params();
        if params.key_len() != name.len() * SLOT || params.value_len() != 0 {
            return Err(StoreError::InvalidOwned(format!(
                "index {name} needs {} byte keys and no value",
                name.len() * SLOT
            )));
        }
        Ok(Self {
            name: name.to_owned(),
            order,
            tree,
        })
    }

    /// Column-order string.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of columns.
    pub fn arity(&self) -> usize {
        self.order.len()
    }

    /// Backing tree.
    pub fn tree(&self) -> &Arc<BPlusTree> {
        &self.tree
    }

    /// Key bytes of a tuple given in canonical order.
    pub fn key_for(&self, tuple: &[NodeId]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.order.len() * SLOT);
        for &column in &self.order {
            key.extend_from_slice(&tuple[column].to_be_bytes());
        }
        key
    }

    /// Canonical-order tuple stored in `key`.
    pub fn tuple_from_key(&self, key: &[u8]) -> Vec<NodeId> {
        let mut tuple = vec![NodeId::NONE; self.order.len()];
        for (pos, &column) in self.order.iter().enumerate() {
            let mut raw = [0u8; SLOT];
            raw.copy_from_slice(&key[pos * SLOT..(pos + 1) * SLOT]);
            tuple[column] = NodeId::from_be_bytes(raw);
        }
        tuple
    }

    /// Number of leading key columns bound in `pattern`.
    pub fn bound_prefix(&self, pattern: &[NodeId]) -> usize {
        self.order
            .iter()
            .take_while(|&&column| pattern[column] != NodeId::ANY)
            .count()
    }

    /// Key prefix covering the leading bound columns of `pattern`.
    pub fn prefix_for(&self, pattern: &[NodeId]) -> Vec<u8> {
        let bound = self.bound_prefix(pattern);
        let mut prefix = Vec::with_capacity(bound * SLOT);
        for &column in &self.order[..bound] {
            prefix.extend_from_slice(&pattern[column].to_be_bytes());
        }
        prefix
    }
}

impl fmt::Debug for TupleIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TupleIndex")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish()
    }
}
