//! Block layout of tree nodes.
//!
//! Every node starts with an 8-byte header: `kind:u8`, `reserved:u8`,
//! `count:u16 BE`, `reserved:u32`. A leaf follows it with `count` records;
//! an internal node with `count` separator keys and `count + 1` child ids.

use std::cmp::Ordering;

use super::params::{TreeParams, NODE_HEADER_LEN};
use crate::types::{BlockId, Result, StoreError};

const KIND_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 2;

/// Logical kind of a tree block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum NodeKind {
    Leaf = 1,
    Internal = 2,
}

impl NodeKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Leaf),
            2 => Ok(Self::Internal),
            _ => Err(StoreError::Corruption("unknown tree node kind")),
        }
    }
}

/// Sorted records of a leaf, each `key_len + value_len` bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct LeafNode {
    pub(crate) records: Vec<Vec<u8>>,
}

impl LeafNode {
    /// Binary search by key; `Err` carries the insertion point.
    pub(crate) fn search(&self, key: &[u8], key_len: usize) -> std::result::Result<usize, usize> {
        self.records
            .binary_search_by(|record| record[..key_len].cmp(key))
    }

    /// Index of the first record whose key is `>= key`.
    pub(crate) fn lower_bound(&self, key: &[u8], key_len: usize) -> usize {
        self.records
            .partition_point(|record| record[..key_len].cmp(key) == Ordering::Less)
    }
}

/// Separator keys and child ids. Keys in `children[i]` are `>= keys[i-1]`
/// and `< keys[i]`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct InternalNode {
    pub(crate) keys: Vec<Vec<u8>>,
    pub(crate) children: Vec<BlockId>,
}

impl InternalNode {
    /// Index of the child whose range holds `key`.
    pub(crate) fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|sep| sep.as_slice() <= key)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    pub(crate) fn empty_leaf() -> Self {
        Node::Leaf(LeafNode::default())
    }

    pub(crate) fn encode(&self, params: &TreeParams) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; params.block_size()];
        let (kind, count) = match self {
            Node::Leaf(leaf) => (NodeKind::Leaf, leaf.records.len()),
            Node::Internal(node) => (NodeKind::Internal, node.keys.len()),
        };
        buf[KIND_OFFSET] = kind as u8;
        buf[COUNT_OFFSET..COUNT_OFFSET + 2].copy_from_slice(&(count as u16).to_be_bytes());
        let mut off = NODE_HEADER_LEN;
        match self {
            Node::Leaf(leaf) => {
                if count > params.leaf_capacity() {
                    return Err(StoreError::Invalid("leaf over capacity"));
                }
                let len = params.record_len();
                for record in &leaf.records {
                    if record.len() != len {
                        return Err(StoreError::Invalid("leaf record has the wrong length"));
                    }
                    buf[off..off + len].copy_from_slice(record);
                    off += len;
                }
            }
            Node::Internal(node) => {
                if count > params.max_internal_keys() {
                    return Err(StoreError::Invalid("internal node over capacity"));
                }
                if node.children.len() != count + 1 {
                    return Err(StoreError::Invalid("internal node child count mismatch"));
                }
                let key_len = params.key_len();
                for key in &node.keys {
                    if key.len() != key_len {
                        return Err(StoreError::Invalid("separator has the wrong length"));
                    }
                    buf[off..off + key_len].copy_from_slice(key);
                    off += key_len;
                }
                for child in &node.children {
                    buf[off..off + 8].copy_from_slice(&child.0.to_be_bytes());
                    off += 8;
                }
            }
        }
        Ok(buf)
    }

    pub(crate) fn decode(buf: &[u8], params: &TreeParams) -> Result<Self> {
        if buf.len() != params.block_size() {
            return Err(StoreError::Corruption("tree block has the wrong size"));
        }
        let kind = NodeKind::from_u8(buf[KIND_OFFSET])?;
        let count = u16::from_be_bytes([buf[COUNT_OFFSET], buf[COUNT_OFFSET + 1]]) as usize;
        let mut off = NODE_HEADER_LEN;
        match kind {
            NodeKind::Leaf => {
                if count > params.leaf_capacity() {
                    return Err(StoreError::Corruption("leaf count exceeds capacity"));
                }
                let len = params.record_len();
                let mut records = Vec::with_capacity(count);
                for _ in 0..count {
                    records.push(buf[off..off + len].to_vec());
                    off += len;
                }
                Ok(Node::Leaf(LeafNode { records }))
            }
            NodeKind::Internal => {
                if count > params.max_internal_keys() {
                    return Err(StoreError::Corruption("internal count exceeds capacity"));
                }
                let key_len = params.key_len();
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(buf[off..off + key_len].to_vec());
                    off += key_len;
                }
                let mut children = Vec::with_capacity(count + 1);
                for _ in 0..=count {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&buf[off..off + 8]);
                    children.push(BlockId(u64::from_be_bytes(raw)));
                    off += 8;
                }
                Ok(Node::Internal(InternalNode { keys, children }))
            }
        }
    }
}
