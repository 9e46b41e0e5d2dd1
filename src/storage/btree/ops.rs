//! Tree algorithms shared by the transactional and the builder modes.
//!
//! Everything here works on node ids through [`NodeRead`] / [`NodeWrite`];
//! whether a write lands in place or on a copy is decided by the access
//! implementation, which is why every write returns the id the node now
//! lives at.

use super::page::{InternalNode, LeafNode, Node};
use super::params::{Record, TreeParams};
use super::stats::TreeStats;
use crate::types::{BlockId, Result, StoreError};

pub(crate) trait NodeRead {
    fn read_node(&self, id: BlockId) -> Result<Node>;
}

pub(crate) trait NodeWrite: NodeRead {
    /// Replaces the node at `id` and returns where it now lives.
    fn write_node(&mut self, id: BlockId, node: Node) -> Result<BlockId>;
    fn alloc_node(&mut self, node: Node) -> Result<BlockId>;
    fn free_node(&mut self, id: BlockId) -> Result<()>;
}

/// Root location and record count of one version of a tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Shape {
    pub(crate) root: BlockId,
    pub(crate) height: u32,
    pub(crate) count: u64,
}

pub(crate) fn find<R: NodeRead + ?Sized>(
    reader: &R,
    params: &TreeParams,
    root: BlockId,
    key: &[u8],
) -> Result<Option<Record>> {
    let mut id = root;
    loop {
        match reader.read_node(id)? {
            Node::Internal(node) => id = node.children[node.child_index(key)],
            Node::Leaf(mut leaf) => {
                return Ok(match leaf.search(key, params.key_len()) {
                    Ok(idx) => Some(Record::from_raw(
                        leaf.records.swap_remove(idx),
                        params.key_len(),
                    )),
                    Err(_) => None,
                })
            }
        }
    }
}

struct Inserted {
    id: BlockId,
    split: Option<(Vec<u8>, BlockId)>,
    added: bool,
}

/// Inserts or overwrites `record`. Returns the new shape and whether the
/// key was new.
pub(crate) fn insert<A: NodeWrite>(
    access: &mut A,
    params: &TreeParams,
    stats: &TreeStats,
    shape: Shape,
    record: &[u8],
) -> Result<(Shape, bool)> {
    let Some(inserted) = insert_into(access, params, stats, shape.root, record)? else {
        return Ok((shape, false));
    };
    let mut next = shape;
    next.root = inserted.id;
    if let Some((sep, right)) = inserted.split {
        next.root = access.alloc_node(Node::Internal(InternalNode {
            keys: vec![sep],
            children: vec![inserted.id, right],
        }))?;
        next.height += 1;
    }
    if inserted.added {
        next.count += 1;
    }
    Ok((next, inserted.added))
}

/// `None` means the identical record was already present.
fn insert_into<A: NodeWrite>(
    access: &mut A,
    params: &TreeParams,
    stats: &TreeStats,
    id: BlockId,
    record: &[u8],
) -> Result<Option<Inserted>> {
    let key_len = params.key_len();
    let key = &record[..key_len];
    match access.read_node(id)? {
        Node::Leaf(mut leaf) => {
            let added = match leaf.search(key, key_len) {
                Ok(idx) if leaf.records[idx] == record => return Ok(None),
                Ok(idx) => {
                    leaf.records[idx] = record.to_vec();
                    false
                }
                Err(idx) => {
                    leaf.records.insert(idx, record.to_vec());
                    true
                }
            };
            let split = if leaf.records.len() > params.leaf_capacity() {
                let mid = leaf.records.len() / 2;
                let right = leaf.records.split_off(mid);
                let sep = right[0][..key_len].to_vec();
                let right_id = access.alloc_node(Node::Leaf(LeafNode { records: right }))?;
                stats.inc_leaf_splits();
                Some((sep, right_id))
            } else {
                None
            };
            let id = access.write_node(id, Node::Leaf(leaf))?;
            Ok(Some(Inserted { id, split, added }))
        }
        Node::Internal(mut node) => {
            let idx = node.child_index(key);
            let child = node.children[idx];
            let Some(inserted) = insert_into(access, params, stats, child, record)? else {
                return Ok(None);
            };
            if inserted.id == child && inserted.split.is_none() {
                return Ok(Some(Inserted {
                    id,
                    split: None,
                    added: inserted.added,
                }));
            }
            node.children[idx] = inserted.id;
            if let Some((sep, right)) = inserted.split {
                node.keys.insert(idx, sep);
                node.children.insert(idx + 1, right);
            }
            let split = if node.keys.len() > params.max_internal_keys() {
                let mid = node.keys.len() / 2;
                let right_keys = node.keys.split_off(mid + 1);
                let sep = node
                    .keys
                    .pop()
                    .ok_or(StoreError::Corruption("internal split without separator"))?;
                let right_children = node.children.split_off(mid + 1);
                let right_id = access.alloc_node(Node::Internal(InternalNode {
                    keys: right_keys,
                    children: right_children,
                }))?;
                stats.inc_internal_splits();
                Some((sep, right_id))
            } else {
                None
            };
            let id = access.write_node(id, Node::Internal(node))?;
            Ok(Some(Inserted {
                id,
                split,
                added: inserted.added,
            }))
        }
    }
}

struct Removed {
    id: BlockId,
    underflow: bool,
}

/// Removes `key`. Absent keys leave the tree untouched and return `false`.
pub(crate) fn delete<A: NodeWrite>(
    access: &mut A,
    params: &TreeParams,
    stats: &TreeStats,
    shape: Shape,
    key: &[u8],
) -> Result<(Shape, bool)> {
    let Some(removed) = delete_from(access, params, stats, shape.root, key)? else {
        return Ok((shape, false));
    };
    let mut next = shape;
    next.root = removed.id;
    next.count = next.count.saturating_sub(1);
    // An internal root left with a single child gives way to that child.
    while let Node::Internal(node) = access.read_node(next.root)? {
        if !node.keys.is_empty() {
            break;
        }
        access.free_node(next.root)?;
        next.root = node.children[0];
        next.height -= 1;
    }
    Ok((next, true))
}

fn delete_from<A: NodeWrite>(
    access: &mut A,
    params: &TreeParams,
    stats: &TreeStats,
    id: BlockId,
    key: &[u8],
) -> Result<Option<Removed>> {
    match access.read_node(id)? {
        Node::Leaf(mut leaf) => {
            let Ok(idx) = leaf.search(key, params.key_len()) else {
                return Ok(None);
            };
            leaf.records.remove(idx);
            let underflow = leaf.records.len() < params.min_leaf_records();
            let id = access.write_node(id, Node::Leaf(leaf))?;
            Ok(Some(Removed { id, underflow }))
        }
        Node::Internal(mut node) => {
            let idx = node.child_index(key);
            let child = node.children[idx];
            let Some(removed) = delete_from(access, params, stats, child, key)? else {
                return Ok(None);
            };
            if removed.id == child && !removed.underflow {
                return Ok(Some(Removed {
                    id,
                    underflow: false,
                }));
            }
            node.children[idx] = removed.id;
            if removed.underflow {
                rebalance(access, params, stats, &mut node, idx)?;
            }
            let underflow = node.keys.len() < params.min_internal_keys();
            let id = access.write_node(id, Node::Internal(node))?;
            Ok(Some(Removed { id, underflow }))
        }
    }
}

/// Fixes an underflowing `parent.children[idx]` by merging with or
/// borrowing from a sibling.
fn rebalance<A: NodeWrite>(
    access: &mut A,
    params: &TreeParams,
    stats: &TreeStats,
    parent: &mut InternalNode,
    idx: usize,
) -> Result<()> {
    if parent.children.len() < 2 {
        return Err(StoreError::Corruption("internal node with a single child"));
    }
    let left_idx = if idx > 0 { idx - 1 } else { 0 };
    let right_idx = left_idx + 1;
    let left_id = parent.children[left_idx];
    let right_id = parent.children[right_idx];
    let key_len = params.key_len();
    match (access.read_node(left_id)?, access.read_node(right_id)?) {
        (Node::Leaf(mut left), Node::Leaf(mut right)) => {
            if left.records.len() + right.records.len() <= params.leaf_capacity() {
                left.records.append(&mut right.records);
                access.free_node(right_id)?;
                parent.children[left_idx] = access.write_node(left_id, Node::Leaf(left))?;
                parent.keys.remove(left_idx);
                parent.children.remove(right_idx);
                stats.inc_leaf_merges();
                return Ok(());
            }
            if left.records.len() < right.records.len() {
                let moved = right.records.remove(0);
                left.records.push(moved);
            } else {
                let moved = left
                    .records
                    .pop()
                    .ok_or(StoreError::Corruption("empty leaf sibling"))?;
                right.records.insert(0, moved);
            }
            parent.keys[left_idx] = right.records[0][..key_len].to_vec();
            parent.children[left_idx] = access.write_node(left_id, Node::Leaf(left))?;
            parent.children[right_idx] = access.write_node(right_id, Node::Leaf(right))?;
            stats.inc_redistributions();
            Ok(())
        }
        (Node::Internal(mut left), Node::Internal(mut right)) => {
            let sep = parent.keys[left_idx].clone();
            if left.keys.len() + right.keys.len() < params.max_internal_keys() {
                left.keys.push(sep);
                left.keys.append(&mut right.keys);
                left.children.append(&mut right.children);
                access.free_node(right_id)?;
                parent.children[left_idx] = access.write_node(left_id, Node::Internal(left))?;
                parent.keys.remove(left_idx);
                parent.children.remove(right_idx);
                stats.inc_internal_merges();
                return Ok(());
            }
            if left.keys.len() < right.keys.len() {
                left.keys.push(sep);
                left.children.push(right.children.remove(0));
                parent.keys[left_idx] = right.keys.remove(0);
            } else {
                let moved_key = left
                    .keys
                    .pop()
                    .ok_or(StoreError::Corruption("empty internal sibling"))?;
                let moved_child = left
                    .children
                    .pop()
                    .ok_or(StoreError::Corruption("empty internal sibling"))?;
                right.keys.insert(0, sep);
                right.children.insert(0, moved_child);
                parent.keys[left_idx] = moved_key;
            }
            parent.children[left_idx] = access.write_node(left_id, Node::Internal(left))?;
            parent.children[right_idx] = access.write_node(right_id, Node::Internal(right))?;
            stats.inc_redistributions();
            Ok(())
        }
        _ => Err(StoreError::Corruption("siblings at different depths")),
    }
}

/// Lazy in-order scan over `[low, high)`.
///
/// Holds the path from the root to the current leaf, so each step reads at
/// most one new block per level. The iterator reflects the tree as of its
/// creation and must not outlive the transaction it was created in.
pub struct RangeIter<'a> {
    reader: Box<dyn NodeRead + 'a>,
    key_len: usize,
    high: Option<Vec<u8>>,
    stack: Vec<(InternalNode, usize)>,
    leaf: LeafNode,
    pos: usize,
    done: bool,
}

impl<'a> RangeIter<'a> {
    pub(crate) fn new(
        reader: Box<dyn NodeRead + 'a>,
        params: &TreeParams,
        root: BlockId,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<Self> {
        let mut iter = Self {
            reader,
            key_len: params.key_len(),
            high: high.map(<[u8]>::to_vec),
            stack: Vec::new(),
            leaf: LeafNode::default(),
            pos: 0,
            done: false,
        };
        if let (Some(low), Some(high)) = (low, high) {
            if low >= high {
                iter.done = true;
                return Ok(iter);
            }
        }
        let mut id = root;
        loop {
            match iter.reader.read_node(id)? {
                Node::Internal(node) => {
                    let idx = low.map_or(0, |low| node.child_index(low));
                    id = node.children[idx];
                    iter.stack.push((node, idx + 1));
                }
                Node::Leaf(leaf) => {
                    iter.pos = low.map_or(0, |low| leaf.lower_bound(low, iter.key_len));
                    iter.leaf = leaf;
                    return Ok(iter);
                }
            }
        }
    }

    /// Moves to the leftmost leaf of the next subtree. Returns `false` at
    /// the end of the tree.
    fn advance_leaf(&mut self) -> Result<bool> {
        let next = loop {
            let Some((node, next)) = self.stack.last_mut() else {
                return Ok(false);
            };
            if *next < node.children.len() {
                let child = node.children[*next];
                *next += 1;
                break child;
            }
            self.stack.pop();
        };
        let mut id = next;
        loop {
            match self.reader.read_node(id)? {
                Node::Internal(node) => {
                    id = node.children[0];
                    self.stack.push((node, 1));
                }
                Node::Leaf(leaf) => {
                    self.leaf = leaf;
                    self.pos = 0;
                    return Ok(true);
                }
            }
        }
    }
}

impl Iterator for RangeIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.pos < self.leaf.records.len() {
                let record = &self.leaf.records[self.pos];
                if let Some(high) = &self.high {
                    if record[..self.key_len] >= high[..] {
                        self.done = true;
                        return None;
                    }
                }
                self.pos += 1;
                return Some(Ok(Record::from_raw(record.clone(), self.key_len)));
            }
            match self.advance_leaf() {
                Ok(true) => {}
                Ok(false) => self.done = true,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

/// Summary returned by a successful consistency check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct CheckReport {
    /// Levels from root to leaves (1 for a lone leaf root).
    pub height: u32,
    /// Records found across all leaves.
    pub records: u64,
    /// Leaf blocks visited.
    pub leaves: u64,
    /// Internal blocks visited.
    pub internal_nodes: u64,
}

struct CheckState {
    leaf_depth: Option<u32>,
    last_key: Option<Vec<u8>>,
    report: CheckReport,
}

fn fail(msg: String) -> StoreError {
    StoreError::CheckFailed(msg)
}

/// Walks the whole tree and verifies ordering, separator bounds, node
/// occupancy, uniform leaf depth and the recorded shape.
pub(crate) fn check<R: NodeRead + ?Sized>(
    reader: &R,
    params: &TreeParams,
    shape: Shape,
) -> Result<CheckReport> {
    let mut state = CheckState {
        leaf_depth: None,
        last_key: None,
        report: CheckReport::default(),
    };
    check_node(reader, params, shape.root, 1, None, None, true, &mut state)?;
    let mut report = state.report;
    report.height = state.leaf_depth.unwrap_or(1);
    if report.height != shape.height {
        return Err(fail(format!(
            "height is {} but the root records {}",
            report.height, shape.height
        )));
    }
    if report.records != shape.count {
        return Err(fail(format!(
            "found {} records but the root records {}",
            report.records, shape.count
        )));
    }
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn check_node<R: NodeRead + ?Sized>(
    reader: &R,
    params: &TreeParams,
    id: BlockId,
    depth: u32,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    is_root: bool,
    state: &mut CheckState,
) -> Result<()> {
    let key_len = params.key_len();
    let in_bounds =
        |key: &[u8]| lower.map_or(true, |lo| key >= lo) && upper.map_or(true, |hi| key < hi);
    match reader.read_node(id)? {
        Node::Leaf(leaf) => {
            match state.leaf_depth {
                None => state.leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Err(fail(format!(
                        "leaf {id} at depth {depth}, expected {expected}"
                    )))
                }
                Some(_) => {}
            }
            let len = leaf.records.len();
            if !is_root && len < params.min_leaf_records() {
                return Err(fail(format!("leaf {id} underfull with {len} records")));
            }
            for record in &leaf.records {
                let key = &record[..key_len];
                if !in_bounds(key) {
                    return Err(fail(format!(
                        "leaf {id} key {} outside parent bounds",
                        hex::encode(key)
                    )));
                }
                if let Some(last) = &state.last_key {
                    if key <= last.as_slice() {
                        return Err(fail(format!(
                            "key {} not greater than predecessor {}",
                            hex::encode(key),
                            hex::encode(last)
                        )));
                    }
                }
                state.last_key = Some(key.to_vec());
            }
            state.report.records += len as u64;
            state.report.leaves += 1;
            Ok(())
        }
        Node::Internal(node) => {
            let keys = node.keys.len();
            if is_root && keys == 0 {
                return Err(fail(format!("internal root {id} has no separators")));
            }
            if !is_root && keys < params.min_internal_keys() {
                return Err(fail(format!("internal node {id} underfull with {keys} keys")));
            }
            for (idx, key) in node.keys.iter().enumerate() {
                if !in_bounds(key) {
                    return Err(fail(format!("separator in {id} outside parent bounds")));
                }
                if idx > 0 && node.keys[idx - 1] >= *key {
                    return Err(fail(format!("separators in {id} not strictly increasing")));
                }
            }
            state.report.internal_nodes += 1;
            for (idx, &child) in node.children.iter().enumerate() {
                let lo = if idx == 0 { lower } else { Some(node.keys[idx - 1].as_slice()) };
                let hi = if idx == keys { upper } else { Some(node.keys[idx].as_slice()) };
                check_node(reader, params, child, depth + 1, lo, hi, false, state)?;
            }
            Ok(())
        }
    }
}
