use std::fmt;

use crate::types::{Result, StoreError};

/// Length of the header at the start of every node block.
pub(crate) const NODE_HEADER_LEN: usize = 8;
const CHILD_ID_LEN: usize = 8;

/// Geometry of a tree: block size and fixed record shape, plus the node
/// capacities derived from them.
///
/// Capacities are computed once; changing the block size of an existing
/// index means rebuilding it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeParams {
    block_size: usize,
    key_len: usize,
    value_len: usize,
    leaf_capacity: usize,
    internal_keys: usize,
}

impl TreeParams {
    /// Derives node capacities for records of `key_len + value_len` bytes.
    pub fn new(block_size: usize, key_len: usize, value_len: usize) -> Result<Self> {
        if key_len == 0 {
            return Err(StoreError::Invalid("key length must be non-zero"));
        }
        let leaf_room = block_size.checked_sub(NODE_HEADER_LEN);
        let internal_room = block_size.checked_sub(NODE_HEADER_LEN + CHILD_ID_LEN);
        let (Some(leaf_room), Some(internal_room)) = (leaf_room, internal_room) else {
            return Err(StoreError::Invalid("block size smaller than a node header"));
        };
        let leaf_capacity = (leaf_room / (key_len + value_len)).min(u16::MAX as usize);
        let internal_keys = (internal_room / (key_len + CHILD_ID_LEN)).min(u16::MAX as usize);
        if leaf_capacity < 2 || internal_keys < 2 {
            return Err(StoreError::InvalidOwned(format!(
                "block size {block_size} too small for {key_len}+{value_len} byte records"
            )));
        }
        Ok(Self {
            block_size,
            key_len,
            value_len,
            leaf_capacity,
            internal_keys,
        })
    }

    /// Bytes per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bytes of key per record.
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Bytes of value per record (may be zero).
    pub fn value_len(&self) -> usize {
        self.value_len
    }

    /// Bytes per record.
    pub fn record_len(&self) -> usize {
        self.key_len + self.value_len
    }

    /// Maximum number of children of an internal node.
    pub fn order(&self) -> usize {
        self.internal_keys + 1
    }

    /// Maximum records per leaf.
    pub fn leaf_capacity(&self) -> usize {
        self.leaf_capacity
    }

    /// Maximum separator keys per internal node.
    pub fn max_internal_keys(&self) -> usize {
        self.internal_keys
    }

    /// Fewest records a non-root leaf may hold.
    pub fn min_leaf_records(&self) -> usize {
        self.leaf_capacity / 2
    }

    /// Fewest keys a non-root internal node may hold.
    pub fn min_internal_keys(&self) -> usize {
        self.internal_keys / 2
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_len {
            return Err(StoreError::InvalidOwned(format!(
                "key is {} bytes, index expects {}",
                key.len(),
                self.key_len
            )));
        }
        Ok(())
    }

    pub(crate) fn check_record(&self, record: &Record) -> Result<()> {
        if record.key_len != self.key_len || record.bytes.len() != self.record_len() {
            return Err(StoreError::InvalidOwned(format!(
                "record shape {}+{} does not match index shape {}+{}",
                record.key_len,
                record.bytes.len().saturating_sub(record.key_len),
                self.key_len,
                self.value_len
            )));
        }
        Ok(())
    }
}

/// A fixed-length key followed by a fixed-length value.
///
/// Records order by key bytes (unsigned, lexicographic).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Record {
    bytes: Vec<u8>,
    key_len: usize,
}

impl Record {
    /// Concatenates `key` and `value`.
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(key.len() + value.len());
        bytes.extend_from_slice(key);
        bytes.extend_from_slice(value);
        Self {
            bytes,
            key_len: key.len(),
        }
    }

    /// A key-only record.
    pub fn from_key(key: &[u8]) -> Self {
        Self::new(key, &[])
    }

    pub(crate) fn from_raw(bytes: Vec<u8>, key_len: usize) -> Self {
        Self { bytes, key_len }
    }

    /// Key bytes.
    pub fn key(&self) -> &[u8] {
        &self.bytes[..self.key_len]
    }

    /// Value bytes.
    pub fn value(&self) -> &[u8] {
        &self.bytes[self.key_len..]
    }

    /// Key followed by value.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Record({}:{})",
            hex::encode(self.key()),
            hex::encode(self.value())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities_follow_block_size() -> Result<()> {
        let params = TreeParams::new(256, 8, 8)?;
        assert_eq!(params.leaf_capacity(), 15);
        assert_eq!(params.max_internal_keys(), 15);
        assert_eq!(params.order(), 16);
        assert_eq!(params.min_leaf_records(), 7);

        let wide = TreeParams::new(8192, 24, 0)?;
        assert_eq!(wide.leaf_capacity(), 341);
        assert_eq!(wide.order(), 256);
        Ok(())
    }

    #[test]
    fn tiny_blocks_are_rejected() {
        assert!(TreeParams::new(32, 8, 8).is_err());
        assert!(TreeParams::new(4, 1, 0).is_err());
        assert!(TreeParams::new(256, 0, 8).is_err());
    }
}
