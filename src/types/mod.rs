#![forbid(unsafe_code)]
//! Identifier newtypes and the crate-wide error type.

use std::fmt;
use std::path::PathBuf;

mod checksum;

pub use checksum::{block_crc32, Checksum, Crc32Fast};

/// Identifier of a fixed-size block inside a block store.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, serde::Serialize)]
pub struct BlockId(pub u64);

/// Identifier of one transaction's lifetime. Never reused by a coordinator.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxnId(pub u64);

/// Fixed-width surrogate for an RDF term.
///
/// The top byte is a tag: `0x00` marks an allocated dictionary entry, the
/// inline tags pack small values directly into the remaining 56 bits and
/// `0x7F` is reserved for the sentinels.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Tag of an allocated (dictionary) id.
    pub const TAG_ALLOCATED: u8 = 0x00;
    /// Tag of an inline integer.
    pub const TAG_INTEGER: u8 = 0x01;
    /// Tag of an inline boolean.
    pub const TAG_BOOLEAN: u8 = 0x02;
    /// Tag of an inline date.
    pub const TAG_DATE: u8 = 0x03;
    /// Tag reserved for sentinel values.
    pub const TAG_SPECIAL: u8 = 0x7F;

    /// The id of a term that does not exist in the dictionary.
    pub const NONE: NodeId = NodeId(0x7F00_0000_0000_0001);
    /// The wildcard id used in tuple patterns.
    pub const ANY: NodeId = NodeId(0x7F00_0000_0000_0002);

    const PAYLOAD_MASK: u64 = (1 << 56) - 1;

    /// Builds an id from a tag and a 56-bit payload.
    pub const fn from_parts(tag: u8, payload: u64) -> NodeId {
        NodeId(((tag as u64) << 56) | (payload & Self::PAYLOAD_MASK))
    }

    /// Builds the id of the `n`-th allocated dictionary entry.
    pub const fn allocated(n: u64) -> NodeId {
        Self::from_parts(Self::TAG_ALLOCATED, n)
    }

    /// Returns the tag byte.
    pub const fn tag(self) -> u8 {
        (self.0 >> 56) as u8
    }

    /// Returns the low 56 bits.
    pub const fn payload(self) -> u64 {
        self.0 & Self::PAYLOAD_MASK
    }

    /// True for ids that point into the dictionary.
    pub const fn is_allocated(self) -> bool {
        self.tag() == Self::TAG_ALLOCATED
    }

    /// True for ids whose value is packed into the id itself.
    pub const fn is_inline(self) -> bool {
        matches!(
            self.tag(),
            Self::TAG_INTEGER | Self::TAG_BOOLEAN | Self::TAG_DATE
        )
    }

    /// True for [`NodeId::NONE`] and [`NodeId::ANY`].
    pub const fn is_special(self) -> bool {
        self.tag() == Self::TAG_SPECIAL
    }

    /// Big-endian encoding, which sorts the same way as the integer.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decodes a big-endian id.
    pub fn from_be_bytes(bytes: [u8; 8]) -> NodeId {
        NodeId(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            NodeId::NONE => f.write_str("NodeId[none]"),
            NodeId::ANY => f.write_str("NodeId[any]"),
            id => write!(f, "NodeId[{:02x}/{}]", id.tag(), id.payload()),
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Stable 16-byte identity of a transactional component.
///
/// Sibling components of one subsystem share a base value and differ in the
/// discriminator held in the two low-order bytes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ComponentId([u8; 16]);

impl ComponentId {
    /// Length of the on-disk form.
    pub const LEN: usize = 16;

    /// Wraps raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns a new id equal to `base` with `discriminator` in the low two bytes.
    pub fn derive(base: ComponentId, discriminator: u16) -> Self {
        let mut bytes = base.0;
        bytes[14..16].copy_from_slice(&discriminator.to_be_bytes());
        Self(bytes)
    }

    /// Returns the discriminator stored in the low two bytes.
    pub fn discriminator(&self) -> u16 {
        u16::from_be_bytes([self.0[14], self.0[15]])
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({self})")
    }
}

/// Access mode requested when a transaction begins.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TxnMode {
    /// Snapshot reader; never blocks and never mutates.
    Read,
    /// The single writer.
    Write,
}

/// Lifecycle state of a transaction.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TxnState {
    /// No transaction is running.
    Inactive,
    /// Began and accepting operations.
    Active,
    /// Components have serialized their commit payloads.
    Prepared,
    /// Terminal: committed.
    Committed,
    /// Terminal: aborted.
    Aborted,
}

impl TxnState {
    /// True for committed and aborted transactions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::Inactive => "inactive",
            TxnState::Active => "active",
            TxnState::Prepared => "prepared",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Operation rejected by the transaction state machine.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TxnOp {
    /// `begin`
    Begin,
    /// `commit`
    Commit,
    /// `abort`
    Abort,
    /// A read or write issued through the transaction.
    Access,
}

impl fmt::Display for TxnOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnOp::Begin => "begin",
            TxnOp::Commit => "commit",
            TxnOp::Abort => "abort",
            TxnOp::Access => "access",
        };
        f.write_str(name)
    }
}

/// Details of an illegal transaction transition.
#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
#[error("cannot {op} a transaction that is {state}")]
pub struct TxnStateError {
    /// The rejected operation.
    pub op: TxnOp,
    /// The state observed when it was requested.
    pub state: TxnState,
}

/// Errors raised by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying file or block I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk state is inconsistent.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// On-disk state is inconsistent (with context).
    #[error("corruption: {0}")]
    CorruptionOwned(String),
    /// Caller misuse or bad configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Caller misuse or bad configuration (with context).
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// A value that must exist was not found.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Illegal transaction transition.
    #[error("transaction state: {0}")]
    TxnState(#[from] TxnStateError),
    /// Another process holds the location lock.
    #[error("location {0} is locked by another process")]
    LockContention(PathBuf),
    /// A structural consistency check failed.
    #[error("consistency check failed: {0}")]
    CheckFailed(String),
    /// The connection was released or expelled.
    #[error("storage connection is closed")]
    Closed,
    /// A commit failed after its journal record became durable.
    #[error("storage requires recovery; reopen the location")]
    NeedsRecovery,
}

impl StoreError {
    /// Shorthand for building a transaction-state error.
    pub fn txn_state(op: TxnOp, state: TxnState) -> Self {
        StoreError::TxnState(TxnStateError { op, state })
    }

    /// True for transaction-state errors.
    pub fn is_txn_state(&self) -> bool {
        matches!(self, StoreError::TxnState(_))
    }

    /// True for `NotFound` errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;
