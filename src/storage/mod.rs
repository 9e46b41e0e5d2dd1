//! Storage components of a dataset.
//!
//! Every component here implements
//! [`TransactionalComponent`](crate::txn::TransactionalComponent) and takes
//! part in commits driven by a [`Coordinator`](crate::txn::Coordinator).

/// Ordered index of fixed-length records.
///
/// Point lookup, insert, delete and ordered range scans over a block store.
pub mod btree;

/// Term dictionary mapping RDF terms to node ids.
pub mod nodes;

/// Append-only object file and its transactional wrapper.
pub mod object;

/// Tuple tables kept in permutation indexes.
pub mod tuple;

pub(crate) mod meta;
mod options;

/// Index and store configuration.
pub use options::{IndexParams, StorageMode, StoreOptions, DEFAULT_BLOCK_SIZE};
