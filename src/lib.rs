//! Transactional storage core for an RDF triple and quad store.
//!
//! A dataset is a term dictionary (the node table) plus triple and quad
//! tables kept in several orders by copy-on-write B+Trees. Every component
//! takes part in the same transactions, committed through one journal.

#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod storage;
pub mod store;
pub mod txn;
pub mod types;

pub use storage::nodes::Term;
pub use storage::{IndexParams, StorageMode, StoreOptions};
pub use store::{ConnectionRegistry, DatasetStorage, Location, StoreConnection};
pub use txn::{Coordinator, Session, Transaction};
pub use types::{NodeId, Result, StoreError, TxnMode, TxnState};
