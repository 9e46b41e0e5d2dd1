#![forbid(unsafe_code)]

//! Ordered index of fixed-length records.
//!
//! [`BPlusTree`] is the transactional, copy-on-write form registered with a
//! coordinator; [`TreeBuilder`] is the in-place form used for bulk loads.

mod builder;
mod ops;
mod page;
mod params;
mod stats;
mod tree;

pub use builder::TreeBuilder;
pub use ops::{CheckReport, RangeIter};
pub use params::{Record, TreeParams};
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use tree::{BPlusTree, TreeOptions, TreeRoot, TreeTxnState};
