#![forbid(unsafe_code)]
//! Node table: the dictionary between RDF terms and [`NodeId`]s.
//!
//! [`NodeId`]: crate::types::NodeId

pub mod inline;
mod table;
mod term;

pub use table::{
    forward_params, reverse_params, sip_term_hash, NodeTable, NodeTableOptions, NodeTableState,
    NodeTableStats, NodeTableStatsSnapshot, TermHasher, FORWARD_KEY_LEN, ID_LEN, TERM_HASH_LEN,
};
pub use term::{Term, XSD_BOOLEAN, XSD_DATE, XSD_INTEGER};

#[cfg(test)]
mod tests;
