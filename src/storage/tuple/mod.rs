#![forbid(unsafe_code)]
//! Tuple tables: sets of id tuples kept in permutation indexes.

mod index;
mod nodes;
mod table;

pub use index::{
    canonical_columns, tuple_params, TupleIndex, QUAD_COLUMNS, QUAD_INDEXES, TRIPLE_COLUMNS,
    TRIPLE_INDEXES,
};
pub use nodes::{NodeTupleTable, TermTupleIter};
pub use table::{TupleIter, TupleTable};
