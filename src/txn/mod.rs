//! Transaction coordination.
//!
//! A [`Coordinator`] drives every registered [`TransactionalComponent`]
//! through begin, prepare, commit and abort, and writes one journal record
//! per committed write transaction so a crash between prepare and publish
//! can be finished on the next open.

mod component;
mod coordinator;
mod session;

pub use component::TransactionalComponent;
pub use coordinator::{
    Coordinator, CoordinatorBuilder, CoordinatorOptions, CoordinatorStats,
    CoordinatorStatsSnapshot, Transaction,
};
pub use session::Session;
