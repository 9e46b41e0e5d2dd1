#![forbid(unsafe_code)]

//! Dataset administration utilities.
//!
//! Opens a dataset directory with the parameters it was created with and
//! reports on it: structural verification of every index and the term
//! dictionary, and a statistics snapshot.

mod error;
mod options;
mod stats;
mod util;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Configuration options for opening a dataset in admin mode.
pub use options::AdminOpenOptions;

/// Statistics collection and reporting.
///
/// Gathers per-index shape and I/O counters, object file bounds, the
/// dictionary size and journal state.
pub use stats::{
    stats, DictionarySection, FilesystemStats, IndexSection, JournalSection, ObjectSection,
    ParamsSection, StatsReport,
};

/// Dataset integrity verification.
pub use verify::{
    verify, verify_connection, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport,
    VerifySeverity,
};

/// Opens a dataset directory for administrative commands.
pub use util::open_location;
