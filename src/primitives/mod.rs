//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, positioned I/O, block allocation, location
//! locking and the commit journal.

/// Fixed-size block stores.
///
/// In-memory, file-backed (with a read cache) and memory-mapped read-only
/// backings behind one trait.
pub mod block;

/// Byte-level utilities and encoding/decoding.
pub mod bytes;

/// Location locks and the single-writer slot.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Write-ahead commit journal for crash recovery.
pub mod journal;
