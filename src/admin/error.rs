use std::path::{Path, PathBuf};

use crate::types::StoreError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// No dataset at the given directory.
    #[error("dataset not found: {0}")]
    MissingLocation(PathBuf),
    /// Custom error message.
    #[error("{0}")]
    Message(String),
    /// Storage error.
    #[error(transparent)]
    Core(#[from] StoreError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_location(path: impl AsRef<Path>) -> Self {
        AdminError::MissingLocation(path.as_ref().to_path_buf())
    }
}
