#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::storage::IndexParams;
use crate::types::{Result, StoreError};

/// Name of the persisted index parameters.
pub const PARAMS_FILE: &str = "params.toml";
/// Name of the lock file.
pub const LOCK_FILE: &str = "quarry.lock";
/// Name of the commit journal.
pub const JOURNAL_FILE: &str = "journal.jrnl";

/// Where a dataset lives: a directory, or memory under a name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    /// In-memory dataset; locations with the same name are the same dataset.
    Memory(String),
    /// Directory holding the dataset's files.
    Directory(PathBuf),
}

impl Location {
    /// The default in-memory location.
    pub fn mem() -> Self {
        Location::Memory(String::new())
    }

    /// A distinct in-memory location.
    pub fn mem_named(name: impl Into<String>) -> Self {
        Location::Memory(name.into())
    }

    /// A directory location.
    pub fn dir(path: impl AsRef<Path>) -> Self {
        Location::Directory(path.as_ref().to_path_buf())
    }

    /// True for in-memory locations.
    pub fn is_mem(&self) -> bool {
        matches!(self, Location::Memory(_))
    }

    /// Directory of a file-backed location.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Location::Memory(_) => None,
            Location::Directory(path) => Some(path),
        }
    }

    /// Path of `file` inside a directory location.
    pub fn file(&self, file: &str) -> Option<PathBuf> {
        self.path().map(|dir| dir.join(file))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Memory(name) if name.is_empty() => f.write_str("mem:"),
            Location::Memory(name) => write!(f, "mem:{name}"),
            Location::Directory(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Reads `params.toml` from `dir`, if present.
pub fn read_params(dir: &Path) -> Result<Option<IndexParams>> {
    let path = dir.join(PARAMS_FILE);
    match fs::read_to_string(&path) {
        Ok(text) => IndexParams::from_toml(&text).map(Some),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Settles the parameters of a directory location: the persisted block size
/// is authoritative, and a first open persists `requested`.
pub(crate) fn settle_params(dir: &Path, requested: IndexParams) -> Result<IndexParams> {
    match read_params(dir)? {
        Some(persisted) => {
            if persisted.block_size != requested.block_size {
                return Err(StoreError::InvalidOwned(format!(
                    "{} was created with {} byte blocks, not {}",
                    dir.display(),
                    persisted.block_size,
                    requested.block_size
                )));
            }
            Ok(requested)
        }
        None => {
            fs::write(dir.join(PARAMS_FILE), requested.to_toml()?)?;
            info!(location = %dir.display(), block_size = requested.block_size, "location.params.created");
            Ok(requested)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mem_locations_compare_by_name() {
        assert_eq!(Location::mem(), Location::mem());
        assert_ne!(Location::mem(), Location::mem_named("other"));
        assert!(Location::mem().path().is_none());
        assert_eq!(Location::mem_named("a").to_string(), "mem:a");
    }

    #[test]
    fn params_are_persisted_once() -> Result<()> {
        let dir = tempdir().unwrap();
        assert!(read_params(dir.path())?.is_none());
        let params = IndexParams::default().block_size(4096);
        settle_params(dir.path(), params)?;
        assert_eq!(read_params(dir.path())?, Some(params));

        let cached = params.read_cache_blocks(5);
        assert_eq!(settle_params(dir.path(), cached)?, cached);
        let err = settle_params(dir.path(), params.block_size(8192)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOwned(_)));
        Ok(())
    }
}
