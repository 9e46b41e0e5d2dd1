use std::fs;
use std::path::Path;

use crate::storage::{IndexParams, StoreOptions};
use crate::store::{read_params, Location, StoreConnection};

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// Opens the dataset in `dir` with the block size it was created with.
///
/// # Errors
///
/// Returns [`AdminError::MissingLocation`] if `dir` holds no dataset and
/// `create_if_missing` is false, or any error from opening the dataset.
pub fn open_location(dir: &Path, opts: &AdminOpenOptions) -> Result<StoreConnection> {
    let persisted = if dir.is_dir() { read_params(dir)? } else { None };
    let block_size = match persisted {
        Some(params) => params.block_size,
        None if opts.create_if_missing => opts.block_size,
        None => return Err(AdminError::missing_location(dir)),
    };
    let params = IndexParams::default()
        .block_size(block_size)
        .read_cache_blocks(opts.read_cache_blocks)
        .mode(opts.mode);
    let options = StoreOptions::default()
        .params(params)
        .use_lock_file(opts.use_lock_file);
    Ok(StoreConnection::open(Location::dir(dir), &options)?)
}

/// Size of `path` in bytes, or 0 when it does not exist.
pub(crate) fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}
