#![allow(missing_docs)]

use std::sync::Arc;

use quarry::storage::{IndexParams, StorageMode, StoreOptions};
use quarry::store::{ConnectionRegistry, Location, StoreConnection, LOCK_FILE};
use quarry::types::{Result, StoreError, TxnMode};
use quarry::Term;
use tempfile::tempdir;

fn options() -> StoreOptions {
    StoreOptions::default().params(IndexParams::default().block_size(1024))
}

fn fact() -> Vec<Term> {
    vec![
        Term::iri("http://example.org/quarry"),
        Term::iri("http://example.org/opened"),
        Term::boolean(true),
    ]
}

#[test]
fn a_location_opens_once_per_process() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let location = Location::dir(dir.path());
    let first = ConnectionRegistry::with_options(options());
    let second = ConnectionRegistry::with_options(options());

    let conn = first.connect(&location)?;
    let err = second.connect(&location).unwrap_err();
    assert!(matches!(err, StoreError::LockContention(_)));
    // the refused open left the first connection usable
    conn.coordinator().execute_write(|txn| {
        conn.storage().triples().add(txn, &fact())?;
        Ok(())
    })?;
    first.release(&location)?;

    let conn = second.connect(&location)?;
    conn.coordinator().execute_read(|txn| {
        assert!(conn.storage().triples().contains(txn, &fact())?);
        Ok(())
    })
}

#[test]
fn lock_file_is_optional() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let location = Location::dir(dir.path());
    let registry = ConnectionRegistry::with_options(options().use_lock_file(false));
    registry.connect(&location)?;
    assert!(!dir.path().join(LOCK_FILE).exists());
    registry.reset()
}

#[test]
fn closed_connection_is_reopened_on_connect() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let location = Location::dir(dir.path());
    let registry = ConnectionRegistry::with_options(options());
    let conn = registry.connect(&location)?;
    conn.close()?;
    assert!(matches!(conn.begin(TxnMode::Read), Err(StoreError::Closed)));

    let reopened = registry.connect(&location)?;
    assert!(!Arc::ptr_eq(&conn, &reopened));
    assert!(!reopened.is_closed());
    assert_eq!(registry.len(), 1);
    Ok(())
}

#[test]
fn directory_rejects_memory_mode() {
    let dir = tempdir().expect("tmpdir");
    let options = StoreOptions::default()
        .params(IndexParams::default().mode(StorageMode::Memory))
        .use_lock_file(false);
    let err = StoreConnection::open(Location::dir(dir.path()), &options).unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
}

#[test]
fn mapped_mode_reads_a_checkpointed_dataset() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let location = Location::dir(dir.path());
    let registry = ConnectionRegistry::with_options(options());
    let conn = registry.connect(&location)?;
    conn.coordinator().execute_write(|txn| {
        conn.storage().triples().add(txn, &fact())?;
        Ok(())
    })?;
    drop(conn);
    registry.release(&location)?;

    let mapped = options().params(
        IndexParams::default()
            .block_size(1024)
            .mode(StorageMode::Mapped),
    );
    let conn = registry.connect_with(&location, &mapped)?;
    conn.coordinator().execute_read(|txn| {
        assert!(conn.storage().triples().contains(txn, &fact())?);
        Ok(())
    })?;
    let err = conn.begin(TxnMode::Write).unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
    Ok(())
}
