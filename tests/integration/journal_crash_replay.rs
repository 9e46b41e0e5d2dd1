#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use quarry::storage::{IndexParams, StoreOptions};
use quarry::store::{ConnectionRegistry, Location, StoreConnection, JOURNAL_FILE};
use quarry::types::Result;
use quarry::Term;
use tempfile::tempdir;

fn options() -> StoreOptions {
    StoreOptions::default()
        .params(IndexParams::default().block_size(1024))
        .journal_checkpoint_interval(1_000)
}

fn triple(i: usize) -> Vec<Term> {
    vec![
        Term::iri(format!("http://example.org/s{i}")),
        Term::iri("http://example.org/p"),
        Term::literal(format!("value {i}")),
    ]
}

fn add_batch(conn: &StoreConnection, range: std::ops::Range<usize>) -> Result<()> {
    conn.coordinator().execute_write(|txn| {
        for i in range {
            conn.storage().triples().add(txn, &triple(i))?;
        }
        Ok(())
    })
}

/// Copies of the files a commit publishes: index roots, object bounds and
/// the journal. Block and object data are left alone.
fn snapshot_roots(dir: &Path) -> HashMap<PathBuf, Vec<u8>> {
    fs::read_dir(dir)
        .expect("read dir")
        .map(|entry| entry.expect("dir entry").path())
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            name.ends_with(".bpt") || name.ends_with(".state") || name == JOURNAL_FILE
        })
        .map(|path| {
            let bytes = fs::read(&path).expect("read root file");
            (path, bytes)
        })
        .collect()
}

fn restore(files: &HashMap<PathBuf, Vec<u8>>) {
    for (path, bytes) in files {
        fs::write(path, bytes).expect("restore root file");
    }
}

fn triple_count(conn: &StoreConnection) -> Result<u64> {
    conn.coordinator()
        .execute_read(|txn| conn.storage().triples().tuple_table().size(txn))
}

#[test]
fn journal_finishes_commit_whose_roots_were_not_written() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let location = Location::dir(dir.path());
    let registry = ConnectionRegistry::with_options(options());

    let conn = registry.connect(&location)?;
    add_batch(&conn, 0..20)?;
    let before = snapshot_roots(dir.path());
    add_batch(&conn, 20..60)?;
    drop(conn);
    // crash: nothing is checkpointed and the roots of the second commit are lost
    registry.expel(&location, true)?;
    let journal = fs::read(dir.path().join(JOURNAL_FILE)).expect("journal");
    restore(&before);
    fs::write(dir.path().join(JOURNAL_FILE), journal).expect("journal");

    let conn = registry.connect(&location)?;
    assert_eq!(triple_count(&conn)?, 60);
    conn.coordinator().execute_read(|txn| {
        for i in [0, 19, 20, 59] {
            assert!(conn.storage().triples().contains(txn, &triple(i))?);
        }
        assert_eq!(conn.storage().nodes().dictionary_size(txn)?, 121);
        Ok(())
    })?;
    assert_eq!(conn.coordinator().journal_len()?, 32);
    Ok(())
}

#[test]
fn commit_without_journal_record_is_discarded() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let location = Location::dir(dir.path());
    let registry = ConnectionRegistry::with_options(options());

    let conn = registry.connect(&location)?;
    add_batch(&conn, 0..10)?;
    let before = snapshot_roots(dir.path());
    let committed_length = conn.storage().objects().committed_bounds().length;
    add_batch(&conn, 10..30)?;
    drop(conn);
    registry.expel(&location, true)?;
    // crash before the journal append: data was written, nothing published
    restore(&before);

    let conn = registry.connect(&location)?;
    assert_eq!(triple_count(&conn)?, 10);
    assert_eq!(
        conn.storage().objects().committed_bounds().length,
        committed_length
    );
    assert_eq!(
        conn.storage().objects().file().physical_length()?,
        committed_length
    );
    // ids freed by the discarded commit are handed out again
    add_batch(&conn, 30..31)?;
    conn.coordinator().execute_read(|txn| {
        assert!(conn.storage().triples().contains(txn, &triple(30))?);
        assert!(!conn.storage().triples().contains(txn, &triple(10))?);
        assert_eq!(conn.storage().nodes().dictionary_size(txn)?, 23);
        Ok(())
    })
}

#[test]
fn torn_journal_tail_is_ignored() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let location = Location::dir(dir.path());
    let registry = ConnectionRegistry::with_options(options());

    let conn = registry.connect(&location)?;
    add_batch(&conn, 0..5)?;
    add_batch(&conn, 5..8)?;
    drop(conn);
    registry.expel(&location, true)?;

    let mut journal = OpenOptions::new()
        .append(true)
        .open(dir.path().join(JOURNAL_FILE))
        .expect("journal");
    journal
        .write_all(&[0xA5; 57])
        .expect("append torn tail");
    drop(journal);

    let conn = registry.connect(&location)?;
    assert_eq!(triple_count(&conn)?, 8);
    assert!(!conn.coordinator().needs_recovery());
    add_batch(&conn, 8..9)?;
    assert_eq!(triple_count(&conn)?, 9);
    Ok(())
}

#[test]
fn replaying_twice_is_harmless() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let location = Location::dir(dir.path());
    let registry = ConnectionRegistry::with_options(options());

    let conn = registry.connect(&location)?;
    add_batch(&conn, 0..12)?;
    drop(conn);
    registry.expel(&location, true)?;
    let journal = fs::read(dir.path().join(JOURNAL_FILE)).expect("journal");

    // first recovery checkpoints the journal; put the records back and recover again
    registry.connect(&location)?;
    registry.expel(&location, true)?;
    fs::write(dir.path().join(JOURNAL_FILE), journal).expect("journal");

    let conn = registry.connect(&location)?;
    assert_eq!(triple_count(&conn)?, 12);
    conn.coordinator().execute_read(|txn| {
        assert_eq!(conn.storage().nodes().dictionary_size(txn)?, 25);
        Ok(())
    })
}
