#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quarry::storage::{IndexParams, StoreOptions};
use quarry::store::{ConnectionRegistry, Location, StoreConnection};
use quarry::types::{Result, StoreError, TxnMode, TxnState};
use quarry::Term;

fn connect(name: &str) -> Result<Arc<StoreConnection>> {
    let registry = ConnectionRegistry::with_options(
        StoreOptions::default().params(IndexParams::default().block_size(1024)),
    );
    registry.connect(&Location::mem_named(name))
}

fn triple(i: usize) -> Vec<Term> {
    vec![
        Term::iri(format!("http://example.org/s{i}")),
        Term::iri("http://example.org/p"),
        Term::integer(i as i64),
    ]
}

#[test]
fn finished_transactions_reject_further_steps() -> Result<()> {
    let conn = connect("finished")?;
    let mut txn = conn.begin(TxnMode::Write)?;
    conn.storage().triples().add(&mut txn, &triple(1))?;
    txn.commit()?;
    assert_eq!(txn.state(), TxnState::Committed);
    assert!(txn.commit().unwrap_err().is_txn_state());
    assert!(txn.abort().unwrap_err().is_txn_state());
    assert!(conn
        .storage()
        .triples()
        .add(&mut txn, &triple(2))
        .unwrap_err()
        .is_txn_state());
    txn.end()?;

    let mut txn = conn.begin(TxnMode::Write)?;
    txn.abort()?;
    assert_eq!(txn.state(), TxnState::Aborted);
    assert!(txn.commit().unwrap_err().is_txn_state());
    txn.end()?;
    Ok(())
}

#[test]
fn reads_cannot_write() -> Result<()> {
    let conn = connect("reads")?;
    let mut txn = conn.begin(TxnMode::Read)?;
    let err = conn.storage().triples().add(&mut txn, &triple(1)).unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
    txn.commit()?;
    txn.end()
}

#[test]
fn readers_keep_their_snapshot() -> Result<()> {
    let conn = connect("snapshot")?;
    conn.coordinator().execute_write(|txn| {
        conn.storage().triples().add(txn, &triple(0))?;
        Ok(())
    })?;
    let reader = conn.begin(TxnMode::Read)?;
    conn.coordinator().execute_write(|txn| {
        for i in 1..100 {
            conn.storage().triples().add(txn, &triple(i))?;
        }
        conn.storage().triples().delete(txn, &triple(0))?;
        Ok(())
    })?;

    let triples = conn.storage().triples();
    assert_eq!(triples.tuple_table().size(&reader)?, 1);
    assert!(triples.contains(&reader, &triple(0))?);
    assert!(!triples.contains(&reader, &triple(50))?);
    let subject = Term::iri("http://example.org/s50");
    assert_eq!(conn.storage().nodes().lookup(&reader, &subject)?, None);
    reader.end()?;

    conn.coordinator().execute_read(|txn| {
        assert_eq!(triples.tuple_table().size(txn)?, 99);
        assert!(!triples.contains(txn, &triple(0))?);
        assert!(conn.storage().nodes().lookup(txn, &subject)?.is_some());
        Ok(())
    })
}

#[test]
fn one_writer_at_a_time() -> Result<()> {
    let conn = connect("writers")?;
    let first = conn.begin(TxnMode::Write)?;
    let second_started = Arc::new(AtomicBool::new(false));

    let handle = {
        let conn = Arc::clone(&conn);
        let second_started = Arc::clone(&second_started);
        thread::spawn(move || -> Result<()> {
            let mut txn = conn.begin(TxnMode::Write)?;
            second_started.store(true, Ordering::SeqCst);
            conn.storage().triples().add(&mut txn, &triple(2))?;
            txn.commit()
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!second_started.load(Ordering::SeqCst));
    // readers are never blocked by the writer
    conn.begin(TxnMode::Read)?.end()?;
    drop(first);
    handle.join().expect("writer thread")?;
    assert!(second_started.load(Ordering::SeqCst));

    conn.coordinator().execute_read(|txn| {
        assert!(conn.storage().triples().contains(txn, &triple(2))?);
        Ok(())
    })
}

#[test]
fn dropped_write_transaction_aborts() -> Result<()> {
    let conn = connect("dropped")?;
    {
        let mut txn = conn.begin(TxnMode::Write)?;
        let blank = [
            Term::blank("a"),
            Term::iri("http://example.org/p"),
            Term::literal("x"),
        ];
        conn.storage().triples().add(&mut txn, &blank)?;
    }
    assert_eq!(conn.coordinator().active_transactions(), 0);
    let stats = conn.coordinator().stats();
    assert_eq!((stats.write_txns, stats.aborts, stats.commits), (1, 1, 0));
    conn.coordinator().execute_read(|txn| {
        assert_eq!(conn.storage().nodes().dictionary_size(txn)?, 0);
        Ok(())
    })
}

#[test]
fn failed_closure_rolls_back() -> Result<()> {
    let conn = connect("closure")?;
    let err = conn
        .coordinator()
        .execute_write(|txn| {
            conn.storage().triples().add(txn, &triple(1))?;
            Err::<(), _>(StoreError::Invalid("caller gave up"))
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::Invalid("caller gave up")));
    conn.coordinator().execute_read(|txn| {
        assert_eq!(conn.storage().triples().tuple_table().size(txn)?, 0);
        Ok(())
    })
}
