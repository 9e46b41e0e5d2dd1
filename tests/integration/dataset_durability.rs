#![allow(missing_docs)]

use quarry::storage::{IndexParams, StoreOptions};
use quarry::store::{ConnectionRegistry, Location};
use quarry::types::{Result, TxnMode};
use quarry::Term;
use tempfile::tempdir;

fn options() -> StoreOptions {
    StoreOptions::default().params(IndexParams::default().block_size(1024))
}

fn person(i: usize) -> Term {
    Term::iri(format!("http://example.org/person/{i}"))
}

fn knows() -> Term {
    Term::iri("http://xmlns.com/foaf/0.1/knows")
}

#[test]
fn committed_triples_survive_reopen() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let location = Location::dir(dir.path().join("people"));
    let registry = ConnectionRegistry::with_options(options());

    let conn = registry.connect(&location)?;
    conn.coordinator().execute_write(|txn| {
        for i in 0..200 {
            conn.storage()
                .triples()
                .add(txn, &[person(i), knows(), person((i + 1) % 200)])?;
        }
        Ok(())
    })?;
    drop(conn);
    assert!(registry.release(&location)?);

    let conn = registry.connect(&location)?;
    conn.coordinator().execute_read(|txn| {
        let triples = conn.storage().triples();
        assert_eq!(triples.tuple_table().size(txn)?, 200);
        assert!(triples.contains(txn, &[person(7), knows(), person(8)])?);
        assert!(!triples.contains(txn, &[person(8), knows(), person(7)])?);

        let from_seven: Vec<_> = triples
            .find(txn, &[Some(person(7)), None, None])?
            .collect::<Result<_>>()?;
        assert_eq!(from_seven, vec![vec![person(7), knows(), person(8)]]);

        let into_zero: Vec<_> = triples
            .find(txn, &[None, Some(knows()), Some(person(0))])?
            .collect::<Result<_>>()?;
        assert_eq!(into_zero, vec![vec![person(199), knows(), person(0)]]);
        // 200 people and one predicate
        assert_eq!(conn.storage().nodes().dictionary_size(txn)?, 201);
        Ok(())
    })
}

#[test]
fn aborted_writes_are_gone_after_reopen() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let location = Location::dir(dir.path());
    let registry = ConnectionRegistry::with_options(options());

    let conn = registry.connect(&location)?;
    conn.coordinator().execute_write(|txn| {
        conn.storage()
            .triples()
            .add(txn, &[person(1), knows(), person(2)])?;
        Ok(())
    })?;
    let mut txn = conn.begin(TxnMode::Write)?;
    conn.storage()
        .triples()
        .add(&mut txn, &[person(3), knows(), Term::literal("never")])?;
    txn.abort()?;
    txn.end()?;
    let committed_length = conn.storage().objects().committed_bounds().length;
    drop(conn);
    registry.release(&location)?;

    let conn = registry.connect(&location)?;
    assert_eq!(
        conn.storage().objects().committed_bounds().length,
        committed_length
    );
    conn.coordinator().execute_read(|txn| {
        let triples = conn.storage().triples();
        assert_eq!(triples.tuple_table().size(txn)?, 1);
        assert_eq!(
            conn.storage().nodes().lookup(txn, &Term::literal("never"))?,
            None
        );
        Ok(())
    })
}

#[test]
fn inline_values_never_reach_the_dictionary() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let location = Location::dir(dir.path());
    let registry = ConnectionRegistry::with_options(options());
    let conn = registry.connect(&location)?;
    let age = Term::iri("http://example.org/age");
    conn.coordinator().execute_write(|txn| {
        for i in 0..50 {
            conn.storage()
                .triples()
                .add(txn, &[person(i), age.clone(), Term::integer(20 + i as i64)])?;
        }
        conn.storage().triples().add(
            txn,
            &[person(0), Term::iri("http://example.org/active"), Term::boolean(true)],
        )?;
        Ok(())
    })?;
    drop(conn);
    registry.release(&location)?;

    let conn = registry.connect(&location)?;
    conn.coordinator().execute_read(|txn| {
        // 50 people and two predicates; integers and booleans are inline
        assert_eq!(conn.storage().nodes().dictionary_size(txn)?, 52);
        let aged: Vec<_> = conn
            .storage()
            .triples()
            .find(txn, &[None, Some(age.clone()), Some(Term::integer(42))])?
            .collect::<Result<_>>()?;
        assert_eq!(aged, vec![vec![person(22), age.clone(), Term::integer(42)]]);
        Ok(())
    })
}

#[test]
fn quads_and_triples_share_the_dictionary() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let location = Location::dir(dir.path());
    let registry = ConnectionRegistry::with_options(options());
    let conn = registry.connect(&location)?;
    let graph = Term::iri("http://example.org/graph/1");
    conn.coordinator().execute_write(|txn| {
        let storage = conn.storage();
        storage.triples().add(txn, &[person(1), knows(), person(2)])?;
        storage
            .quads()
            .add(txn, &[graph.clone(), person(1), knows(), person(2)])?;
        storage
            .quads()
            .add(txn, &[graph.clone(), person(2), knows(), person(3)])?;
        Ok(())
    })?;
    drop(conn);
    registry.release(&location)?;

    let conn = registry.connect(&location)?;
    conn.coordinator().execute_read(|txn| {
        let storage = conn.storage();
        assert_eq!(storage.nodes().dictionary_size(txn)?, 5);
        let in_graph: Vec<_> = storage
            .quads()
            .find(txn, &[Some(graph.clone()), None, None, None])?
            .collect::<Result<_>>()?;
        assert_eq!(in_graph.len(), 2);
        assert_eq!(storage.triples().tuple_table().size(txn)?, 1);
        Ok(())
    })
}
