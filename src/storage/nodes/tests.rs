use super::*;
use crate::primitives::block::MemBlockStore;
use crate::primitives::io::MemFileIo;
use crate::primitives::journal::Journal;
use crate::storage::btree::{BPlusTree, Record, TreeOptions};
use crate::storage::object::TransObjectFile;
use crate::txn::{Coordinator, CoordinatorBuilder, CoordinatorOptions};
use crate::types::{ComponentId, NodeId, Result, StoreError, TxnMode};
use std::collections::HashSet;
use std::sync::Arc;

const BASE: ComponentId = ComponentId::from_bytes([0x5A; 16]);
const BLOCK_SIZE: usize = 512;

struct Harness {
    nodes: Arc<NodeTable>,
    coord: Coordinator,
}

fn harness(options: NodeTableOptions) -> Result<Harness> {
    let objects = Arc::new(TransObjectFile::open(
        ComponentId::derive(BASE, 1),
        "nodes.obj",
        Arc::new(MemFileIo::new()),
        Arc::new(MemFileIo::new()),
    )?);
    let forward = Arc::new(BPlusTree::open(
        TreeOptions::new(ComponentId::derive(BASE, 2), "node2id", forward_params(BLOCK_SIZE)?),
        Arc::new(MemBlockStore::new(BLOCK_SIZE)?),
        Arc::new(MemFileIo::new()),
    )?);
    let reverse = Arc::new(BPlusTree::open(
        TreeOptions::new(ComponentId::derive(BASE, 3), "id2node", reverse_params(BLOCK_SIZE)?),
        Arc::new(MemBlockStore::new(BLOCK_SIZE)?),
        Arc::new(MemFileIo::new()),
    )?);
    let nodes = Arc::new(NodeTable::new(
        ComponentId::derive(BASE, 4),
        Arc::clone(&objects),
        Arc::clone(&forward),
        Arc::clone(&reverse),
        options,
    )?);
    let coord = CoordinatorBuilder::new(Journal::open(Arc::new(MemFileIo::new()))?)
        .options(CoordinatorOptions::default())
        .component(objects)
        .component(forward)
        .component(reverse)
        .component(Arc::clone(&nodes))
        .open()?;
    Ok(Harness { nodes, coord })
}

fn iri(n: usize) -> Term {
    Term::iri(format!("http://example.org/resource/{n}"))
}

#[test]
fn terms_roundtrip_by_id() -> Result<()> {
    let h = harness(NodeTableOptions::default())?;
    let terms: Vec<Term> = (0..300)
        .map(|n| match n % 3 {
            0 => iri(n),
            1 => Term::blank(format!("b{n}")),
            _ => Term::lang(format!("label {n}"), "en"),
        })
        .collect();
    let ids = h.coord.execute_write(|txn| {
        terms
            .iter()
            .map(|term| h.nodes.id_for(txn, term))
            .collect::<Result<Vec<_>>>()
    })?;
    let distinct: HashSet<NodeId> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), terms.len());
    assert_eq!(ids[0], NodeId::allocated(0));
    assert_eq!(ids[299], NodeId::allocated(299));

    h.coord.execute_read(|txn| {
        assert_eq!(h.nodes.dictionary_size(txn)?, 300);
        for (term, id) in terms.iter().zip(&ids) {
            assert_eq!(&h.nodes.term_for(txn, *id)?, term);
            assert_eq!(h.nodes.lookup(txn, term)?, Some(*id));
        }
        Ok(())
    })
}

#[test]
fn allocation_is_idempotent() -> Result<()> {
    let h = harness(NodeTableOptions::default())?;
    let term = iri(1);
    let first = h.coord.execute_write(|txn| h.nodes.allocate(txn, &term))?;
    let (again, size) = h.coord.execute_write(|txn| {
        let id = h.nodes.allocate(txn, &term)?;
        Ok((id, h.nodes.dictionary_size(txn)?))
    })?;
    assert_eq!(first, again);
    assert_eq!(size, 1);
    Ok(())
}

#[test]
fn inline_terms_skip_the_dictionary() -> Result<()> {
    let h = harness(NodeTableOptions::default())?;
    h.coord.execute_write(|txn| {
        let before = h.nodes.dictionary_size(txn)?;
        let id = h.nodes.id_for(txn, &Term::integer(42))?;
        assert!(id.is_inline());
        assert_eq!(h.nodes.dictionary_size(txn)?, before);

        let long = Term::iri(format!("http://example.org/{}", "x".repeat(200)));
        let id = h.nodes.id_for(txn, &long)?;
        assert!(id.is_allocated());
        assert_eq!(h.nodes.dictionary_size(txn)?, before + 1);
        assert_eq!(h.nodes.term_for(txn, id)?, long);
        Ok(())
    })?;
    h.coord.execute_read(|txn| {
        let id = NodeId::from_parts(NodeId::TAG_INTEGER, 42);
        assert_eq!(h.nodes.term_for(txn, id)?, Term::integer(42));
        Ok(())
    })
}

#[test]
fn colliding_hashes_are_chained() -> Result<()> {
    let options = NodeTableOptions::default()
        .hasher(Arc::new(|bytes: &[u8]| [bytes.len() as u8 % 2; TERM_HASH_LEN]));
    let h = harness(options)?;
    let terms: Vec<Term> = (0..40).map(iri).collect();
    let ids = h.coord.execute_write(|txn| {
        terms
            .iter()
            .map(|term| h.nodes.id_for(txn, term))
            .collect::<Result<Vec<_>>>()
    })?;
    assert!(h.nodes.stats().collisions > 0);
    h.coord.execute_read(|txn| {
        for (term, id) in terms.iter().zip(&ids) {
            assert_eq!(h.nodes.lookup(txn, term)?, Some(*id));
            assert_eq!(&h.nodes.term_for(txn, *id)?, term);
        }
        assert_eq!(h.nodes.lookup(txn, &iri(1000))?, None);
        assert_eq!(h.nodes.forward().size(txn)?, 40);
        Ok(())
    })
}

#[test]
fn abort_forgets_allocations() -> Result<()> {
    let h = harness(NodeTableOptions::default())?;
    let kept = h.coord.execute_write(|txn| h.nodes.id_for(txn, &iri(1)))?;

    let mut txn = h.coord.begin(TxnMode::Write)?;
    let lost = h.nodes.id_for(&mut txn, &iri(2))?;
    assert_eq!(h.nodes.lookup(&txn, &iri(2))?, Some(lost));
    txn.abort()?;

    h.coord.execute_read(|txn| {
        assert_eq!(h.nodes.lookup(txn, &iri(2))?, None);
        assert!(h.nodes.term_for(txn, lost).unwrap_err().is_not_found());
        assert_eq!(h.nodes.term_for(txn, kept)?, iri(1));
        Ok(())
    })?;
    // the id is handed out again
    let next = h.coord.execute_write(|txn| h.nodes.id_for(txn, &iri(3)))?;
    assert_eq!(next, lost);
    Ok(())
}

#[test]
fn cached_ids_respect_reader_snapshots() -> Result<()> {
    let h = harness(NodeTableOptions::default())?;
    let old_reader = h.coord.begin(TxnMode::Read)?;
    let id = h.coord.execute_write(|txn| h.nodes.id_for(txn, &iri(9)))?;
    // a fresh reader resolves the term and warms the cache
    h.coord.execute_read(|txn| {
        assert_eq!(h.nodes.lookup(txn, &iri(9))?, Some(id));
        Ok(())
    })?;
    assert_eq!(h.nodes.lookup(&old_reader, &iri(9))?, None);
    assert!(h.nodes.term_for(&old_reader, id).unwrap_err().is_not_found());
    old_reader.end()
}

#[test]
fn unknown_and_special_ids_are_not_found() -> Result<()> {
    let h = harness(NodeTableOptions::default().cache_size(0))?;
    h.coord.execute_read(|txn| {
        for id in [NodeId::allocated(0), NodeId::NONE, NodeId::ANY] {
            assert!(matches!(h.nodes.term_for(txn, id), Err(StoreError::NotFound(_))));
        }
        Ok(())
    })
}

#[test]
fn readers_cannot_allocate() -> Result<()> {
    let h = harness(NodeTableOptions::default())?;
    let mut txn = h.coord.begin(TxnMode::Read)?;
    assert!(h.nodes.id_for(&mut txn, &iri(1)).is_err());
    // inline terms need no allocation
    assert!(h.nodes.id_for(&mut txn, &Term::boolean(true))?.is_inline());
    txn.end()
}

#[test]
fn short_reverse_entries_are_corruption() {
    let intact = Record::new(&7u64.to_be_bytes(), &42u64.to_be_bytes());
    let entry = NodeTable::reverse_entry(&intact);
    assert_eq!(entry.ok(), Some((NodeId(7), 42)));

    let truncated = Record::new(&7u64.to_be_bytes(), &[0, 1, 2]);
    assert!(matches!(
        NodeTable::reverse_entry(&truncated),
        Err(StoreError::CorruptionOwned(_))
    ));
}
