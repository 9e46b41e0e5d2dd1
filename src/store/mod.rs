#![forbid(unsafe_code)]
//! Dataset assembly and the connection registry.
//!
//! A [`Location`] holds one dataset: a node table plus triple and quad
//! tables, all committed together through one journal. A
//! [`ConnectionRegistry`] keeps at most one [`StoreConnection`] per location
//! within the process; the location lock keeps other processes out.

mod dataset;
mod location;
mod registry;

pub use dataset::{DatasetStorage, DATASET_COMPONENT_BASE};
pub use location::{read_params, Location, JOURNAL_FILE, LOCK_FILE, PARAMS_FILE};
pub use registry::{ConnectionRegistry, StoreConnection};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::nodes::Term;
    use crate::storage::{IndexParams, StoreOptions};
    use crate::types::{Result, StoreError, TxnMode};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn small() -> StoreOptions {
        StoreOptions::default().params(IndexParams::default().block_size(1024))
    }

    fn triple(s: &str, p: &str, o: &str) -> Vec<Term> {
        vec![
            Term::iri(format!("http://example.org/{s}")),
            Term::iri(format!("http://example.org/{p}")),
            Term::literal(o),
        ]
    }

    #[test]
    fn connect_returns_the_same_connection() -> Result<()> {
        let registry = ConnectionRegistry::with_options(small());
        let a = registry.connect(&Location::mem())?;
        let b = registry.connect(&Location::mem())?;
        assert!(Arc::ptr_eq(&a, &b));
        let other = registry.connect(&Location::mem_named("other"))?;
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&Location::mem_named("missing")).is_none());
        Ok(())
    }

    #[test]
    fn release_refuses_while_transactions_run() -> Result<()> {
        let registry = ConnectionRegistry::with_options(small());
        let location = Location::mem();
        let conn = registry.connect(&location)?;
        let txn = conn.begin(TxnMode::Read)?;
        assert!(matches!(registry.release(&location), Err(StoreError::Invalid(_))));
        assert_eq!(registry.len(), 1);
        txn.end()?;
        assert!(registry.release(&location)?);
        assert!(registry.is_empty());
        assert!(matches!(conn.begin(TxnMode::Read), Err(StoreError::Closed)));
        assert!(!registry.release(&location)?);
        Ok(())
    }

    #[test]
    fn expel_forces_and_reset_clears() -> Result<()> {
        let registry = ConnectionRegistry::with_options(small());
        let conn = registry.connect(&Location::mem())?;
        let txn = conn.begin(TxnMode::Read)?;
        assert!(registry.expel(&Location::mem(), true)?);
        assert!(conn.is_closed());
        drop(txn);

        registry.connect(&Location::mem_named("a"))?;
        registry.connect(&Location::mem_named("b"))?;
        registry.reset()?;
        assert!(registry.is_empty());
        // a fresh in-memory dataset after reset
        let conn = registry.connect(&Location::mem_named("a"))?;
        conn.coordinator().execute_read(|txn| {
            assert_eq!(conn.storage().nodes().dictionary_size(txn)?, 0);
            Ok(())
        })
    }

    #[test]
    fn directory_reopen_keeps_commits() -> Result<()> {
        let dir = tempdir().unwrap();
        let location = Location::dir(dir.path().join("db"));
        let registry = ConnectionRegistry::with_options(small());
        {
            let conn = registry.connect(&location)?;
            conn.coordinator().execute_write(|txn| {
                conn.storage().triples().add(txn, &triple("s", "p", "o"))?;
                Ok(())
            })?;
            registry.release(&location)?;
        }
        assert!(location.file(PARAMS_FILE).unwrap().exists());
        let conn = registry.connect(&location)?;
        conn.coordinator().execute_read(|txn| {
            assert!(conn.storage().triples().contains(txn, &triple("s", "p", "o"))?);
            Ok(())
        })
    }

    #[test]
    fn block_size_is_fixed_at_creation() -> Result<()> {
        let dir = tempdir().unwrap();
        let location = Location::dir(dir.path());
        let registry = ConnectionRegistry::new();
        registry.connect_with(&location, &small())?;
        registry.release(&location)?;
        let err = registry
            .connect_with(&location, &StoreOptions::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidOwned(_)));
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn session_on_a_connection() -> Result<()> {
        let registry = ConnectionRegistry::with_options(small());
        let conn = registry.connect(&Location::mem())?;
        let mut session = conn.session()?;
        let txn = session.begin(TxnMode::Write)?;
        conn.storage().quads().add(
            txn,
            &[
                Term::iri("http://example.org/g"),
                Term::iri("http://example.org/s"),
                Term::iri("http://example.org/p"),
                Term::integer(7),
            ],
        )?;
        assert!(session.begin(TxnMode::Read).unwrap_err().is_txn_state());
        session.commit()?;
        session.end()?;
        conn.coordinator().execute_read(|txn| {
            assert_eq!(conn.storage().quads().tuple_table().size(txn)?, 1);
            assert_eq!(conn.storage().triples().tuple_table().size(txn)?, 0);
            Ok(())
        })
    }
}
