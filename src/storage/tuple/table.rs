#![forbid(unsafe_code)]

use tracing::trace;

use super::index::TupleIndex;
use crate::primitives::bytes::ord;
use crate::storage::btree::{RangeIter, Record};
use crate::txn::Transaction;
use crate::types::{NodeId, Result, StoreError};

/// A set of tuples of [`NodeId`]s kept in several permutation indexes.
#[derive(Debug)]
pub struct TupleTable {
    arity: usize,
    indexes: Vec<TupleIndex>,
}

impl TupleTable {
    /// Groups `indexes`, which must all have `arity` columns.
    pub fn new(arity: usize, indexes: Vec<TupleIndex>) -> Result<Self> {
        if indexes.is_empty() {
            return Err(StoreError::Invalid("tuple table needs at least one index"));
        }
        if let Some(index) = indexes.iter().find(|index| index.arity() != arity) {
            return Err(StoreError::InvalidOwned(format!(
                "index {} does not have {arity} columns",
                index.name()
            )));
        }
        Ok(Self { arity, indexes })
    }

    /// Columns per tuple.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Indexes in declaration order.
    pub fn indexes(&self) -> &[TupleIndex] {
        &self.indexes
    }

    /// Adds `tuple` to every index; `true` when it was not present.
    pub fn add(&self, txn: &mut Transaction, tuple: &[NodeId]) -> Result<bool> {
        self.check_tuple(tuple)?;
        let mut added = false;
        for (i, index) in self.indexes.iter().enumerate() {
            let inserted = index.tree().insert(txn, &Record::from_key(&index.key_for(tuple)))?;
            if i == 0 {
                added = inserted;
            }
        }
        trace!(columns = self.arity, added, "tuple.add");
        Ok(added)
    }

    /// Removes `tuple` from every index; `true` when it was present.
    pub fn delete(&self, txn: &mut Transaction, tuple: &[NodeId]) -> Result<bool> {
        self.check_tuple(tuple)?;
        let mut removed = false;
        for (i, index) in self.indexes.iter().enumerate() {
            let deleted = index.tree().delete(txn, &index.key_for(tuple))?;
            if i == 0 {
                removed = deleted;
            }
        }
        Ok(removed)
    }

    /// True when `tuple` is present.
    pub fn contains(&self, txn: &Transaction, tuple: &[NodeId]) -> Result<bool> {
        self.check_tuple(tuple)?;
        let index = &self.indexes[0];
        index.tree().contains(txn, &index.key_for(tuple))
    }

    /// Number of tuples visible to `txn`.
    pub fn size(&self, txn: &Transaction) -> Result<u64> {
        self.indexes[0].tree().size(txn)
    }

    /// Tuples matching `pattern`, where [`NodeId::ANY`] is a wildcard.
    ///
    /// The index with the most bound leading columns serves the scan (the
    /// first declared wins ties); other bound columns are filtered. Tuples
    /// come back in canonical column order.
    pub fn find<'a>(&'a self, txn: &'a Transaction, pattern: &[NodeId]) -> Result<TupleIter<'a>> {
        self.check_arity("pattern", pattern.len())?;
        let index = self.choose_index(pattern);
        let prefix = index.prefix_for(pattern);
        let high = ord::prefix_successor(&prefix);
        let inner = if prefix.is_empty() {
            index.tree().find_range(txn, None, None)?
        } else {
            index
                .tree()
                .find_range(txn, Some(prefix.as_slice()), high.as_deref())?
        };
        trace!(index = index.name(), bound = prefix.len() / 8, "tuple.find");
        Ok(TupleIter {
            inner,
            index,
            pattern: pattern.to_vec(),
        })
    }

    /// Index that would serve `pattern`.
    pub fn choose_index(&self, pattern: &[NodeId]) -> &TupleIndex {
        let mut best = &self.indexes[0];
        let mut best_bound = best.bound_prefix(pattern);
        for index in &self.indexes[1..] {
            let bound = index.bound_prefix(pattern);
            if bound > best_bound {
                best = index;
                best_bound = bound;
            }
        }
        best
    }

    /// Fails unless `columns` matches the table arity.
    pub fn check_arity(&self, what: &str, columns: usize) -> Result<()> {
        if columns != self.arity {
            return Err(StoreError::InvalidOwned(format!(
                "{what} has {columns} columns, table has {}",
                self.arity
            )));
        }
        Ok(())
    }

    fn check_tuple(&self, tuple: &[NodeId]) -> Result<()> {
        self.check_arity("tuple", tuple.len())?;
        if tuple.iter().any(|id| id.is_special()) {
            return Err(StoreError::Invalid("stored tuples cannot hold sentinel ids"));
        }
        Ok(())
    }
}

/// Lazy result of [`TupleTable::find`].
pub struct TupleIter<'a> {
    inner: RangeIter<'a>,
    index: &'a TupleIndex,
    pattern: Vec<NodeId>,
}

impl Iterator for TupleIter<'_> {
    type Item = Result<Vec<NodeId>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match self.inner.next()? {
                Ok(record) => record,
                Err(err) => return Some(Err(err)),
            };
            let tuple = self.index.tuple_from_key(record.key());
            let matches = tuple
                .iter()
                .zip(&self.pattern)
                .all(|(id, want)| *want == NodeId::ANY || id == want);
            if matches {
                return Some(Ok(tuple));
            }
        }
    }
}
