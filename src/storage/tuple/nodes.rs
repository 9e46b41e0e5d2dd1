#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::debug;

use super::table::{TupleIter, TupleTable};
use crate::storage::nodes::{NodeTable, Term};
use crate::txn::Transaction;
use crate::types::{NodeId, Result};

/// Tuple table addressed by terms instead of ids.
#[derive(Debug)]
pub struct NodeTupleTable {
    nodes: Arc<NodeTable>,
    tuples: TupleTable,
}

impl NodeTupleTable {
    /// Layers term resolution through `nodes` over `tuples`.
    pub fn new(nodes: Arc<NodeTable>, tuples: TupleTable) -> Self {
        Self { nodes, tuples }
    }

    /// Dictionary used to resolve terms.
    pub fn node_table(&self) -> &Arc<NodeTable> {
        &self.nodes
    }

    /// Underlying id tuples.
    pub fn tuple_table(&self) -> &TupleTable {
        &self.tuples
    }

    /// Adds a tuple of terms, allocating ids as needed; `true` when new.
    pub fn add(&self, txn: &mut Transaction, terms: &[Term]) -> Result<bool> {
        self.tuples.check_arity("tuple", terms.len())?;
        let ids = terms
            .iter()
            .map(|term| self.nodes.id_for(txn, term))
            .collect::<Result<Vec<_>>>()?;
        self.tuples.add(txn, &ids)
    }

    /// Deletes a tuple of terms; a tuple with an unknown term is absent.
    pub fn delete(&self, txn: &mut Transaction, terms: &[Term]) -> Result<bool> {
        match self.resolve(txn, terms.iter().map(Some))? {
            Some(ids) => self.tuples.delete(txn, &ids),
            None => Ok(false),
        }
    }

    /// True when the tuple of terms is present.
    pub fn contains(&self, txn: &Transaction, terms: &[Term]) -> Result<bool> {
        match self.resolve(txn, terms.iter().map(Some))? {
            Some(ids) => self.tuples.contains(txn, &ids),
            None => Ok(false),
        }
    }

    /// Tuples matching `pattern`, where `None` is a wildcard. A pattern
    /// naming a term the dictionary does not hold matches nothing.
    pub fn find<'a>(
        &'a self,
        txn: &'a Transaction,
        pattern: &[Option<Term>],
    ) -> Result<TermTupleIter<'a>> {
        let inner = match self.resolve(txn, pattern.iter().map(Option::as_ref))? {
            Some(ids) => Some(self.tuples.find(txn, &ids)?),
            None => None,
        };
        Ok(TermTupleIter {
            inner,
            nodes: &self.nodes,
            txn,
        })
    }

    /// Deletes every tuple matching `pattern` and returns how many went.
    pub fn delete_matching(&self, txn: &mut Transaction, pattern: &[Option<Term>]) -> Result<u64> {
        let Some(ids) = self.resolve(txn, pattern.iter().map(Option::as_ref))? else {
            return Ok(0);
        };
        let matches = self.tuples.find(txn, &ids)?.collect::<Result<Vec<_>>>()?;
        let mut removed = 0;
        for tuple in &matches {
            if self.tuples.delete(txn, tuple)? {
                removed += 1;
            }
        }
        debug!(removed, "tuple.delete_matching");
        Ok(removed)
    }

    // `None` when some concrete term is unknown; wildcards become ANY.
    fn resolve<'t>(
        &self,
        txn: &Transaction,
        terms: impl Iterator<Item = Option<&'t Term>>,
    ) -> Result<Option<Vec<NodeId>>> {
        let mut ids = Vec::new();
        for term in terms {
            match term {
                None => ids.push(NodeId::ANY),
                Some(term) => match self.nodes.lookup(txn, term)? {
                    Some(id) => ids.push(id),
                    None => return Ok(None),
                },
            }
        }
        Ok(Some(ids))
    }
}

/// Lazy result of [`NodeTupleTable::find`].
pub struct TermTupleIter<'a> {
    inner: Option<TupleIter<'a>>,
    nodes: &'a NodeTable,
    txn: &'a Transaction,
}

impl Iterator for TermTupleIter<'_> {
    type Item = Result<Vec<Term>>;

    fn next(&mut self) -> Option<Self::Item> {
        let ids = match self.inner.as_mut()?.next()? {
            Ok(ids) => ids,
            Err(err) => return Some(Err(err)),
        };
        Some(
            ids.into_iter()
                .map(|id| self.nodes.term_for(self.txn, id))
                .collect(),
        )
    }
}
