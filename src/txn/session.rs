#![forbid(unsafe_code)]

use super::coordinator::{Coordinator, Transaction};
use crate::types::{Result, StoreError, TxnMode, TxnOp, TxnState};

/// Thread-affine holder of at most one current transaction.
///
/// `begin` while a transaction is active is rejected; a finished
/// transaction is simply replaced.
#[derive(Debug)]
pub struct Session {
    coordinator: Coordinator,
    current: Option<Transaction>,
}

impl Session {
    /// Creates a session with no transaction.
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            current: None,
        }
    }

    /// Starts a transaction in `mode`.
    pub fn begin(&mut self, mode: TxnMode) -> Result<&mut Transaction> {
        if let Some(txn) = &self.current {
            if !txn.state().is_terminal() {
                return Err(StoreError::txn_state(TxnOp::Begin, txn.state()));
            }
        }
        let txn = self.coordinator.begin(mode)?;
        Ok(self.current.insert(txn))
    }

    /// Commits the current transaction.
    pub fn commit(&mut self) -> Result<()> {
        self.current_mut(TxnOp::Commit)?.commit()
    }

    /// Aborts the current transaction.
    pub fn abort(&mut self) -> Result<()> {
        self.current_mut(TxnOp::Abort)?.abort()
    }

    /// Finishes the current transaction, aborting it if still active.
    /// Calling `end` with nothing to end is a no-op.
    pub fn end(&mut self) -> Result<()> {
        match self.current.take() {
            Some(txn) => txn.end(),
            None => Ok(()),
        }
    }

    /// True while the current transaction accepts operations.
    pub fn is_in_transaction(&self) -> bool {
        self.current.as_ref().is_some_and(Transaction::is_active)
    }

    /// State of the current transaction, or `Inactive` when there is none.
    pub fn state(&self) -> TxnState {
        self.current
            .as_ref()
            .map_or(TxnState::Inactive, Transaction::state)
    }

    /// Borrows the current transaction.
    pub fn transaction(&self) -> Result<&Transaction> {
        self.current
            .as_ref()
            .ok_or(StoreError::txn_state(TxnOp::Access, TxnState::Inactive))
    }

    /// Mutably borrows the current transaction.
    pub fn transaction_mut(&mut self) -> Result<&mut Transaction> {
        self.current_mut(TxnOp::Access)
    }

    /// The coordinator this session begins transactions on.
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    fn current_mut(&mut self, op: TxnOp) -> Result<&mut Transaction> {
        self.current
            .as_mut()
            .ok_or(StoreError::txn_state(op, TxnState::Inactive))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.end() {
            tracing::warn!(error = %err, "session.drop.end_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;
    use crate::primitives::journal::Journal;
    use crate::txn::CoordinatorBuilder;
    use std::sync::Arc;

    fn session() -> Result<Session> {
        let journal = Journal::open(Arc::new(MemFileIo::new()))?;
        Ok(Session::new(CoordinatorBuilder::new(journal).open()?))
    }

    #[test]
    fn operations_without_a_transaction_are_rejected() -> Result<()> {
        let mut session = session()?;
        assert_eq!(session.state(), TxnState::Inactive);
        assert!(session.commit().unwrap_err().is_txn_state());
        assert!(session.abort().unwrap_err().is_txn_state());
        assert!(session.transaction().unwrap_err().is_txn_state());
        session.end()?;
        session.end()
    }

    #[test]
    fn begin_twice_is_rejected_until_finished() -> Result<()> {
        let mut session = session()?;
        session.begin(TxnMode::Write)?;
        let err = session.begin(TxnMode::Read).unwrap_err();
        assert!(err.is_txn_state());
        assert!(session.is_in_transaction());

        session.commit()?;
        assert_eq!(session.state(), TxnState::Committed);
        assert!(session.commit().unwrap_err().is_txn_state());
        assert!(session.abort().unwrap_err().is_txn_state());

        // a finished transaction is replaced by the next begin
        session.begin(TxnMode::Read)?;
        session.abort()?;
        assert_eq!(session.state(), TxnState::Aborted);
        session.end()?;
        assert_eq!(session.state(), TxnState::Inactive);
        assert_eq!(session.coordinator().active_transactions(), 0);
        Ok(())
    }

    #[test]
    fn end_aborts_an_active_transaction() -> Result<()> {
        let mut session = session()?;
        session.begin(TxnMode::Write)?;
        session.end()?;
        assert_eq!(session.coordinator().stats().aborts, 1);
        // the writer slot is free again
        session.begin(TxnMode::Write)?;
        session.commit()
    }
}
