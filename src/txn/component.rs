#![forbid(unsafe_code)]

use std::any::Any;

use crate::types::{ComponentId, Result, StoreError, TxnId, TxnMode};

/// Lifecycle every stateful storage component implements.
///
/// The coordinator calls `begin` on every registered component when a
/// transaction starts and keeps the returned [`TransactionalComponent::State`]
/// inside the [`super::Transaction`]. Write transactions then see
/// `commit_prepare`, `commit` and `commit_end` in that order, or `abort`.
/// Read transactions only ever see `commit_end` or `abort`.
///
/// Effects of a write transaction must not become visible to readers before
/// `commit`, which the coordinator only calls after the journal record
/// holding every `commit_prepare` payload is durable.
pub trait TransactionalComponent: Send + Sync + 'static {
    /// Per-transaction snapshot.
    type State: Send + 'static;

    /// Stable identity used to route journal payloads.
    fn component_id(&self) -> ComponentId;

    /// Short human-readable name for logs.
    fn label(&self) -> &str;

    /// Captures the committed state for a new transaction.
    fn begin(&self, txn: TxnId, mode: TxnMode) -> Result<Self::State>;

    /// Makes the transaction's changes durable-but-invisible and returns the
    /// payload recovery needs to finish the commit.
    fn commit_prepare(&self, txn: TxnId, state: &mut Self::State) -> Result<Vec<u8>>;

    /// Publishes the prepared changes.
    fn commit(&self, txn: TxnId, state: &mut Self::State) -> Result<()>;

    /// Releases in-memory resources once every component committed.
    fn commit_end(&self, txn: TxnId, state: Self::State);

    /// Rolls back to the state captured at `begin`.
    fn abort(&self, txn: TxnId, state: Self::State) -> Result<()>;

    /// Called once before any journal payload is replayed.
    fn start_recovery(&self) -> Result<()> {
        Ok(())
    }

    /// Re-applies one payload produced by `commit_prepare`. Must be
    /// idempotent: a payload may be replayed more than once.
    fn recover(&self, payload: &[u8]) -> Result<()>;

    /// Called once after replay, before the first transaction begins.
    fn finish_recovery(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) type ErasedState = Box<dyn Any + Send>;

/// Object-safe view of [`TransactionalComponent`] with the state erased.
pub(crate) trait DynComponent: Send + Sync {
    fn component_id(&self) -> ComponentId;
    fn label(&self) -> &str;
    fn begin(&self, txn: TxnId, mode: TxnMode) -> Result<ErasedState>;
    fn commit_prepare(&self, txn: TxnId, state: &mut ErasedState) -> Result<Vec<u8>>;
    fn commit(&self, txn: TxnId, state: &mut ErasedState) -> Result<()>;
    fn commit_end(&self, txn: TxnId, state: ErasedState);
    fn abort(&self, txn: TxnId, state: ErasedState) -> Result<()>;
    fn start_recovery(&self) -> Result<()>;
    fn recover(&self, payload: &[u8]) -> Result<()>;
    fn finish_recovery(&self) -> Result<()>;
}

fn state_mismatch() -> StoreError {
    StoreError::Invalid("component state type mismatch")
}

impl<C: TransactionalComponent> DynComponent for C {
    fn component_id(&self) -> ComponentId {
        TransactionalComponent::component_id(self)
    }

    fn label(&self) -> &str {
        TransactionalComponent::label(self)
    }

    fn begin(&self, txn: TxnId, mode: TxnMode) -> Result<ErasedState> {
        let state = TransactionalComponent::begin(self, txn, mode)?;
        Ok(Box::new(state))
    }

    fn commit_prepare(&self, txn: TxnId, state: &mut ErasedState) -> Result<Vec<u8>> {
        let state = (**state)
            .downcast_mut::<C::State>()
            .ok_or_else(state_mismatch)?;
        TransactionalComponent::commit_prepare(self, txn, state)
    }

    fn commit(&self, txn: TxnId, state: &mut ErasedState) -> Result<()> {
        let state = (**state)
            .downcast_mut::<C::State>()
            .ok_or_else(state_mismatch)?;
        TransactionalComponent::commit(self, txn, state)
    }

    fn commit_end(&self, txn: TxnId, state: ErasedState) {
        if let Ok(state) = state.downcast::<C::State>() {
            TransactionalComponent::commit_end(self, txn, *state);
        }
    }

    fn abort(&self, txn: TxnId, state: ErasedState) -> Result<()> {
        let state = state.downcast::<C::State>().map_err(|_| state_mismatch())?;
        TransactionalComponent::abort(self, txn, *state)
    }

    fn start_recovery(&self) -> Result<()> {
        TransactionalComponent::start_recovery(self)
    }

    fn recover(&self, payload: &[u8]) -> Result<()> {
        TransactionalComponent::recover(self, payload)
    }

    fn finish_recovery(&self) -> Result<()> {
        TransactionalComponent::finish_recovery(self)
    }
}
