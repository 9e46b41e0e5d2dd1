#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::component::{DynComponent, ErasedState, TransactionalComponent};
use crate::primitives::concurrency::{WriterPermit, WriterSlot};
use crate::primitives::journal::{Journal, JournalEntry, JournalRecord, JournalStats};
use crate::types::{ComponentId, Result, StoreError, TxnId, TxnMode, TxnOp, TxnState};

/// Coordinator tuning knobs.
#[derive(Clone, Debug)]
pub struct CoordinatorOptions {
    /// Write commits between journal truncations.
    pub journal_checkpoint_interval: u64,
    /// Refuse write transactions and never write the journal or run
    /// recovery hooks. Opening fails while the journal holds commits.
    pub read_only: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            journal_checkpoint_interval: 1,
            read_only: false,
        }
    }
}

impl CoordinatorOptions {
    /// Sets the number of commits between journal checkpoints (minimum 1).
    pub fn journal_checkpoint_interval(mut self, commits: u64) -> Self {
        self.journal_checkpoint_interval = commits.max(1);
        self
    }

    /// Opens without writing anything.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Live counters for transaction outcomes.
#[derive(Default)]
pub struct CoordinatorStats {
    read_txns: AtomicU64,
    write_txns: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    failed_commits: AtomicU64,
    checkpoints: AtomicU64,
}

/// Snapshot of [`CoordinatorStats`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CoordinatorStatsSnapshot {
    /// Read transactions begun.
    pub read_txns: u64,
    /// Write transactions begun.
    pub write_txns: u64,
    /// Transactions committed.
    pub commits: u64,
    /// Transactions aborted, including failed commits.
    pub aborts: u64,
    /// Write commits that failed at any step.
    pub failed_commits: u64,
    /// Journal checkpoints taken.
    pub checkpoints: u64,
}

impl CoordinatorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters.
    pub fn snapshot(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            read_txns: self.read_txns.load(Ordering::Relaxed),
            write_txns: self.write_txns.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            failed_commits: self.failed_commits.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
        }
    }
}

struct CoordinatorInner {
    components: Vec<Arc<dyn DynComponent>>,
    journal: Journal,
    writer: WriterSlot,
    next_txn: AtomicU64,
    active: AtomicUsize,
    // Held while checking `closed` together with `active`.
    lifecycle: Mutex<()>,
    needs_recovery: AtomicBool,
    closed: AtomicBool,
    commits_since_checkpoint: AtomicU64,
    options: CoordinatorOptions,
    stats: CoordinatorStats,
}

/// Registers components and opens a [`Coordinator`], replaying the journal.
pub struct CoordinatorBuilder {
    journal: Journal,
    options: CoordinatorOptions,
    components: Vec<Arc<dyn DynComponent>>,
}

impl CoordinatorBuilder {
    /// Starts a builder over an opened journal.
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            options: CoordinatorOptions::default(),
            components: Vec::new(),
        }
    }

    /// Overrides the default options.
    pub fn options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    /// Adds a component. Components are prepared and committed in the order
    /// they were added.
    pub fn component<C: TransactionalComponent>(mut self, component: Arc<C>) -> Self {
        self.components.push(component);
        self
    }

    /// Runs recovery and returns the ready coordinator.
    pub fn open(self) -> Result<Coordinator> {
        let mut seen = HashSet::new();
        for component in &self.components {
            if !seen.insert(component.component_id()) {
                return Err(StoreError::InvalidOwned(format!(
                    "duplicate component id {} ({})",
                    component.component_id(),
                    component.label()
                )));
            }
        }
        let next_txn = self.journal.next_txn_id().0;
        let inner = CoordinatorInner {
            components: self.components,
            journal: self.journal,
            writer: WriterSlot::new(),
            next_txn: AtomicU64::new(next_txn),
            active: AtomicUsize::new(0),
            lifecycle: Mutex::new(()),
            needs_recovery: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            commits_since_checkpoint: AtomicU64::new(0),
            options: self.options,
            stats: CoordinatorStats::default(),
        };
        if inner.options.read_only {
            inner.check_replayed()?;
        } else {
            inner.recover()?;
        }
        Ok(Coordinator {
            inner: Arc::new(inner),
        })
    }
}

impl CoordinatorInner {
    fn check_replayed(&self) -> Result<()> {
        if !self.journal.is_empty()? {
            return Err(StoreError::Invalid(
                "journal holds commits to replay; open the location writable first",
            ));
        }
        info!(components = self.components.len(), "coordinator.open.read_only");
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        for component in &self.components {
            component.start_recovery()?;
        }
        let records = self.journal.replay()?;
        let index: HashMap<ComponentId, &Arc<dyn DynComponent>> = self
            .components
            .iter()
            .map(|component| (component.component_id(), component))
            .collect();
        let mut next = self.next_txn.load(Ordering::SeqCst);
        for record in &records {
            next = next.max(record.txn.0 + 1);
            for entry in &record.entries {
                match index.get(&entry.component) {
                    Some(component) => {
                        debug!(
                            txn = %record.txn,
                            component = component.label(),
                            bytes = entry.payload.len(),
                            "coordinator.recover.apply"
                        );
                        component.recover(&entry.payload)?;
                    }
                    None => warn!(
                        txn = %record.txn,
                        component = %entry.component,
                        "coordinator.recover.unknown_component"
                    ),
                }
            }
        }
        for component in &self.components {
            component.finish_recovery()?;
        }
        self.next_txn.store(next, Ordering::SeqCst);
        self.journal.checkpoint(TxnId(next))?;
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        info!(
            records = records.len(),
            components = self.components.len(),
            next_txn = next,
            "coordinator.recover.complete"
        );
        Ok(())
    }

    fn maybe_checkpoint(&self) {
        let since = self.commits_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
        if since < self.options.journal_checkpoint_interval {
            return;
        }
        let next = TxnId(self.next_txn.load(Ordering::SeqCst));
        match self.journal.checkpoint(next) {
            Ok(()) => {
                self.commits_since_checkpoint.store(0, Ordering::SeqCst);
                CoordinatorStats::bump(&self.stats.checkpoints);
            }
            // Components already hold the committed state and replay is
            // idempotent, so the records simply stay until the next attempt.
            Err(err) => warn!(error = %err, "coordinator.checkpoint.failed"),
        }
    }
}

/// Sequences the lifecycle of every registered component and owns the
/// commit journal.
///
/// One write transaction runs at a time; read transactions never block.
/// Cloning is cheap and shares the same coordinator.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("components", &self.inner.components.len())
            .field("active", &self.active_transactions())
            .field("needs_recovery", &self.needs_recovery())
            .finish()
    }
}

impl Coordinator {
    /// Starts a transaction. A write transaction blocks until the writer slot
    /// is free.
    pub fn begin(&self, mode: TxnMode) -> Result<Transaction> {
        let inner = &self.inner;
        self.ensure_usable()?;
        if mode == TxnMode::Write && inner.options.read_only {
            return Err(StoreError::Invalid("write transaction on a read-only coordinator"));
        }
        let permit = match mode {
            TxnMode::Write => Some(inner.writer.acquire()),
            TxnMode::Read => None,
        };
        // A commit may have failed while this writer was waiting. The
        // transaction counts as active from here on, so `close` refuses.
        self.enter()?;
        let id = TxnId(inner.next_txn.fetch_add(1, Ordering::SeqCst));
        let mut states: HashMap<ComponentId, ErasedState> =
            HashMap::with_capacity(inner.components.len());
        for component in &inner.components {
            match component.begin(id, mode) {
                Ok(state) => {
                    states.insert(component.component_id(), state);
                }
                Err(err) => {
                    for begun in inner.components.iter().rev() {
                        if let Some(state) = states.remove(&begun.component_id()) {
                            if let Err(abort_err) = begun.abort(id, state) {
                                warn!(txn = %id, component = begun.label(), error = %abort_err, "coordinator.begin.abort_failed");
                            }
                        }
                    }
                    inner.active.fetch_sub(1, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
        let counter = match mode {
            TxnMode::Read => &inner.stats.read_txns,
            TxnMode::Write => &inner.stats.write_txns,
        };
        CoordinatorStats::bump(counter);
        debug!(txn = %id, mode = ?mode, "coordinator.begin");
        Ok(Transaction {
            id,
            mode,
            state: TxnState::Active,
            states,
            coordinator: Arc::clone(inner),
            permit,
        })
    }

    /// Runs `f` in a write transaction, committing on `Ok` and aborting on
    /// `Err`.
    pub fn execute_write<T>(&self, f: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        let mut txn = self.begin(TxnMode::Write)?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(end_err) = txn.end() {
                    warn!(error = %end_err, "coordinator.execute_write.abort_failed");
                }
                Err(err)
            }
        }
    }

    /// Runs `f` in a read transaction.
    pub fn execute_read<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let txn = self.begin(TxnMode::Read)?;
        let result = f(&txn);
        txn.end()?;
        result
    }

    /// Number of transactions begun and not yet finished.
    pub fn active_transactions(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// True once a commit failed after its journal record was written.
    pub fn needs_recovery(&self) -> bool {
        self.inner.needs_recovery.load(Ordering::SeqCst)
    }

    /// Ids of the registered components, in commit order.
    pub fn component_ids(&self) -> Vec<ComponentId> {
        self.inner
            .components
            .iter()
            .map(|component| component.component_id())
            .collect()
    }

    /// Current journal file length.
    pub fn journal_len(&self) -> Result<u64> {
        self.inner.journal.len()
    }

    /// Journal activity counters.
    pub fn journal_stats(&self) -> JournalStats {
        self.inner.journal.stats()
    }

    /// Transaction outcome counters.
    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Checkpoints the journal and rejects further transactions.
    pub fn close(&self) -> Result<()> {
        {
            let _gate = self.inner.lifecycle.lock();
            if self.active_transactions() > 0 {
                return Err(StoreError::Invalid("cannot close with active transactions"));
            }
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }
        if !self.needs_recovery() && !self.inner.options.read_only {
            let next = TxnId(self.inner.next_txn.load(Ordering::SeqCst));
            self.inner.journal.checkpoint(next)?;
        }
        debug!("coordinator.close");
        Ok(())
    }

    /// Rejects further transactions without waiting for active ones. The
    /// journal is left untouched and replayed on the next open.
    pub fn shutdown(&self) {
        let _gate = self.inner.lifecycle.lock();
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            warn!(active = self.active_transactions(), "coordinator.shutdown");
        }
    }

    /// True after [`Coordinator::close`] or [`Coordinator::shutdown`].
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<()> {
        let _gate = self.inner.lifecycle.lock();
        self.ensure_usable()?;
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.needs_recovery() {
            return Err(StoreError::NeedsRecovery);
        }
        Ok(())
    }
}

/// One transaction's lifetime and the per-component state captured at begin.
///
/// Dropping a transaction that is still active aborts it.
pub struct Transaction {
    id: TxnId,
    mode: TxnMode,
    state: TxnState,
    states: HashMap<ComponentId, ErasedState>,
    coordinator: Arc<CoordinatorInner>,
    permit: Option<WriterPermit>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .finish()
    }
}

impl Transaction {
    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Mode requested at begin.
    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// True while operations are accepted.
    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// Fails unless this is a write transaction.
    pub fn require_write(&self) -> Result<()> {
        match self.mode {
            TxnMode::Write => Ok(()),
            TxnMode::Read => Err(StoreError::Invalid("write operation in a read transaction")),
        }
    }

    /// Borrows the state `component` captured at begin.
    pub fn component_state<S: Send + 'static>(&self, component: ComponentId) -> Result<&S> {
        self.expect_active(TxnOp::Access)?;
        self.states
            .get(&component)
            .ok_or(StoreError::Invalid("component is not registered with this coordinator"))?
            .downcast_ref::<S>()
            .ok_or(StoreError::Invalid("component state type mismatch"))
    }

    /// Mutably borrows the state `component` captured at begin.
    pub fn component_state_mut<S: Send + 'static>(
        &mut self,
        component: ComponentId,
    ) -> Result<&mut S> {
        self.expect_active(TxnOp::Access)?;
        self.states
            .get_mut(&component)
            .ok_or(StoreError::Invalid("component is not registered with this coordinator"))?
            .downcast_mut::<S>()
            .ok_or(StoreError::Invalid("component state type mismatch"))
    }

    /// Commits. On failure the transaction is left aborted.
    pub fn commit(&mut self) -> Result<()> {
        self.expect_active(TxnOp::Commit)?;
        let inner = Arc::clone(&self.coordinator);
        match self.mode {
            TxnMode::Read => {
                self.end_components(&inner.components);
                self.finish(TxnState::Committed);
                CoordinatorStats::bump(&inner.stats.commits);
                debug!(txn = %self.id, "coordinator.commit.read");
                Ok(())
            }
            TxnMode::Write => self.commit_write(&inner),
        }
    }

    /// Rolls back every component.
    pub fn abort(&mut self) -> Result<()> {
        self.expect_active(TxnOp::Abort)?;
        let inner = Arc::clone(&self.coordinator);
        let result = self.abort_components(&inner.components);
        self.finish(TxnState::Aborted);
        CoordinatorStats::bump(&inner.stats.aborts);
        debug!(txn = %self.id, "coordinator.abort");
        result
    }

    /// Finishes the transaction, aborting it if it is still active.
    pub fn end(mut self) -> Result<()> {
        if self.state == TxnState::Active {
            return self.abort();
        }
        Ok(())
    }

    fn expect_active(&self, op: TxnOp) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(StoreError::txn_state(op, self.state));
        }
        Ok(())
    }

    fn commit_write(&mut self, inner: &CoordinatorInner) -> Result<()> {
        let entries = match self.prepare_components(&inner.components) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(txn = %self.id, error = %err, "coordinator.commit.prepare_failed");
                return Err(self.fail_commit(inner, 0, err));
            }
        };
        self.state = TxnState::Prepared;
        let record = JournalRecord {
            txn: self.id,
            entries,
        };
        if let Err(err) = inner.journal.append(&record) {
            warn!(txn = %self.id, error = %err, "coordinator.commit.journal_failed");
            return Err(self.fail_commit(inner, 0, err));
        }
        debug!(txn = %self.id, entries = record.entries.len(), "coordinator.commit.journal_synced");

        for (idx, component) in inner.components.iter().enumerate() {
            let cid = component.component_id();
            let result = match self.states.get_mut(&cid) {
                Some(state) => component.commit(self.id, state),
                None => Err(StoreError::Invalid("missing component state")),
            };
            if let Err(err) = result {
                error!(
                    txn = %self.id,
                    component = component.label(),
                    error = %err,
                    "coordinator.commit.failed_after_journal"
                );
                inner.needs_recovery.store(true, Ordering::SeqCst);
                return Err(self.fail_commit(inner, idx, err));
            }
        }
        self.end_components(&inner.components);
        inner.maybe_checkpoint();
        self.finish(TxnState::Committed);
        CoordinatorStats::bump(&inner.stats.commits);
        debug!(txn = %self.id, "coordinator.commit.done");
        Ok(())
    }

    /// Ends components `..committed` normally, aborts the rest and leaves the
    /// transaction aborted.
    fn fail_commit(
        &mut self,
        inner: &CoordinatorInner,
        committed: usize,
        err: StoreError,
    ) -> StoreError {
        self.end_components(&inner.components[..committed]);
        if let Err(abort_err) = self.abort_components(&inner.components[committed..]) {
            warn!(txn = %self.id, error = %abort_err, "coordinator.commit.abort_failed");
        }
        self.finish(TxnState::Aborted);
        CoordinatorStats::bump(&inner.stats.aborts);
        CoordinatorStats::bump(&inner.stats.failed_commits);
        err
    }

    fn prepare_components(
        &mut self,
        components: &[Arc<dyn DynComponent>],
    ) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::with_capacity(components.len());
        for component in components {
            let cid = component.component_id();
            let state = self
                .states
                .get_mut(&cid)
                .ok_or(StoreError::Invalid("missing component state"))?;
            let payload = component.commit_prepare(self.id, state)?;
            entries.push(JournalEntry {
                component: cid,
                payload,
            });
        }
        Ok(entries)
    }

    fn end_components(&mut self, components: &[Arc<dyn DynComponent>]) {
        for component in components {
            if let Some(state) = self.states.remove(&component.component_id()) {
                component.commit_end(self.id, state);
            }
        }
    }

    fn abort_components(&mut self, components: &[Arc<dyn DynComponent>]) -> Result<()> {
        let mut first_err = None;
        for component in components.iter().rev() {
            if let Some(state) = self.states.remove(&component.component_id()) {
                if let Err(err) = component.abort(self.id, state) {
                    warn!(txn = %self.id, component = component.label(), error = %err, "coordinator.abort.component_failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn finish(&mut self, state: TxnState) {
        self.state = state;
        self.states.clear();
        self.permit.take();
        self.coordinator.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(self.state, TxnState::Active | TxnState::Prepared) {
            if let Err(err) = self.abort_components_on_drop() {
                warn!(txn = %self.id, error = %err, "coordinator.drop.abort_failed");
            }
        }
    }
}

impl Transaction {
    fn abort_components_on_drop(&mut self) -> Result<()> {
        let inner = Arc::clone(&self.coordinator);
        let result = self.abort_components(&inner.components);
        self.finish(TxnState::Aborted);
        CoordinatorStats::bump(&inner.stats.aborts);
        result
    }
}
