#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{ObjectBounds, ObjectFile};
use crate::primitives::io::FileIo;
use crate::storage::meta::StateFile;
use crate::txn::{Transaction, TransactionalComponent};
use crate::types::{ComponentId, Result, StoreError, TxnId, TxnMode};

/// Per-transaction snapshot of an object file.
pub struct ObjectTxnState {
    mode: TxnMode,
    bounds: ObjectBounds,
    prepared: Option<ObjectBounds>,
}

struct Committed {
    bounds: ObjectBounds,
    recovered: bool,
}

/// Transactional wrapper over an [`ObjectFile`].
///
/// A read transaction sees exactly the objects committed when it began:
/// reads at or past its captured length fail with `NotFound`. A write
/// transaction appends past the committed end; commit makes the appended
/// objects durable and visible, abort cuts them off again.
pub struct TransObjectFile {
    component: ComponentId,
    label: String,
    file: ObjectFile,
    state_file: StateFile,
    committed: Mutex<Committed>,
}

impl TransObjectFile {
    /// Opens the object file in `data_io` with its committed bounds in
    /// `state_io`.
    pub fn open(
        component: ComponentId,
        label: impl Into<String>,
        data_io: Arc<dyn FileIo>,
        state_io: Arc<dyn FileIo>,
    ) -> Result<Self> {
        let label = label.into();
        let (state_file, payload) = StateFile::open(state_io)?;
        let bounds = match payload {
            Some(bytes) => ObjectBounds::decode(&bytes)?,
            None => ObjectBounds::default(),
        };
        let physical = data_io.len()?;
        if physical < bounds.length {
            return Err(StoreError::CorruptionOwned(format!(
                "object file {label} is {physical} bytes but {} are committed",
                bounds.length
            )));
        }
        debug!(
            object_file = %label,
            length = bounds.length,
            position = bounds.position,
            uncommitted_tail = physical - bounds.length,
            "object.open"
        );
        Ok(Self {
            component,
            label,
            file: ObjectFile::with_bounds(data_io, bounds),
            state_file,
            committed: Mutex::new(Committed {
                bounds,
                recovered: false,
            }),
        })
    }

    /// Latest committed bounds.
    pub fn committed_bounds(&self) -> ObjectBounds {
        self.committed.lock().bounds
    }

    /// The underlying file, for verification and statistics.
    pub fn file(&self) -> &ObjectFile {
        &self.file
    }

    /// Appends `bytes` in a write transaction and returns their offset.
    pub fn write(&self, txn: &mut Transaction, bytes: &[u8]) -> Result<u64> {
        let state = txn.component_state_mut::<ObjectTxnState>(self.component)?;
        if state.mode != TxnMode::Write {
            return Err(StoreError::Invalid("write operation in a read transaction"));
        }
        self.file.write(bytes)
    }

    /// Reads the object at `offset` as visible to `txn`.
    pub fn read(&self, txn: &Transaction, offset: u64) -> Result<Vec<u8>> {
        let limit = self.length(txn)?;
        if offset >= limit {
            return Err(StoreError::NotFound("object"));
        }
        self.file.read_within(offset, limit)
    }

    /// Length visible to `txn`: the captured committed length for readers,
    /// the current logical length for the writer.
    pub fn length(&self, txn: &Transaction) -> Result<u64> {
        let state = txn.component_state::<ObjectTxnState>(self.component)?;
        Ok(match state.mode {
            TxnMode::Read => state.bounds.length,
            TxnMode::Write => self.file.length(),
        })
    }

    /// Object count visible to `txn`.
    pub fn position(&self, txn: &Transaction) -> Result<u64> {
        let state = txn.component_state::<ObjectTxnState>(self.component)?;
        Ok(match state.mode {
            TxnMode::Read => state.bounds.position,
            TxnMode::Write => self.file.position(),
        })
    }

    /// Syncs the data file.
    pub fn close(&self) -> Result<()> {
        self.file.sync()
    }
}

impl TransactionalComponent for TransObjectFile {
    type State = ObjectTxnState;

    fn component_id(&self) -> ComponentId {
        self.component
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn begin(&self, _txn: TxnId, mode: TxnMode) -> Result<ObjectTxnState> {
        Ok(ObjectTxnState {
            mode,
            bounds: self.committed.lock().bounds,
            prepared: None,
        })
    }

    fn commit_prepare(&self, _txn: TxnId, state: &mut ObjectTxnState) -> Result<Vec<u8>> {
        if state.mode == TxnMode::Read {
            return Ok(Vec::new());
        }
        let current = self.file.bounds();
        if current == state.bounds {
            return Ok(Vec::new());
        }
        self.file.sync()?;
        state.prepared = Some(current);
        Ok(current.encode().to_vec())
    }

    fn commit(&self, txn: TxnId, state: &mut ObjectTxnState) -> Result<()> {
        let Some(bounds) = state.prepared else {
            return Ok(());
        };
        self.state_file.write(&bounds.encode())?;
        self.committed.lock().bounds = bounds;
        debug!(
            object_file = %self.label,
            txn = %txn,
            length = bounds.length,
            position = bounds.position,
            "object.commit"
        );
        Ok(())
    }

    fn commit_end(&self, _txn: TxnId, _state: ObjectTxnState) {}

    fn abort(&self, txn: TxnId, state: ObjectTxnState) -> Result<()> {
        if state.mode == TxnMode::Read {
            return Ok(());
        }
        if state.prepared.is_some() {
            // The journal may already describe these bytes; keep them on
            // disk and only move the logical end.
            self.file.rewind(state.bounds);
        } else if self.file.bounds() != state.bounds {
            self.file.truncate(state.bounds)?;
            self.file.sync()?;
        }
        debug!(object_file = %self.label, txn = %txn, length = state.bounds.length, "object.abort");
        Ok(())
    }

    fn recover(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let bounds = ObjectBounds::decode(payload)?;
        let mut committed = self.committed.lock();
        if bounds.length >= committed.bounds.length {
            committed.bounds = bounds;
            committed.recovered = true;
        }
        Ok(())
    }

    fn finish_recovery(&self) -> Result<()> {
        let (bounds, recovered) = {
            let mut committed = self.committed.lock();
            (committed.bounds, std::mem::take(&mut committed.recovered))
        };
        let physical = self.file.physical_length()?;
        if physical < bounds.length {
            return Err(StoreError::CorruptionOwned(format!(
                "object file {} is {physical} bytes but recovery expects {}",
                self.label, bounds.length
            )));
        }
        if physical > bounds.length {
            info!(
                object_file = %self.label,
                discarded = physical - bounds.length,
                "object.recover.truncated_tail"
            );
            self.file.truncate(bounds)?;
            self.file.sync()?;
        } else {
            self.file.rewind(bounds);
        }
        if recovered {
            self.state_file.write(&bounds.encode())?;
        }
        Ok(())
    }
}
