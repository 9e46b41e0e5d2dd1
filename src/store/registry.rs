#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::dataset::DatasetStorage;
use super::location::{Location, LOCK_FILE};
use crate::primitives::concurrency::LocationLock;
use crate::storage::StoreOptions;
use crate::txn::{Coordinator, Session, Transaction};
use crate::types::{Result, StoreError, TxnMode};

/// An open dataset: its storage, the coordinator driving it and the
/// location lock.
pub struct StoreConnection {
    location: Location,
    storage: DatasetStorage,
    coordinator: Coordinator,
    lock: Mutex<Option<LocationLock>>,
    closed: AtomicBool,
}

impl StoreConnection {
    /// Opens `location` without registering it. Most callers go through a
    /// [`ConnectionRegistry`] instead.
    pub fn open(location: Location, options: &StoreOptions) -> Result<Self> {
        let lock = match location.path() {
            Some(dir) if options.use_lock_file => {
                std::fs::create_dir_all(dir)?;
                Some(LocationLock::acquire(dir.join(LOCK_FILE))?)
            }
            _ => None,
        };
        let (storage, coordinator) = DatasetStorage::open(&location, options)?;
        Ok(Self {
            location,
            storage,
            coordinator,
            lock: Mutex::new(lock),
            closed: AtomicBool::new(false),
        })
    }

    /// Where this dataset lives.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Storage components.
    pub fn storage(&self) -> &DatasetStorage {
        &self.storage
    }

    /// Transaction coordinator.
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Starts a transaction.
    pub fn begin(&self, mode: TxnMode) -> Result<Transaction> {
        self.ensure_open()?;
        self.coordinator.begin(mode)
    }

    /// Caller-side transaction handle.
    pub fn session(&self) -> Result<Session> {
        self.ensure_open()?;
        Ok(Session::new(self.coordinator.clone()))
    }

    /// True once released or expelled.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Checkpoints the journal and closes every file. Fails with `Invalid`
    /// while transactions are active.
    pub fn close(&self) -> Result<()> {
        self.shut(false)
    }

    fn shut(&self, force: bool) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if force {
            self.coordinator.shutdown();
        } else {
            self.coordinator.close()?;
        }
        self.closed.store(true, Ordering::SeqCst);
        let flushed = self.storage.close();
        // Dropping the lock lets another process open the location.
        self.lock.lock().take();
        debug!(location = %self.location, force, "registry.connection.closed");
        flushed
    }
}

impl fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConnection")
            .field("location", &self.location)
            .field("closed", &self.is_closed())
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

/// Process-local map from [`Location`] to its one open [`StoreConnection`].
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<Location, Arc<StoreConnection>>>,
    defaults: StoreOptions,
}

impl ConnectionRegistry {
    /// Creates an empty registry using default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry whose `connect` uses `options`.
    pub fn with_options(options: StoreOptions) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            defaults: options,
        }
    }

    /// Returns the connection for `location`, opening it on first use.
    pub fn connect(&self, location: &Location) -> Result<Arc<StoreConnection>> {
        let options = self.defaults.clone();
        self.connect_with(location, &options)
    }

    /// Like [`ConnectionRegistry::connect`], with explicit options for a
    /// first open. An existing connection is returned as is.
    pub fn connect_with(
        &self,
        location: &Location,
        options: &StoreOptions,
    ) -> Result<Arc<StoreConnection>> {
        let mut connections = self.connections.lock();
        if let Some(conn) = connections.get(location) {
            if !conn.is_closed() {
                debug!(location = %location, "registry.connect.cached");
                return Ok(Arc::clone(conn));
            }
            // closed directly through StoreConnection::close
            connections.remove(location);
        }
        let conn = Arc::new(StoreConnection::open(location.clone(), options)?);
        connections.insert(location.clone(), Arc::clone(&conn));
        info!(location = %location, "registry.connect.opened");
        Ok(conn)
    }

    /// The open connection for `location`, if any.
    pub fn get(&self, location: &Location) -> Option<Arc<StoreConnection>> {
        self.connections.lock().get(location).cloned()
    }

    /// Closes and forgets the connection for `location`. Fails with
    /// `Invalid` while transactions are active; the connection stays
    /// registered in that case.
    pub fn release(&self, location: &Location) -> Result<bool> {
        let mut connections = self.connections.lock();
        let Some(conn) = connections.get(location) else {
            return Ok(false);
        };
        conn.shut(false)?;
        connections.remove(location);
        Ok(true)
    }

    /// Removes the connection for `location`. With `force`, active
    /// transactions do not prevent it; otherwise this behaves like
    /// [`ConnectionRegistry::release`].
    pub fn expel(&self, location: &Location, force: bool) -> Result<bool> {
        if !force {
            return self.release(location);
        }
        let Some(conn) = self.connections.lock().remove(location) else {
            return Ok(false);
        };
        if let Err(err) = conn.shut(true) {
            warn!(location = %location, error = %err, "registry.expel.close_failed");
            return Err(err);
        }
        Ok(true)
    }

    /// Force-closes every connection.
    pub fn reset(&self) -> Result<()> {
        let drained: Vec<_> = self.connections.lock().drain().collect();
        let mut first_err = None;
        for (location, conn) in drained {
            if let Err(err) = conn.shut(true) {
                warn!(location = %location, error = %err, "registry.reset.close_failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// True when no connection is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connections = self.connections.lock();
        f.debug_struct("ConnectionRegistry")
            .field("locations", &connections.keys().collect::<Vec<_>>())
            .finish()
    }
}
