use std::sync::Arc;

use parking_lot::Mutex;

use crate::archive::LocalStateStore;
use crate::baseline::BaselineManager;
use crate::config::WorkspaceOptions;
use crate::error::SyncError;
use crate::server::VersionControlServer;
use crate::state::LocalTables;
use crate::util::FnvHashSet;

/// Where the authoritative version table of a workspace lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkspaceLocation {
    /// The client caches the table in its own local state store.
    Local,
    /// Only the server tracks versions.
    Server,
}

/// Serializes every transaction against a workspace's local tables.
///
/// At most one writer runs at a time; the queue, the baseline maintenance pass and the
/// conflict coordinator all go through the same lock.
pub struct WorkspaceLock {
    store: Arc<dyn LocalStateStore>,
    guard: Mutex<()>,
}

impl WorkspaceLock {
    pub fn new(store: Arc<dyn LocalStateStore>) -> Self {
        WorkspaceLock {
            store,
            guard: Mutex::new(()),
        }
    }

    /// Loads the tables, applies `mutate` and saves them.
    ///
    /// Nothing is saved if `mutate` fails, so an aborted transaction leaves the store untouched.
    pub fn transact<R, F>(&self, mutate: F) -> Result<R, SyncError>
    where
        F: FnOnce(&mut LocalTables) -> Result<R, SyncError>,
    {
        let _guard = self.guard.lock();
        let mut tables = self.store.load()?;
        let result = mutate(&mut tables)?;
        self.store.save(&tables)?;
        Ok(result)
    }

    pub fn read<R, F>(&self, inspect: F) -> Result<R, SyncError>
    where
        F: FnOnce(&LocalTables) -> Result<R, SyncError>,
    {
        let _guard = self.guard.lock();
        let tables = self.store.load()?;
        inspect(&tables)
    }
}

/// Everything an operation needs to know about the workspace it runs against.
///
/// Constructed by the application and passed down explicitly; there is no process-wide cache.
pub struct Workspace {
    pub name: String,
    pub owner: String,
    pub location: WorkspaceLocation,
    pub options: WorkspaceOptions,
    pub server: Arc<dyn VersionControlServer>,
    pub baselines: Arc<BaselineManager>,
    lock: WorkspaceLock,
    skipped: Mutex<FnvHashSet<String>>,
}

impl Workspace {
    pub fn new<N: Into<String>, O: Into<String>>(
        name: N,
        owner: O,
        location: WorkspaceLocation,
        server: Arc<dyn VersionControlServer>,
        store: Arc<dyn LocalStateStore>,
        baselines: Arc<BaselineManager>,
    ) -> Self {
        Workspace {
            name: name.into(),
            owner: owner.into(),
            location,
            options: WorkspaceOptions::default(),
            server,
            baselines,
            lock: WorkspaceLock::new(store),
            skipped: Mutex::new(FnvHashSet::default()),
        }
    }

    pub fn with_options(mut self, options: WorkspaceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_local(&self) -> bool {
        self.location == WorkspaceLocation::Local
    }

    pub fn lock(&self) -> &WorkspaceLock {
        &self.lock
    }

    /// Marks a local item the scanner should leave alone until a conflict on it is settled.
    pub fn add_skipped_item<S: Into<String>>(&self, local_item: S) {
        self.skipped.lock().insert(local_item.into());
    }

    pub fn remove_skipped_item(&self, local_item: &str) -> bool {
        self.skipped.lock().remove(local_item)
    }

    pub fn is_skipped(&self, local_item: &str) -> bool {
        self.skipped.lock().contains(local_item)
    }
}
