#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use tidewater::archive::{LocalStateStore, MemoryStore};
use tidewater::conflict::{ChangePendedFlags, Conflict, ConflictId, Resolution};
use tidewater::server::{
    ItemInfo, ItemSpec, PendingChangeInfo, QueryItemsOptions, ResolveErrorOptions, ResolveOutcome,
    VersionControlServer, VersionSpec,
};
use tidewater::state::{Encoding, LocalTables, LocalVersionUpdate};
use tidewater::transfer::{copy_response, ContentTransferClient, ContentType, DownloadOutput, DownloadSpec, TransferError, UploadSpec};
use tidewater::util::{md5_bytes, server_paths_equal, Cancellation};
use tidewater::{
    BaselineManager, BaselineOptions, EventListener, NonFatalError, SyncError, TransferOptions,
    TransferRetryCoordinator, Workspace, WorkspaceLocation,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
pub struct FakeServer {
    pub updates: Mutex<Vec<Vec<LocalVersionUpdate>>>,
    pub items: Mutex<Vec<ItemInfo>>,
    pub pending_changes: Mutex<Vec<PendingChangeInfo>>,
    pub outcomes: Mutex<Vec<ResolveOutcome>>,
    pub resolve_calls: Mutex<Vec<Vec<Conflict>>>,
    pub fail_updates: AtomicBool,
    pub update_delay: Mutex<Duration>,
    pub updates_in_flight: AtomicUsize,
    pub most_updates_in_flight: AtomicUsize,
}

impl FakeServer {
    pub fn update_batches(&self) -> Vec<usize> {
        self.updates.lock().iter().map(|batch| batch.len()).collect()
    }

    pub fn updated_items(&self) -> usize {
        self.updates.lock().iter().map(|batch| batch.len()).sum()
    }
}

impl VersionControlServer for FakeServer {
    fn update_local_version(&self, _: &str, _: &str, updates: &[LocalVersionUpdate]) -> Result<(), SyncError> {
        let in_flight = self.updates_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.most_updates_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let delay = *self.update_delay.lock();
        if delay > Duration::from_millis(0) {
            thread::sleep(delay);
        }
        self.updates_in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(SyncError::server_fault("update rejected"));
        }
        self.updates.lock().push(updates.to_vec());
        Ok(())
    }

    fn query_pending_changes(
        &self,
        _: &str,
        _: &str,
        specs: &[ItemSpec],
        _: bool,
    ) -> Result<Vec<PendingChangeInfo>, SyncError> {
        let changes = self.pending_changes.lock();
        Ok(changes
            .iter()
            .filter(|change| specs.iter().any(|spec| server_paths_equal(&spec.item, &change.server_item)))
            .cloned()
            .collect())
    }

    fn query_items(
        &self,
        specs: &[ItemSpec],
        version: VersionSpec,
        _: QueryItemsOptions,
    ) -> Result<Vec<Vec<ItemInfo>>, SyncError> {
        let items = self.items.lock();
        Ok(specs
            .iter()
            .map(|spec| {
                items
                    .iter()
                    .filter(|item| server_paths_equal(&item.server_item, &spec.item))
                    .filter(|item| match version {
                        VersionSpec::Changeset(changeset) => item.changeset == changeset,
                        VersionSpec::Latest => true,
                    })
                    .cloned()
                    .collect()
            })
            .collect())
    }

    fn resolve(
        &self,
        _: &str,
        _: &str,
        conflicts: &[Conflict],
        _: ResolveErrorOptions,
    ) -> Result<Vec<ResolveOutcome>, SyncError> {
        self.resolve_calls.lock().push(conflicts.to_vec());
        Ok(std::mem::take(&mut *self.outcomes.lock()))
    }
}

/// What the next download attempt does.
pub enum Step {
    /// Writes the partial bytes to every output, then fails with a connection reset.
    Reset(Vec<u8>),
    Timeout,
    Proxy,
    Http(u16),
    Serve(ContentType, Vec<u8>),
}

/// A transfer client that plays back a script, then serves registered content by query.
#[derive(Default)]
pub struct ScriptedTransfer {
    pub script: Mutex<VecDeque<Step>>,
    pub content: Mutex<HashMap<String, (ContentType, Vec<u8>)>>,
    pub calls: Mutex<Vec<(String, bool)>>,
    pub upload_resets: AtomicUsize,
    pub uploads: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTransfer {
    pub fn push(&self, step: Step) {
        self.script.lock().push_back(step);
    }

    pub fn serve<S: Into<String>>(&self, query: S, content_type: ContentType, body: Vec<u8>) {
        self.content.lock().insert(query.into(), (content_type, body));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl ContentTransferClient for ScriptedTransfer {
    fn download(
        &self,
        spec: &DownloadSpec,
        use_proxy: bool,
        outputs: &mut [&mut dyn DownloadOutput],
        cancel: &Cancellation,
    ) -> Result<(), TransferError> {
        self.calls.lock().push((spec.query.clone(), use_proxy));
        let scripted = self.script.lock().pop_front();
        let step = scripted.or_else(|| {
            self.content
                .lock()
                .get(&spec.query)
                .map(|(content_type, body)| Step::Serve(*content_type, body.clone()))
        });
        match step {
            Some(Step::Reset(partial)) => {
                for output in outputs.iter_mut() {
                    output.write_bytes(&partial).map_err(TransferError::Io)?;
                }
                Err(TransferError::ConnectionReset("Connection reset by peer".to_owned()))
            }
            Some(Step::Timeout) => Err(TransferError::Timeout("Read timed out".to_owned())),
            Some(Step::Proxy) => Err(TransferError::ProxyUnavailable("proxy refused the connection".to_owned())),
            Some(Step::Http(status)) => Err(TransferError::Http {
                status,
                url: spec.query.clone(),
            }),
            Some(Step::Serve(content_type, body)) => copy_response(&body[..], content_type, outputs, cancel, 7),
            None => Err(TransferError::Http {
                status: 404,
                url: spec.query.clone(),
            }),
        }
    }

    fn upload(&self, _: &UploadSpec, content: &[u8]) -> Result<(), TransferError> {
        if self.upload_resets.load(Ordering::SeqCst) > 0 {
            self.upload_resets.fetch_sub(1, Ordering::SeqCst);
            return Err(TransferError::ConnectionReset("Connection reset".to_owned()));
        }
        self.uploads.lock().push(content.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    pub resolved: Mutex<Vec<(ConflictId, Resolution)>>,
    pub flags: Mutex<Vec<ChangePendedFlags>>,
    pub errors: Mutex<Vec<NonFatalError>>,
    pub retries: Mutex<Vec<(u32, u64)>>,
}

impl EventListener for RecordingEvents {
    fn conflict_resolved(&self, conflict: &Conflict, flags: ChangePendedFlags) {
        self.resolved.lock().push((conflict.id, conflict.resolution));
        self.flags.lock().push(flags);
    }

    fn non_fatal_error(&self, error: &NonFatalError) {
        self.errors.lock().push(error.clone());
    }

    fn download_retrying(&self, _: &str, attempt: u32, delay_ms: u64) {
        self.retries.lock().push((attempt, delay_ms));
    }
}

/// A memory store whose saves can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_saves: AtomicBool,
}

impl LocalStateStore for FlakyStore {
    fn load(&self) -> Result<LocalTables, SyncError> {
        self.inner.load()
    }

    fn save(&self, tables: &LocalTables) -> Result<(), SyncError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(SyncError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
        }
        self.inner.save(tables)
    }
}

pub fn transfer_options() -> TransferOptions {
    TransferOptions {
        retry_delay: Duration::from_millis(0),
        ..Default::default()
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub server: Arc<FakeServer>,
    pub transfer: Arc<ScriptedTransfer>,
    pub events: Arc<RecordingEvents>,
    pub store: Arc<FlakyStore>,
    pub coordinator: Arc<TransferRetryCoordinator>,
    pub baselines: Arc<BaselineManager>,
    pub workspace: Arc<Workspace>,
}

impl Fixture {
    pub fn new(location: WorkspaceLocation) -> Self {
        Fixture::with_options(location, transfer_options())
    }

    pub fn with_options(location: WorkspaceLocation, options: TransferOptions) -> Self {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("work")).unwrap();
        let server = Arc::new(FakeServer::default());
        let transfer = Arc::new(ScriptedTransfer::default());
        let events = Arc::new(RecordingEvents::default());
        let store = Arc::new(FlakyStore::default());

        let coordinator = Arc::new(TransferRetryCoordinator::new(
            transfer.clone() as Arc<dyn ContentTransferClient>,
            options,
            events.clone() as Arc<dyn EventListener>,
        ));
        let baselines = Arc::new(BaselineManager::new(
            BaselineOptions::new(dir.path().join("baselines")),
            coordinator.clone(),
            server.clone() as Arc<dyn VersionControlServer>,
        ));
        let workspace = Arc::new(Workspace::new(
            "ws",
            "owner",
            location,
            server.clone() as Arc<dyn VersionControlServer>,
            store.clone() as Arc<dyn LocalStateStore>,
            baselines.clone(),
        ));
        Fixture {
            dir,
            server,
            transfer,
            events,
            store,
            coordinator,
            baselines,
            workspace,
        }
    }

    pub fn local_path(&self, name: &str) -> String {
        self.dir.path().join("work").join(name).to_string_lossy().into_owned()
    }

    /// Writes a file into the working folder and returns its path.
    pub fn write_local(&self, name: &str, content: &[u8]) -> String {
        let path = self.local_path(name);
        fs::write(&path, content).unwrap();
        path
    }

    pub fn tables(&self) -> LocalTables {
        self.store.inner.snapshot()
    }
}

/// A committed file update that needs nothing from the server.
pub fn file_update(server_item: &str, item_id: i32, local_item: &str, version: i32, content: &[u8]) -> LocalVersionUpdate {
    LocalVersionUpdate::with_content(
        server_item,
        item_id,
        Some(local_item.to_owned()),
        version,
        Some(1_600_000_000_000),
        Encoding::UTF8,
        Some(md5_bytes(content)),
        Some(content.len() as u64),
        Vec::new(),
    )
}

pub fn folder_update(server_item: &str, item_id: i32, local_item: &str, version: i32) -> LocalVersionUpdate {
    LocalVersionUpdate::with_content(
        server_item,
        item_id,
        Some(local_item.to_owned()),
        version,
        Some(1_600_000_000_000),
        Encoding::FOLDER,
        None,
        None,
        Vec::new(),
    )
}
