//! Batches local version updates and commits them to the local tables and the server.
//!
//! A flush runs four phases in a fixed order: populate the updates, download missing
//! baselines, commit to the local tables, then tell the server. Rows written locally carry
//! a pending-reconcile marker that is cleared at the start of the next flush (or at close)
//! once the server has accepted them.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::{QueueOptions, UpdateTargets};
use crate::error::SyncError;
use crate::server::{ItemSpec, PendingChangeInfo, QueryItemsOptions, VersionSpec};
use crate::state::{BaselineId, Encoding, LocalVersionUpdate, Population, PropertyValue};
use crate::util::{server_path_key, Cancellation, FnvHashMap};
use crate::workspace::Workspace;

pub mod commit;

use self::commit::CommitEffects;

struct QueueState {
    pending: Vec<LocalVersionUpdate>,
    /// When the oldest pending update was queued.
    oldest: Option<Instant>,
    closed: bool,
}

/// Owned by whoever holds the flush lock.
#[derive(Default)]
struct FlushState {
    /// Updates the server accepted in the last flush; acknowledged locally in the next one.
    pending_acks: Vec<LocalVersionUpdate>,
    /// Baselines pushed out of the tables during the queue's lifetime, deleted at close.
    displaced: BTreeSet<BaselineId>,
}

pub struct LocalVersionUpdateQueue {
    workspace: Arc<Workspace>,
    options: QueueOptions,
    cancel: Cancellation,
    state: Mutex<QueueState>,
    space_available: Condvar,
    flushing: AtomicBool,
    flush_lock: Mutex<FlushState>,
}

impl LocalVersionUpdateQueue {
    pub fn new(workspace: Arc<Workspace>, options: QueueOptions) -> Result<Self, SyncError> {
        options.validate()?;
        Ok(LocalVersionUpdateQueue {
            workspace,
            options,
            cancel: Cancellation::new(),
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                oldest: None,
                closed: false,
            }),
            space_available: Condvar::new(),
            flushing: AtomicBool::new(false),
            flush_lock: Mutex::new(FlushState::default()),
        })
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Cancels baseline downloads made by flushes of this queue.
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Waits for a running flush to finish.
    pub fn pending_ack_count(&self) -> usize {
        self.flush_lock.lock().pending_acks.len()
    }

    pub fn displaced_baselines(&self) -> Vec<BaselineId> {
        self.flush_lock.lock().displaced.iter().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn updates_local(&self) -> bool {
        self.options.targets.includes_local() && self.workspace.is_local()
    }

    /// Returns false for updates this queue has nothing to do with.
    fn accepts(&self, update: &LocalVersionUpdate) -> Result<bool, SyncError> {
        if !update.send_to_server && !self.updates_local() {
            trace!("Dropping local-only update for {}", update.source_server_item);
            return Ok(false);
        }
        if !self.workspace.is_local() && update.item_id == 0 {
            return Err(SyncError::InvalidUpdate(format!(
                "update for {} has no item id; server workspaces require one",
                update.source_server_item
            )));
        }
        Ok(true)
    }

    /// Convenience for `queue_update` with a bare update.
    pub fn queue<S: Into<String>>(
        &self,
        source_server_item: S,
        item_id: i32,
        target_local_item: Option<String>,
        version_local: i32,
        properties: Vec<PropertyValue>,
    ) -> Result<(), SyncError> {
        self.queue_update(LocalVersionUpdate::new(
            source_server_item,
            item_id,
            target_local_item,
            version_local,
            properties,
        ))
    }

    /// Adds an update, blocking while the queue is full.
    ///
    /// If this update brings the queue to its flush trigger level, or the oldest update has
    /// waited longer than the time trigger, the flush runs on this thread and its error is
    /// returned here (the update itself stays queued). A caller that gave up waiting on a
    /// full queue queues its update past the maximum level, even if its own flush failed.
    /// Updates submitted after `close` are discarded.
    pub fn queue_update(&self, update: LocalVersionUpdate) -> Result<(), SyncError> {
        if !self.accepts(&update)? {
            return Ok(());
        }

        let mut failed_flush = None;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                debug!("Queue closed, discarding update for {}", update.source_server_item);
                return Ok(());
            }
            if state.pending.len() < self.options.maximum_level {
                break;
            }
            let timed_out = self
                .space_available
                .wait_for(&mut state, self.options.sleep_interval)
                .timed_out();
            if timed_out
                && !state.closed
                && state.pending.len() >= self.options.maximum_level
                && !self.flushing.load(Ordering::SeqCst)
            {
                // a full queue with nobody flushing: a wakeup was lost or a flush failed
                debug!("Queue full with no flush running, flushing on a waiting thread");
                if let Err(e) = MutexGuard::unlocked(&mut state, || self.try_flush()) {
                    if state.closed {
                        return Err(e);
                    }
                    warn!("Flush on a waiting thread failed, queueing {} anyway", update.source_server_item);
                    failed_flush = Some(e);
                    break;
                }
            }
        }

        if state.pending.is_empty() {
            state.oldest = Some(Instant::now());
        }
        state.pending.push(update);
        let trigger = state.pending.len() >= self.options.flush_trigger_level
            || state
                .oldest
                .map_or(false, |oldest| oldest.elapsed() >= self.options.time_trigger);
        drop(state);

        if let Some(e) = failed_flush {
            return Err(e);
        }
        if trigger {
            self.try_flush()?;
        }
        Ok(())
    }

    /// Flushes unless another thread already is.
    fn try_flush(&self) -> Result<(), SyncError> {
        match self.flush_lock.try_lock() {
            Some(mut flush) => self.flush_with(&mut flush),
            None => {
                trace!("A flush is already running");
                Ok(())
            }
        }
    }

    /// Commits everything pending, waiting for a running flush first.
    pub fn flush(&self) -> Result<(), SyncError> {
        let mut flush = self.flush_lock.lock();
        self.flush_with(&mut flush)
    }

    fn flush_with(&self, flush: &mut FlushState) -> Result<(), SyncError> {
        self.flushing.store(true, Ordering::SeqCst);
        let result = self.flush_pending(flush);
        self.flushing.store(false, Ordering::SeqCst);
        result
    }

    fn flush_pending(&self, flush: &mut FlushState) -> Result<(), SyncError> {
        let batch = self.state.lock().pending.clone();
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();
        let result = self.process(batch, flush);

        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.pending.drain(..count);
                state.oldest = if state.pending.is_empty() {
                    None
                } else {
                    Some(Instant::now())
                };
            }
            Err(ref e) => warn!("Flush of {} updates failed, keeping them queued: {}", count, e),
        }
        self.space_available.notify_all();
        result
    }

    fn process(&self, mut batch: Vec<LocalVersionUpdate>, flush: &mut FlushState) -> Result<(), SyncError> {
        let workspace = &*self.workspace;
        let local = self.updates_local();
        info!(
            "Flushing {} local version updates for {} ({:?}, local tables: {})",
            batch.len(),
            workspace.name,
            self.options.targets,
            local
        );

        if local {
            debug!("Populating updates");
            self.populate(&mut batch)?;

            debug!("Running baseline maintenance");
            workspace.baselines.maintenance()?;

            let requests = workspace
                .lock()
                .read(|tables| commit::plan_baselines(tables, &mut batch))?;
            debug!("Downloading {} baselines", requests.len());
            workspace.baselines.resolve(requests, &self.cancel)?;

            debug!("Committing locally ({} acknowledgements)", flush.pending_acks.len());
            let acks = &flush.pending_acks;
            let mut effects = CommitEffects::new(flush.displaced.clone());
            workspace.lock().transact(|tables| {
                let acknowledged = commit::acknowledge(tables, acks);
                trace!("Acknowledged {} rows", acknowledged);
                for update in &batch {
                    commit::apply_update(tables, update, &mut effects)?;
                }
                Ok(())
            })?;

            flush.pending_acks.clear();
            flush.displaced = effects.displaced;
            for id in &effects.referenced {
                workspace.baselines.reclaim(id);
            }
            for id in effects.freed {
                workspace.baselines.free_baseline(id);
            }
        }

        if self.options.targets.includes_server() {
            let outgoing: Vec<LocalVersionUpdate> = batch.into_iter().filter(|u| u.send_to_server).collect();
            if !outgoing.is_empty() {
                debug!("Committing {} updates to the server", outgoing.len());
                workspace
                    .server
                    .update_local_version(&workspace.name, &workspace.owner, &outgoing)?;
            }
            if local && self.options.targets == UpdateTargets::Both {
                flush.pending_acks.extend(outgoing);
            }
        }
        Ok(())
    }

    /// Fills in encoding, length, hash and check-in date, first from the local tables and
    /// then from the server.
    fn populate(&self, batch: &mut [LocalVersionUpdate]) -> Result<(), SyncError> {
        let workspace = &*self.workspace;
        let require_checkin = workspace.options.set_file_time_to_checkin;

        workspace.lock().read(|tables| {
            for update in batch.iter_mut() {
                if update.population(require_checkin).is_ready() {
                    continue;
                }
                if update.encoding == Encoding::UNKNOWN {
                    if let Some(ref target) = update.pending_change_target {
                        if let Some(change) = tables.pending.get_by_target_server_item(target) {
                            update.encoding = change.encoding;
                        }
                    }
                }
                let row = tables
                    .versions
                    .get_by_server_item(&update.source_server_item, update.is_committed())
                    .filter(|row| row.version == update.version_local);
                if let Some(row) = row {
                    update.update_from_row(row)?;
                }
            }
            Ok(())
        })?;

        let incomplete: Vec<usize> = (0..batch.len())
            .filter(|&i| !batch[i].population(require_checkin).is_ready())
            .collect();
        if incomplete.is_empty() {
            return Ok(());
        }

        let by_pending_change: Vec<(usize, String)> = incomplete
            .iter()
            .filter_map(|&i| batch[i].pending_change_target.clone().map(|target| (i, target)))
            .collect();
        if !by_pending_change.is_empty() {
            let specs: Vec<ItemSpec> = by_pending_change
                .iter()
                .map(|(_, target)| ItemSpec::single(target.as_str()))
                .collect();
            let changes = workspace
                .server
                .query_pending_changes(&workspace.name, &workspace.owner, &specs, true)?;
            let changes: FnvHashMap<String, PendingChangeInfo> = changes
                .into_iter()
                .map(|change| (server_path_key(&change.server_item), change))
                .collect();
            for (i, target) in by_pending_change {
                match changes.get(&server_path_key(&target)) {
                    Some(change) => {
                        let update = &mut batch[i];
                        update.update_from_pending_change(change)?;
                        if update.download_url.is_none() {
                            update.download_url = change.download_url.clone();
                        }
                    }
                    None => warn!("No pending change returned for {}", target),
                }
            }
        }

        let by_item: Vec<usize> = incomplete
            .into_iter()
            .filter(|&i| batch[i].pending_change_target.is_none())
            .collect();
        for i in by_item {
            let update = &mut batch[i];
            let version = if update.version_local > 0 {
                VersionSpec::Changeset(update.version_local)
            } else {
                VersionSpec::Latest
            };
            let results = workspace.server.query_items(
                &[ItemSpec::single(update.source_server_item.as_str())],
                version,
                QueryItemsOptions::for_download(),
            )?;
            match results.into_iter().flatten().next() {
                Some(item) => {
                    update.update_from_item(&item)?;
                    if update.download_url.is_none() {
                        update.download_url = item.download_url;
                    }
                }
                None => warn!(
                    "No item returned for {};{}",
                    update.source_server_item, update.version_local
                ),
            }
        }

        for update in batch.iter() {
            if let Population::Incomplete(missing) = update.population(require_checkin) {
                return Err(SyncError::invariant(format!(
                    "update for {};{} is not fully populated ({:?} missing)",
                    update.source_server_item, update.version_local, missing
                )));
            }
        }
        Ok(())
    }

    fn flush_acks(&self, flush: &mut FlushState) -> Result<(), SyncError> {
        if flush.pending_acks.is_empty() {
            return Ok(());
        }
        let acks = &flush.pending_acks;
        let acknowledged = self
            .workspace
            .lock()
            .transact(|tables| Ok(commit::acknowledge(tables, acks)))?;
        debug!("Acknowledged {} of {} rows", acknowledged, flush.pending_acks.len());
        flush.pending_acks.clear();
        Ok(())
    }

    /// Flushes everything, acknowledges the last batch and deletes displaced baselines.
    ///
    /// Waiting callers are released and their updates discarded. Deletion failures are
    /// logged, not returned.
    pub fn close(&self) -> Result<(), SyncError> {
        self.state.lock().closed = true;
        self.space_available.notify_all();

        let mut flush = self.flush_lock.lock();
        self.flushing.store(true, Ordering::SeqCst);
        let result = self
            .flush_pending(&mut flush)
            .and_then(|_| self.flush_acks(&mut flush));
        self.flushing.store(false, Ordering::SeqCst);
        result?;

        let displaced: Vec<BaselineId> = std::mem::take(&mut flush.displaced).into_iter().collect();
        let displaced = if displaced.is_empty() || !self.workspace.is_local() {
            displaced
        } else {
            self.workspace.lock().read(|tables| {
                Ok(displaced
                    .into_iter()
                    .filter(|id| !tables.versions.references_baseline(id))
                    .collect::<Vec<_>>())
            })?
        };
        for id in displaced {
            match self.workspace.baselines.delete_baseline(&id) {
                Ok(()) => debug!("Deleted displaced baseline {}", id),
                Err(e) => warn!("Could not delete displaced baseline {}: {}", id, e),
            }
        }
        self.workspace.baselines.delete_freed();
        Ok(())
    }
}

impl Drop for LocalVersionUpdateQueue {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.close() {
            warn!("Closing the local version update queue failed: {}", e);
        }
    }
}
