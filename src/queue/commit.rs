//! How a batch of updates changes the local tables.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::baseline::{BaselineRequest, BaselineSource};
use crate::error::SyncError;
use crate::state::{BaselineId, LocalTables, LocalVersionRow, LocalVersionUpdate};
use crate::util::server_paths_equal;

/// Baseline bookkeeping produced by a commit, applied only once the transaction is saved.
#[derive(Debug, Default)]
pub struct CommitEffects {
    /// Baselines of rows pushed out of their local path, not yet deleted.
    pub displaced: BTreeSet<BaselineId>,
    /// Baselines no row references any more.
    pub freed: Vec<BaselineId>,
    /// Baselines referenced by the batch; any earlier free of these is undone.
    pub referenced: Vec<BaselineId>,
}

impl CommitEffects {
    pub fn new(displaced: BTreeSet<BaselineId>) -> Self {
        CommitEffects {
            displaced,
            ..Default::default()
        }
    }

    fn release(&mut self, id: BaselineId) {
        self.freed.push(id);
    }

    fn reference(&mut self, id: BaselineId) {
        if self.displaced.remove(&id) {
            debug!("Displaced baseline {} is referenced again", id);
        }
        self.freed.retain(|freed| *freed != id);
        self.referenced.push(id);
    }
}

/// The server item whose pending change an uncommitted update belongs to.
fn pending_target(update: &LocalVersionUpdate) -> &str {
    update
        .pending_change_target
        .as_deref()
        .unwrap_or(&update.source_server_item)
}

fn modified_millis(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    modified.duration_since(UNIX_EPOCH).ok().map(|d| d.as_millis() as i64)
}

/// Clears the pending-reconcile marker on every row the server has confirmed.
pub fn acknowledge(tables: &mut LocalTables, acks: &[LocalVersionUpdate]) -> usize {
    let mut acknowledged = 0;
    for ack in acks.iter().filter(|ack| ack.send_to_server) {
        if tables.versions.acknowledge(&ack.source_server_item, ack.is_committed()) {
            acknowledged += 1;
        } else {
            trace!("Nothing to acknowledge for {}", ack.source_server_item);
        }
    }
    acknowledged
}

/// Decides which updates need baseline content, assigning new baseline ids as it goes.
pub fn plan_baselines(
    tables: &LocalTables,
    batch: &mut [LocalVersionUpdate],
) -> Result<Vec<BaselineRequest>, SyncError> {
    let mut requests = Vec::new();
    for update in batch.iter_mut() {
        let local_item = match update.target_local_item {
            Some(ref local_item) if !update.encoding.is_folder() && update.baseline_id.is_none() => {
                PathBuf::from(local_item)
            }
            _ => continue,
        };
        let committed = update.is_committed();
        if !committed && tables.pending.get_by_target_server_item(pending_target(update)).is_none() {
            continue;
        }

        let existing = tables
            .versions
            .get_by_server_item(&update.source_server_item, committed)
            .filter(|row| {
                row.baseline_id.is_some()
                    && row.hash.is_some()
                    && row.hash == update.baseline_hash
                    && row.length == update.baseline_length
            });
        if let Some(row) = existing {
            trace!("Reusing baseline of {} for {}", row.server_item, update.source_server_item);
            update.baseline_id = row.baseline_id;
            continue;
        }

        if update.download_url.is_none() && update.version_local <= 0 {
            continue;
        }
        let id = update.generate_baseline_id()?;
        let fallback = match update.download_url {
            Some(ref url) => BaselineSource::Download(url.clone()),
            None => BaselineSource::Lookup {
                server_item: update.source_server_item.clone(),
                version: update.version_local,
            },
        };
        let source = if local_item.is_file() {
            BaselineSource::LocalItem {
                path: local_item,
                fallback: Box::new(fallback),
            }
        } else {
            fallback
        };
        requests.push(BaselineRequest::new(id, source, update.baseline_hash).expected_length(update.baseline_length));
    }
    Ok(requests)
}

/// Writes one update into the tables, marking the row pending reconcile.
pub fn apply_update(
    tables: &mut LocalTables,
    update: &LocalVersionUpdate,
    effects: &mut CommitEffects,
) -> Result<(), SyncError> {
    let source = &update.source_server_item;
    let committed = update.is_committed();

    let local_item = match update.target_local_item {
        Some(ref local_item) => local_item,
        None => {
            if update.keep_row_on_delete {
                tables.versions.mark_as_deleted(source, committed);
            } else if let Some(row) = tables.versions.remove_for_reconcile(source, committed) {
                if let Some(id) = row.baseline_id {
                    effects.release(id);
                }
            }
            return Ok(());
        }
    };

    if !committed && tables.pending.get_by_target_server_item(pending_target(update)).is_none() {
        debug!("Skipping uncommitted update for {}: no pending change", source);
        return Ok(());
    }

    let colliding = tables
        .versions
        .get_by_local_item(local_item)
        .filter(|row| !(server_paths_equal(&row.server_item, source) && row.is_committed() == committed))
        .map(|row| (row.server_item.clone(), row.is_committed()));
    if let Some((server_item, row_committed)) = colliding {
        debug!("{} displaces {} from {}", source, server_item, local_item);
        if let Some(row) = tables.versions.remove_by_server_item(&server_item, row_committed) {
            if let Some(id) = row.baseline_id {
                effects.displaced.insert(id);
            }
        }
    }

    let existing = tables.versions.get_by_server_item(source, committed).cloned();
    let baseline_id = match update.baseline_id {
        Some(id) => Some(id),
        None => existing.as_ref().and_then(|row| {
            if row.hash.is_some() && row.hash == update.baseline_hash && row.length == update.baseline_length {
                row.baseline_id
            } else {
                None
            }
        }),
    };
    if let Some(old) = existing.as_ref().and_then(|row| row.baseline_id) {
        if Some(old) != baseline_id {
            effects.release(old);
        }
    }
    if let Some(id) = baseline_id {
        effects.reference(id);
    }

    let last_modified = update
        .last_modified
        .or_else(|| modified_millis(Path::new(local_item)));

    tables.versions.add(LocalVersionRow {
        server_item: source.clone(),
        version: update.version_local,
        local_item: Some(local_item.clone()),
        item_id: update.item_id,
        hash: update.baseline_hash,
        encoding: update.encoding,
        baseline_id,
        pending_reconcile: true,
        length: update.baseline_length,
        checkin_date: update.checkin_date,
        last_modified,
        properties: update.properties.clone(),
        deleted: false,
    });
    Ok(())
}
