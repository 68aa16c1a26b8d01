use std::sync::Arc;

use crate::conflict::group::{GetOperation, GetOperationGroup, GroupBuilder};
use crate::conflict::{ChangePendedFlags, Conflict, ConflictId, ConflictType, Resolution};
use crate::error::SyncError;
use crate::events::{EventListener, NonFatalError};
use crate::queue::LocalVersionUpdateQueue;
use crate::server::{ResolveErrorOptions, ResolveOutcome};
use crate::state::{ChangeType, ItemType, LocalVersionUpdate, PropertyValue};
use crate::util::{local_paths_equal, server_paths_equal, FnvHashMap};
use crate::workspace::Workspace;

/// Executes the disk effects of a group of get and undo operations.
pub trait GetEngine {
    fn process_group(&self, group: &GetOperationGroup) -> Result<(), SyncError>;
}

#[derive(Clone, Debug)]
pub struct ResolutionPolicy {
    pub error_options: ResolveErrorOptions,
    /// New source local items chosen while resolving, by conflict id.
    pub updated_source_local_items: FnvHashMap<ConflictId, String>,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        ResolutionPolicy {
            error_options: ResolveErrorOptions::Continue,
            updated_source_local_items: FnvHashMap::default(),
        }
    }
}

/// A local version fact learned from a resolution, queued without another server round trip.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalVersionUpdateSpec {
    pub source_server_item: String,
    pub item_id: i32,
    pub source_local_item: Option<String>,
    pub version_server: i32,
    pub properties: Vec<PropertyValue>,
}

impl LocalVersionUpdateSpec {
    pub fn to_update(&self) -> LocalVersionUpdate {
        LocalVersionUpdate::new(
            self.source_server_item.as_str(),
            self.item_id,
            self.source_local_item.clone(),
            self.version_server,
            self.properties.clone(),
        )
    }
}

#[derive(Debug, Default)]
pub struct ResolveResult {
    /// Every conflict the server resolved, in the order listeners saw them.
    pub resolved: Vec<Conflict>,
    /// Conflicts the server could not resolve, with its message.
    pub failed: Vec<(Conflict, String)>,
    pub groups: Vec<GetOperationGroup>,
    pub update_specs: Vec<LocalVersionUpdateSpec>,
    pub flags: ChangePendedFlags,
}

pub struct ConflictResolutionCoordinator {
    workspace: Arc<Workspace>,
    events: Arc<dyn EventListener>,
}

impl ConflictResolutionCoordinator {
    pub fn new(workspace: Arc<Workspace>, events: Arc<dyn EventListener>) -> Self {
        ConflictResolutionCoordinator { workspace, events }
    }

    /// Sends the chosen resolutions to the server and folds its answers into operation groups.
    ///
    /// A conflict the server fails to resolve is reported as a non-fatal error and left
    /// unresolved; the rest of the batch still goes ahead.
    pub fn resolve(&self, conflicts: &[Conflict], policy: &ResolutionPolicy) -> Result<ResolveResult, SyncError> {
        let workspace = &*self.workspace;
        info!("Resolving {} conflicts in {}", conflicts.len(), workspace.name);
        let outcomes = workspace
            .server
            .resolve(&workspace.name, &workspace.owner, conflicts, policy.error_options)?;

        let mut result = ResolveResult::default();
        let mut builder = GroupBuilder::new();
        for outcome in outcomes {
            match outcome {
                ResolveOutcome::Resolved {
                    conflict,
                    get_ops,
                    undo_ops,
                    other_resolved,
                    flags,
                } => self.conflict_resolved(
                    conflict,
                    get_ops,
                    undo_ops,
                    other_resolved,
                    flags,
                    policy,
                    &mut result,
                    &mut builder,
                ),
                ResolveOutcome::Failed { conflict, message } => {
                    self.conflict_failed(conflict, message, policy, &mut result)
                }
            }
        }
        result.groups = builder.finish();
        debug!(
            "{} conflicts resolved, {} failed, {} operation groups",
            result.resolved.len(),
            result.failed.len(),
            result.groups.len()
        );
        Ok(result)
    }

    fn apply_updated_source_local_item(&self, conflict: &mut Conflict, policy: &ResolutionPolicy) {
        if let Some(updated) = policy.updated_source_local_items.get(&conflict.id) {
            self.workspace.remove_skipped_item(updated);
            conflict.source_local_item = Some(updated.clone());
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn conflict_resolved(
        &self,
        mut conflict: Conflict,
        mut get_ops: Vec<GetOperation>,
        mut undo_ops: Vec<GetOperation>,
        mut other_resolved: Vec<Conflict>,
        flags: ChangePendedFlags,
        policy: &ResolutionPolicy,
        result: &mut ResolveResult,
        builder: &mut GroupBuilder,
    ) {
        self.apply_updated_source_local_item(&mut conflict, policy);

        if conflict.resolution == Resolution::DeleteConflict && !(get_ops.is_empty() && undo_ops.is_empty()) {
            error!(
                "Deleting conflict {} returned {} get and {} undo operations",
                conflict.id,
                get_ops.len(),
                undo_ops.len()
            );
            self.events.non_fatal_error(&NonFatalError::UnexpectedResolveOperations {
                conflict_id: conflict.id,
                get_ops: get_ops.len(),
                undo_ops: undo_ops.len(),
            });
            get_ops.clear();
            undo_ops.clear();
        }

        conflict.resolved = true;
        self.events.conflict_resolved(&conflict, flags);

        other_resolved.sort_by(|a, b| a.report_order(b));
        for other in other_resolved.iter_mut() {
            other.resolved = true;
            other.resolution = conflict.resolution;
            self.events.conflict_resolved(other, flags);
        }

        match conflict.resolution {
            Resolution::AcceptTheirs => {
                if !conflict.is_namespace_conflict {
                    mark_unversioned_undos_overwritable(&conflict, &mut undo_ops);
                }
                if conflict.your_change_type.contains(ChangeType::EDIT) {
                    accept_their_edits(&conflict, &mut get_ops, &mut result.update_specs);
                }
            }
            Resolution::AcceptMerge | Resolution::AcceptYours => {
                keep_resolved_content(&conflict, &mut get_ops, &mut result.update_specs);
            }
            _ => {}
        }

        result.flags |= flags;
        builder.add_conflict_operations(get_ops, undo_ops);
        result.resolved.push(conflict);
        result.resolved.extend(other_resolved);
    }

    fn conflict_failed(&self, mut conflict: Conflict, message: String, policy: &ResolutionPolicy, result: &mut ResolveResult) {
        self.apply_updated_source_local_item(&mut conflict, policy);
        warn!("Could not resolve conflict {} on {}: {}", conflict.id, conflict.your_server_item, message);
        self.events.non_fatal_error(&NonFatalError::ConflictResolveFailed {
            conflict_id: conflict.id,
            message: message.clone(),
        });
        result.failed.push((conflict, message));
    }

    /// Queues the learned local versions, then runs every group in order.
    pub fn apply(
        &self,
        result: &ResolveResult,
        engine: &dyn GetEngine,
        queue: &LocalVersionUpdateQueue,
    ) -> Result<(), SyncError> {
        for spec in &result.update_specs {
            queue.queue_update(spec.to_update())?;
        }
        for (i, group) in result.groups.iter().enumerate() {
            debug!("Processing operation group {} ({} operations)", i, group.len());
            engine.process_group(group)?;
        }
        Ok(())
    }
}

/// Taking theirs over a file you never checked in: the get may overwrite it.
fn mark_unversioned_undos_overwritable(conflict: &Conflict, undo_ops: &mut [GetOperation]) {
    for op in undo_ops.iter_mut() {
        let targets_yours = op
            .target_server_item
            .as_deref()
            .map_or(false, |item| server_paths_equal(item, &conflict.your_server_item));
        if targets_yours && op.version_local == 0 && op.source_local_item.is_some() && op.item_type == ItemType::File {
            op.okay_to_overwrite_existing_local = true;
        }
    }
}

/// Taking theirs over your edit: the server replaces your merged or rolled-back content.
fn accept_their_edits(conflict: &Conflict, get_ops: &mut [GetOperation], specs: &mut Vec<LocalVersionUpdateSpec>) {
    let conflict_item = conflict.your_original_item();
    for op in get_ops.iter_mut() {
        let same_item = op
            .acting_server_item()
            .map_or(false, |item| server_paths_equal(item, conflict_item));
        let replaced_edit = (op.change_type.intersects(ChangeType::MERGE | ChangeType::ROLLBACK)
            || conflict.is_shelveset_conflict())
            && op.change_type.contains(ChangeType::EDIT);
        if same_item && op.version_local == -1 && op.source_local_item.is_some() && replaced_edit {
            op.okay_to_overwrite_existing_local = true;
            if let Some(item) = op.acting_server_item() {
                specs.push(LocalVersionUpdateSpec {
                    source_server_item: item.to_owned(),
                    item_id: op.item_id,
                    source_local_item: op.source_local_item.clone(),
                    version_server: op.version_server,
                    properties: op.properties.clone(),
                });
            }
        }
    }
}

/// Keeping your content (or the merge result): the local file already is what the server
/// now has, so the get becomes a plain move instead of a local conflict.
fn keep_resolved_content(conflict: &Conflict, get_ops: &mut [GetOperation], specs: &mut Vec<LocalVersionUpdateSpec>) {
    for op in get_ops.iter_mut() {
        let merged = conflict.resolution == Resolution::AcceptMerge
            && conflict.merged_file_name.as_deref().map_or(false, |name| !name.is_empty())
            && op
                .target_server_item
                .as_deref()
                .map_or(false, |item| server_paths_equal(item, &conflict.your_server_item))
            && op.item_id == conflict.your_item_id
            && (op.version_local == -1 || op.version_local == 0)
            && op.change_type.contains(ChangeType::MERGE | ChangeType::EDIT);

        let kept_edit = (conflict.conflict_type == ConflictType::Checkin || conflict.conflict_type == ConflictType::Get)
            && op.item_type == ItemType::File
            && op.change_type.contains(ChangeType::EDIT)
            && match (conflict.source_local_item.as_deref(), op.source_local_item.as_deref()) {
                (Some(a), Some(b)) => local_paths_equal(a, b),
                (None, None) => true,
                _ => false,
            };

        if merged || kept_edit {
            specs.push(LocalVersionUpdateSpec {
                source_server_item: op.acting_server_item().unwrap_or_default().to_owned(),
                item_id: op.item_id,
                source_local_item: conflict.source_local_item.clone(),
                version_server: op.version_server,
                properties: op.properties.clone(),
            });
            op.version_local = op.version_server;
            op.source_local_item = conflict.source_local_item.clone();
        }
    }
}
