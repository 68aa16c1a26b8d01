use std::collections::BTreeMap;

use bitflags::bitflags;
use generic_array::GenericArray;
use serde::{Deserialize, Serialize};
use typenum::U16;
use uuid::Uuid;

use crate::error::SyncError;
use crate::server::{ItemInfo, PendingChangeInfo};
use crate::util::{server_path_key, server_paths_equal};

/// An MD5 content hash, as the server reports it.
pub type HashValue = GenericArray<u8, U16>;

/// Identifies a baseline file; the file name inside the baseline folder.
pub type BaselineId = Uuid;

pub type ItemId = i32;

/// Property name marking an item as a symbolic link.
pub const SYMLINK_PROPERTY: &str = "Microsoft.TeamFoundation.VersionControl.SymbolicLink";

/// A code page, or one of the special markers below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Encoding(pub i32);

impl Encoding {
    pub const UNKNOWN: Encoding = Encoding(0);
    pub const BINARY: Encoding = Encoding(-1);
    pub const UNCHANGED: Encoding = Encoding(-2);
    pub const FOLDER: Encoding = Encoding(-3);
    pub const UTF8: Encoding = Encoding(65001);

    /// True when the encoding says something about the item (not a placeholder).
    pub fn is_known(self) -> bool {
        self != Encoding::UNKNOWN && self != Encoding::UNCHANGED
    }

    pub fn is_folder(self) -> bool {
        self == Encoding::FOLDER
    }
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::UNKNOWN
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValue {
    pub name: String,
    pub value: Option<String>,
}

impl PropertyValue {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        PropertyValue {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

fn is_symlink(properties: &[PropertyValue]) -> bool {
    properties
        .iter()
        .any(|p| p.name.eq_ignore_ascii_case(SYMLINK_PROPERTY) && p.value.as_deref() == Some("true"))
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ChangeType: u32 {
        const ADD = 1;
        const EDIT = 1 << 1;
        const ENCODING = 1 << 2;
        const RENAME = 1 << 3;
        const DELETE = 1 << 4;
        const UNDELETE = 1 << 5;
        const BRANCH = 1 << 6;
        const MERGE = 1 << 7;
        const LOCK = 1 << 8;
        const ROLLBACK = 1 << 9;
        const SOURCE_RENAME = 1 << 10;
        const PROPERTY = 1 << 11;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    Any,
    Folder,
    File,
}

/// Why an update is or isn't ready to be committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Population {
    /// Nothing else is ever needed: a removal, a folder, or an uncommitted add.
    Exempt,
    /// Encoding, length and hash (and check-in date, if required) are known.
    Complete,
    Incomplete(Missing),
}

impl Population {
    pub fn is_ready(self) -> bool {
        match self {
            Population::Incomplete(_) => false,
            _ => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Missing {
    Encoding,
    CheckinDate,
    BaselineMetadata,
}

/// "This local file now holds server version V of item I."
#[derive(Clone, Debug, PartialEq)]
pub struct LocalVersionUpdate {
    pub source_server_item: String,
    pub item_id: ItemId,
    /// `None` removes the mapping.
    pub target_local_item: Option<String>,
    /// 0 for an uncommitted slot, -1 for "committed, no local copy".
    pub version_local: i32,
    /// Check-in time in milliseconds since the epoch.
    pub checkin_date: Option<i64>,
    pub encoding: Encoding,
    pub baseline_hash: Option<HashValue>,
    pub baseline_length: Option<u64>,
    pub baseline_id: Option<BaselineId>,
    pub pending_change_target: Option<String>,
    /// Resolved lazily, while the update is being populated.
    pub download_url: Option<String>,
    pub properties: Vec<PropertyValue>,
    /// Mark the row deleted instead of removing it.
    pub keep_row_on_delete: bool,
    /// Explicit modification time (ms since the epoch) to record instead of reading the disk.
    pub last_modified: Option<i64>,
    /// False for facts that only concern the local tables.
    pub send_to_server: bool,
}

impl LocalVersionUpdate {
    pub fn new<S: Into<String>>(
        source_server_item: S,
        item_id: ItemId,
        target_local_item: Option<String>,
        version_local: i32,
        properties: Vec<PropertyValue>,
    ) -> Self {
        LocalVersionUpdate {
            source_server_item: source_server_item.into(),
            item_id,
            target_local_item,
            version_local,
            checkin_date: None,
            encoding: Encoding::UNKNOWN,
            baseline_hash: None,
            baseline_length: None,
            baseline_id: None,
            pending_change_target: None,
            download_url: None,
            properties,
            keep_row_on_delete: false,
            last_modified: None,
            send_to_server: true,
        }
    }

    /// An update carrying everything the local tables need.
    #[allow(clippy::too_many_arguments)]
    pub fn with_content<S: Into<String>>(
        source_server_item: S,
        item_id: ItemId,
        target_local_item: Option<String>,
        version_local: i32,
        checkin_date: Option<i64>,
        encoding: Encoding,
        baseline_hash: Option<HashValue>,
        baseline_length: Option<u64>,
        properties: Vec<PropertyValue>,
    ) -> Self {
        LocalVersionUpdate {
            checkin_date,
            encoding,
            baseline_hash,
            baseline_length,
            ..LocalVersionUpdate::new(source_server_item, item_id, target_local_item, version_local, properties)
        }
    }

    pub fn pending_change_target<S: Into<String>>(mut self, target: S) -> Self {
        self.pending_change_target = Some(target.into());
        self
    }

    pub fn baseline_id(mut self, id: BaselineId) -> Self {
        self.baseline_id = Some(id);
        self
    }

    pub fn local_only(mut self) -> Self {
        self.send_to_server = false;
        self
    }

    pub fn keep_row_on_delete(mut self) -> Self {
        self.keep_row_on_delete = true;
        self
    }

    pub fn is_committed(&self) -> bool {
        self.version_local != 0
    }

    pub fn population(&self, require_checkin_date: bool) -> Population {
        if self.target_local_item.is_none() {
            return Population::Exempt;
        }
        if !self.encoding.is_known() {
            return Population::Incomplete(Missing::Encoding);
        }
        if self.encoding.is_folder() || (self.version_local == 0 && self.pending_change_target.is_none()) {
            return Population::Exempt;
        }
        if self.version_local != 0 && require_checkin_date && self.checkin_date.is_none() {
            return Population::Incomplete(Missing::CheckinDate);
        }
        if self.baseline_hash.is_some() && self.baseline_length.is_some() {
            Population::Complete
        } else {
            Population::Incomplete(Missing::BaselineMetadata)
        }
    }

    /// Fills the gaps from the existing row for the same item at the same version.
    pub fn update_from_row(&mut self, row: &LocalVersionRow) -> Result<(), SyncError> {
        if !server_paths_equal(&self.source_server_item, &row.server_item) || self.version_local != row.version {
            return Err(SyncError::invariant(format!(
                "row {}@{} does not describe update {}@{}",
                row.server_item, row.version, self.source_server_item, self.version_local
            )));
        }

        if !self.encoding.is_known() {
            self.encoding = row.encoding;
        } else if self.version_local != 0 && self.encoding != row.encoding {
            return Err(SyncError::invariant(format!(
                "encoding of {} changed without a version change",
                self.source_server_item
            )));
        }

        if self.checkin_date.is_none() {
            self.checkin_date = row.checkin_date;
        }

        let symlink = is_symlink(&row.properties) || is_symlink(&self.properties);
        if symlink {
            self.baseline_length = Some(0);
        }
        match (self.baseline_length, row.length) {
            (None, _) => self.baseline_length = row.length,
            (Some(ours), Some(theirs)) if !symlink && self.version_local != 0 && ours != theirs => {
                error!(
                    "The server file {} is out of sync with the local version {:?}",
                    self.source_server_item, self.target_local_item
                );
                return Err(SyncError::invariant(format!(
                    "the server file {} is out of sync with the local version {:?}",
                    self.source_server_item, self.target_local_item
                )));
            }
            _ => {}
        }

        match (self.baseline_hash, row.hash) {
            (None, _) => self.baseline_hash = row.hash,
            (Some(ours), Some(theirs)) if self.version_local != 0 && ours != theirs => {
                return Err(SyncError::invariant(format!(
                    "hash of {} changed without a version change",
                    self.source_server_item
                )));
            }
            _ => {}
        }

        if self.baseline_id.is_none() {
            self.baseline_id = row.baseline_id;
        }
        Ok(())
    }

    pub fn update_from_item(&mut self, item: &ItemInfo) -> Result<(), SyncError> {
        if self.version_local == 0 {
            return Err(SyncError::invariant(format!(
                "attempted to populate uncommitted update {} from a committed item",
                self.source_server_item
            )));
        }
        self.encoding = item.encoding;
        if !item.encoding.is_folder() {
            self.baseline_length = Some(item.content_length);
            self.baseline_hash = item.content_hash;
            self.checkin_date = item.checkin_date;
        }
        Ok(())
    }

    pub fn update_from_pending_change(&mut self, change: &PendingChangeInfo) -> Result<(), SyncError> {
        if self.version_local != change.version || self.encoding == Encoding::UNKNOWN {
            return Err(SyncError::invariant(format!(
                "pending change {} does not describe update {}@{}",
                change.server_item, self.source_server_item, self.version_local
            )));
        }
        self.baseline_length = Some(change.length);
        self.baseline_hash = change.hash;
        Ok(())
    }

    pub fn generate_baseline_id(&mut self) -> Result<BaselineId, SyncError> {
        if self.baseline_id.is_some()
            || self.encoding.is_folder()
            || (self.version_local == 0 && self.download_url.is_none())
        {
            return Err(SyncError::invariant(format!(
                "update {} cannot be given a new baseline",
                self.source_server_item
            )));
        }
        let id = Uuid::new_v4();
        self.baseline_id = Some(id);
        Ok(id)
    }
}

/// One row of the local version table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalVersionRow {
    pub server_item: String,
    pub version: i32,
    pub local_item: Option<String>,
    pub item_id: ItemId,
    pub hash: Option<HashValue>,
    pub encoding: Encoding,
    pub baseline_id: Option<BaselineId>,
    /// Written locally, not yet confirmed by the server.
    pub pending_reconcile: bool,
    pub length: Option<u64>,
    pub checkin_date: Option<i64>,
    pub last_modified: Option<i64>,
    pub properties: Vec<PropertyValue>,
    pub deleted: bool,
}

impl LocalVersionRow {
    pub fn is_committed(&self) -> bool {
        self.version != 0
    }

    fn key(&self) -> (String, bool) {
        (server_path_key(&self.server_item), self.is_committed())
    }
}

/// Keyed by (server item, committed).
///
/// Rows removed by an unacknowledged update stay behind as tombstones: no local item,
/// still pending reconcile, until the server confirms the removal.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalVersionTable {
    rows: BTreeMap<(String, bool), LocalVersionRow>,
    removed: BTreeMap<(String, bool), LocalVersionRow>,
}

impl LocalVersionTable {
    pub fn get_by_server_item(&self, server_item: &str, committed: bool) -> Option<&LocalVersionRow> {
        self.rows.get(&(server_path_key(server_item), committed))
    }

    pub fn get_by_local_item(&self, local_item: &str) -> Option<&LocalVersionRow> {
        self.rows
            .values()
            .find(|row| row.local_item.as_deref().map_or(false, |l| crate::util::local_paths_equal(l, local_item)))
    }

    pub fn remove_by_server_item(&mut self, server_item: &str, committed: bool) -> Option<LocalVersionRow> {
        self.rows.remove(&(server_path_key(server_item), committed))
    }

    /// Removes the row, leaving a tombstone that waits for the server to acknowledge it.
    pub fn remove_for_reconcile(&mut self, server_item: &str, committed: bool) -> Option<LocalVersionRow> {
        let row = self.rows.remove(&(server_path_key(server_item), committed))?;
        let tombstone = LocalVersionRow {
            local_item: None,
            baseline_id: None,
            pending_reconcile: true,
            ..row.clone()
        };
        self.removed.insert(tombstone.key(), tombstone);
        Some(row)
    }

    pub fn add(&mut self, row: LocalVersionRow) {
        let key = row.key();
        self.removed.remove(&key);
        self.rows.insert(key, row);
    }

    pub fn mark_as_deleted(&mut self, server_item: &str, committed: bool) {
        if let Some(row) = self.rows.get_mut(&(server_path_key(server_item), committed)) {
            row.deleted = true;
            row.pending_reconcile = true;
        }
    }

    /// Clears the pending-reconcile marker and drops any tombstone for the item.
    /// Returns false if nothing marked was found.
    pub fn acknowledge(&mut self, server_item: &str, committed: bool) -> bool {
        let key = (server_path_key(server_item), committed);
        let tombstone = self.removed.remove(&key).is_some();
        match self.rows.get_mut(&key) {
            Some(row) if row.pending_reconcile => {
                row.pending_reconcile = false;
                true
            }
            _ => tombstone,
        }
    }

    pub fn get_removed(&self, server_item: &str, committed: bool) -> Option<&LocalVersionRow> {
        self.removed.get(&(server_path_key(server_item), committed))
    }

    /// Tombstones of removals the server has not acknowledged yet.
    pub fn removed(&self) -> impl Iterator<Item = &LocalVersionRow> {
        self.removed.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalVersionRow> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn references_baseline(&self, id: &BaselineId) -> bool {
        self.rows.values().any(|row| row.baseline_id.as_ref() == Some(id))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingChangeRow {
    pub target_server_item: String,
    pub committed_server_item: Option<String>,
    pub item_id: ItemId,
    pub version: i32,
    pub change_type: ChangeType,
    pub encoding: Encoding,
}

/// Keyed by target server item.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PendingChangesTable {
    rows: BTreeMap<String, PendingChangeRow>,
}

impl PendingChangesTable {
    pub fn get_by_target_server_item(&self, server_item: &str) -> Option<&PendingChangeRow> {
        self.rows.get(&server_path_key(server_item))
    }

    pub fn add(&mut self, row: PendingChangeRow) {
        self.rows.insert(server_path_key(&row.target_server_item), row);
    }

    pub fn remove(&mut self, server_item: &str) -> Option<PendingChangeRow> {
        self.rows.remove(&server_path_key(server_item))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Everything a workspace persists locally.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalTables {
    pub versions: LocalVersionTable,
    pub pending: PendingChangesTable,
}
