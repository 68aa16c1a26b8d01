//! The remote procedure calls the client depends on.
//!
//! Wire marshaling lives behind `VersionControlServer`; everything here is plain data.

use crate::conflict::{ChangePendedFlags, Conflict};
use crate::conflict::group::GetOperation;
use crate::error::SyncError;
use crate::state::{Encoding, HashValue, LocalVersionUpdate};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecursionType {
    None,
    OneLevel,
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemSpec {
    pub item: String,
    pub recursion: RecursionType,
}

impl ItemSpec {
    pub fn single<S: Into<String>>(item: S) -> Self {
        ItemSpec {
            item: item.into(),
            recursion: RecursionType::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionSpec {
    Latest,
    Changeset(i32),
}

/// Options for item queries made while populating updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct QueryItemsOptions {
    pub include_source_renames: bool,
    pub unsorted: bool,
    pub include_download_info: bool,
}

impl QueryItemsOptions {
    /// What the update queue asks for when it needs baseline metadata.
    pub fn for_download() -> Self {
        QueryItemsOptions {
            include_source_renames: true,
            unsorted: true,
            include_download_info: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PendingChangeInfo {
    pub server_item: String,
    pub version: i32,
    pub length: u64,
    pub hash: Option<HashValue>,
    pub download_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ItemInfo {
    pub server_item: String,
    pub item_id: i32,
    pub changeset: i32,
    pub encoding: Encoding,
    pub download_url: Option<String>,
    pub content_hash: Option<HashValue>,
    pub content_length: u64,
    pub checkin_date: Option<i64>,
}

/// How the server should treat per-conflict failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveErrorOptions {
    /// Keep resolving the remaining conflicts and report failures individually.
    Continue,
    /// Stop at the first failure.
    Stop,
}

/// The server's verdict on one conflict sent to `resolve`.
#[derive(Clone, Debug)]
pub enum ResolveOutcome {
    Resolved {
        conflict: Conflict,
        get_ops: Vec<GetOperation>,
        undo_ops: Vec<GetOperation>,
        /// Siblings the server resolved as a side effect of this one.
        other_resolved: Vec<Conflict>,
        flags: ChangePendedFlags,
    },
    Failed {
        conflict: Conflict,
        message: String,
    },
}

pub trait VersionControlServer: Send + Sync {
    fn update_local_version(
        &self,
        workspace: &str,
        owner: &str,
        updates: &[LocalVersionUpdate],
    ) -> Result<(), SyncError>;

    fn query_pending_changes(
        &self,
        workspace: &str,
        owner: &str,
        specs: &[ItemSpec],
        include_download_info: bool,
    ) -> Result<Vec<PendingChangeInfo>, SyncError>;

    fn query_items(
        &self,
        specs: &[ItemSpec],
        version: VersionSpec,
        options: QueryItemsOptions,
    ) -> Result<Vec<Vec<ItemInfo>>, SyncError>;

    /// Resolves conflicts; the server decides which get and undo operations follow.
    fn resolve(
        &self,
        workspace: &str,
        owner: &str,
        conflicts: &[Conflict],
        options: ResolveErrorOptions,
    ) -> Result<Vec<ResolveOutcome>, SyncError>;
}
