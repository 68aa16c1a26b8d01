pub mod group;
pub mod resolve;

use std::cmp::Ordering;

use bitflags::bitflags;

use crate::state::{ChangeType, ItemType, PropertyValue};
use crate::util::compare_top_down;

pub type ConflictId = i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictType {
    Local,
    Get,
    Checkin,
    Merge,
    Shelveset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    None,
    AcceptYours,
    AcceptTheirs,
    AcceptMerge,
    OverwriteLocal,
    DeleteConflict,
}

bitflags! {
    /// What a resolution changed on the server besides the conflict itself.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ChangePendedFlags: u32 {
        const WORKING_FOLDER_MAPPINGS_UPDATED = 1;
        const PENDING_CHANGES_UPDATED = 1 << 1;
        const LOCAL_VERSIONS_UPDATED = 1 << 2;
    }
}

/// A server-detected discrepancy waiting for (or carrying) a resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct Conflict {
    pub id: ConflictId,
    pub conflict_type: ConflictType,
    pub your_item_id: i32,
    pub your_server_item: String,
    /// Where "your" item was before a pending rename.
    pub your_server_item_source: Option<String>,
    pub their_server_item: Option<String>,
    pub your_change_type: ChangeType,
    pub your_item_type: ItemType,
    pub resolution: Resolution,
    pub merged_file_name: Option<String>,
    pub source_local_item: Option<String>,
    pub target_local_item: Option<String>,
    pub is_namespace_conflict: bool,
    pub resolved: bool,
}

impl Conflict {
    pub fn new<S: Into<String>>(id: ConflictId, conflict_type: ConflictType, your_server_item: S) -> Self {
        Conflict {
            id,
            conflict_type,
            your_item_id: 0,
            your_server_item: your_server_item.into(),
            your_server_item_source: None,
            their_server_item: None,
            your_change_type: ChangeType::empty(),
            your_item_type: ItemType::File,
            resolution: Resolution::None,
            merged_file_name: None,
            source_local_item: None,
            target_local_item: None,
            is_namespace_conflict: false,
            resolved: false,
        }
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn is_shelveset_conflict(&self) -> bool {
        self.conflict_type == ConflictType::Shelveset
    }

    /// The item "your" side was pended on, before any rename.
    pub fn your_original_item(&self) -> &str {
        self.your_server_item_source
            .as_deref()
            .unwrap_or(&self.your_server_item)
    }

    /// Total order used when reporting conflicts: your item top-down, their item, then id.
    pub fn report_order(&self, other: &Conflict) -> Ordering {
        compare_top_down(&self.your_server_item, &other.your_server_item)
            .then_with(|| match (&self.their_server_item, &other.their_server_item) {
                (Some(a), Some(b)) => compare_top_down(a, b),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyMergeOutcome {
    /// Both sides made the same change.
    Redundant,
    Unchanged,
    TakeYours,
    TakeTheirs,
    Conflicting,
}

/// Three-way merge of the properties of "your" and "their" item.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyMergeSummary {
    pub merged: Vec<PropertyValue>,
    pub outcomes: Vec<(String, PropertyMergeOutcome)>,
}

fn lookup<'a>(properties: &'a [PropertyValue], name: &str) -> Option<&'a str> {
    properties
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .and_then(|p| p.value.as_deref())
}

impl PropertyMergeSummary {
    pub fn merge(base: &[PropertyValue], yours: &[PropertyValue], theirs: &[PropertyValue]) -> Self {
        let mut names: Vec<&str> = base
            .iter()
            .chain(yours)
            .chain(theirs)
            .map(|p| p.name.as_str())
            .collect();
        names.sort_by_key(|name| name.to_lowercase());
        names.dedup_by(|a, b| a.eq_ignore_ascii_case(*b));

        let mut merged = Vec::new();
        let mut outcomes = Vec::new();
        for name in names {
            let (b, y, t) = (lookup(base, name), lookup(yours, name), lookup(theirs, name));
            let (outcome, value) = if y == t {
                if y == b {
                    (PropertyMergeOutcome::Unchanged, y)
                } else {
                    (PropertyMergeOutcome::Redundant, y)
                }
            } else if t == b {
                (PropertyMergeOutcome::TakeYours, y)
            } else if y == b {
                (PropertyMergeOutcome::TakeTheirs, t)
            } else {
                (PropertyMergeOutcome::Conflicting, y)
            };
            if let Some(value) = value {
                merged.push(PropertyValue::new(name, value));
            }
            outcomes.push((name.to_owned(), outcome));
        }
        PropertyMergeSummary { merged, outcomes }
    }

    pub fn has_conflicts(&self) -> bool {
        self.outcomes
            .iter()
            .any(|&(_, outcome)| outcome == PropertyMergeOutcome::Conflicting)
    }

    /// True once any property was changed identically on both sides.
    // TODO: decide whether this should require every changed property to be redundant
    pub fn is_redundant(&self) -> bool {
        let mut redundant = false;
        for &(_, outcome) in &self.outcomes {
            if outcome == PropertyMergeOutcome::Redundant {
                redundant = true;
            }
        }
        redundant
    }
}
