use crate::state::{ChangeType, ItemType, PropertyValue};
use crate::util::FnvHashSet;

/// A planned effect on disk, as returned by the server.
#[derive(Clone, Debug, PartialEq)]
pub struct GetOperation {
    pub target_server_item: Option<String>,
    pub source_server_item: Option<String>,
    pub target_local_item: Option<String>,
    pub source_local_item: Option<String>,
    pub version_local: i32,
    pub version_server: i32,
    pub change_type: ChangeType,
    pub item_type: ItemType,
    pub item_id: i32,
    pub properties: Vec<PropertyValue>,
    pub okay_to_overwrite_existing_local: bool,
}

impl GetOperation {
    pub fn new(item_id: i32, item_type: ItemType) -> Self {
        GetOperation {
            target_server_item: None,
            source_server_item: None,
            target_local_item: None,
            source_local_item: None,
            version_local: 0,
            version_server: 0,
            change_type: ChangeType::empty(),
            item_type,
            item_id,
            properties: Vec::new(),
            okay_to_overwrite_existing_local: false,
        }
    }

    /// The local path this operation writes to or removes.
    pub fn affected_local_item(&self) -> Option<&str> {
        self.target_local_item
            .as_deref()
            .or_else(|| self.source_local_item.as_deref())
    }

    /// The server item the operation acts on, preferring the source of a move.
    pub fn acting_server_item(&self) -> Option<&str> {
        self.source_server_item
            .as_deref()
            .or_else(|| self.target_server_item.as_deref())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessType {
    Get,
    Undo,
}

fn path_key(path: &str) -> String {
    path.trim_end_matches(|c: char| c == '/' || c == '\\').to_owned()
}

/// Operations that can run together: no two of them touch the same local path.
#[derive(Clone, Debug, Default)]
pub struct GetOperationGroup {
    get_ops: Vec<GetOperation>,
    undo_ops: Vec<GetOperation>,
    local_items: FnvHashSet<String>,
}

impl GetOperationGroup {
    pub fn has_op_for_local_item(&self, local_item: &str) -> bool {
        self.local_items.contains(&path_key(local_item))
    }

    fn collides(&self, operation: &GetOperation) -> bool {
        operation
            .affected_local_item()
            .map_or(false, |local| self.has_op_for_local_item(local))
    }

    fn push(&mut self, process: ProcessType, operation: GetOperation) {
        if let Some(local) = operation.affected_local_item() {
            self.local_items.insert(path_key(local));
        }
        match process {
            ProcessType::Get => self.get_ops.push(operation),
            ProcessType::Undo => self.undo_ops.push(operation),
        }
    }

    pub fn get_ops(&self) -> &[GetOperation] {
        &self.get_ops
    }

    pub fn undo_ops(&self) -> &[GetOperation] {
        &self.undo_ops
    }

    pub fn len(&self) -> usize {
        self.get_ops.len() + self.undo_ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn operations(&self) -> impl Iterator<Item = (ProcessType, &GetOperation)> {
        self.get_ops
            .iter()
            .map(|op| (ProcessType::Get, op))
            .chain(self.undo_ops.iter().map(|op| (ProcessType::Undo, op)))
    }
}

/// Splits the operations of successive conflicts into collision-free groups.
///
/// A conflict's operations join the most recent group unless one of them touches a path
/// that group already touches. Conflicts involving a folder always get a group of their
/// own, so the conflict after one starts a new group as well.
#[derive(Debug, Default)]
pub struct GroupBuilder {
    groups: Vec<GetOperationGroup>,
    isolate_next: bool,
}

impl GroupBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_conflict_operations(&mut self, get_ops: Vec<GetOperation>, undo_ops: Vec<GetOperation>) {
        if get_ops.is_empty() && undo_ops.is_empty() {
            return;
        }
        let touches_folder = get_ops
            .iter()
            .chain(undo_ops.iter())
            .any(|op| op.item_type == ItemType::Folder);

        let need_new_group = match self.groups.last() {
            None => true,
            Some(current) => {
                touches_folder
                    || self.isolate_next
                    || get_ops.iter().chain(undo_ops.iter()).any(|op| current.collides(op))
            }
        };
        if need_new_group {
            self.groups.push(GetOperationGroup::default());
        }

        let operations = get_ops
            .into_iter()
            .map(|op| (ProcessType::Get, op))
            .chain(undo_ops.into_iter().map(|op| (ProcessType::Undo, op)));
        for (process, operation) in operations {
            if self.groups.last().map_or(true, |current| current.collides(&operation)) {
                trace!("Operation on {:?} starts a new group", operation.affected_local_item());
                self.groups.push(GetOperationGroup::default());
            }
            if let Some(current) = self.groups.last_mut() {
                current.push(process, operation);
            }
        }
        self.isolate_next = touches_folder;
    }

    pub fn groups(&self) -> &[GetOperationGroup] {
        &self.groups
    }

    pub fn finish(self) -> Vec<GetOperationGroup> {
        self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_op(local: &str) -> GetOperation {
        let mut op = GetOperation::new(1, ItemType::File);
        op.target_local_item = Some(local.to_owned());
        op
    }

    #[test]
    fn same_path_goes_to_a_new_group() {
        let mut builder = GroupBuilder::new();
        builder.add_conflict_operations(vec![file_op("/w/a")], vec![]);
        builder.add_conflict_operations(vec![file_op("/w/b")], vec![]);
        builder.add_conflict_operations(vec![], vec![file_op("/w/a")]);
        let groups = builder.finish();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].undo_ops().len(), 1);
    }

    #[test]
    fn colliding_operations_of_one_conflict_are_split() {
        let mut builder = GroupBuilder::new();
        builder.add_conflict_operations(vec![file_op("/w/a")], vec![file_op("/w/a")]);
        assert_eq!(builder.groups().len(), 2);
    }
}
