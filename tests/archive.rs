extern crate tidewater;

mod common;

use std::fs;
use std::sync::Arc;

use uuid::Uuid;

use tidewater::archive::{Archive, LocalStateStore};
use tidewater::state::{ChangeType, Encoding, LocalTables, LocalVersionRow, PendingChangeRow, PropertyValue};
use tidewater::util::md5_bytes;
use tidewater::workspace::WorkspaceLock;
use tidewater::SyncError;

fn row(server_item: &str, version: i32) -> LocalVersionRow {
    LocalVersionRow {
        server_item: server_item.to_owned(),
        version,
        local_item: Some(format!("/w/{}", version)),
        item_id: 3,
        hash: Some(md5_bytes(b"content")),
        encoding: Encoding::UTF8,
        baseline_id: Some(Uuid::new_v4()),
        pending_reconcile: true,
        length: Some(7),
        checkin_date: Some(1_600_000_000_000),
        last_modified: None,
        properties: vec![PropertyValue::new("owner", "ops")],
        deleted: false,
    }
}

fn archive() -> (tempfile::TempDir, Archive) {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let archive = Archive::new(dir.path().join("state")).unwrap();
    (dir, archive)
}

#[test]
fn test_missing_archive_is_empty() {
    let (_dir, archive) = archive();
    let tables = archive.load().unwrap();
    assert!(tables.versions.is_empty());
    assert!(tables.pending.is_empty());
}

#[test]
fn test_tables_survive_a_reopen() {
    let (dir, archive) = archive();
    let mut tables = LocalTables::default();
    let saved = row("$/p/a.txt", 4);
    tables.versions.add(saved.clone());
    tables.versions.add(row("$/p/gone.txt", 2));
    tables.versions.remove_for_reconcile("$/p/gone.txt", true);
    tables.pending.add(PendingChangeRow {
        target_server_item: "$/p/b.txt".to_owned(),
        committed_server_item: Some("$/p/old-b.txt".to_owned()),
        item_id: 5,
        version: 2,
        change_type: ChangeType::RENAME | ChangeType::EDIT,
        encoding: Encoding::BINARY,
    });
    archive.save(&tables).unwrap();

    let reopened = Archive::new(dir.path().join("state")).unwrap();
    let loaded = reopened.load().unwrap();
    assert_eq!(loaded.versions.get_by_server_item("$/P/A.TXT", true), Some(&saved));
    let pending = loaded.pending.get_by_target_server_item("$/p/b.txt").unwrap();
    assert_eq!(pending.committed_server_item.as_deref(), Some("$/p/old-b.txt"));
    let tombstone = loaded.versions.get_removed("$/p/gone.txt", true).unwrap();
    assert!(tombstone.pending_reconcile && tombstone.local_item.is_none());
}

#[test]
fn test_outdated_archive_starts_empty() {
    let (_dir, archive) = archive();
    fs::write(archive.tables_file(), [3u8, 0, 0, 0, 1, 2, 3]).unwrap();
    assert!(archive.load().unwrap().versions.is_empty());
}

#[test]
fn test_truncated_archive_is_an_error() {
    let (_dir, archive) = archive();
    fs::write(archive.tables_file(), [4u8, 0, 0, 0, 9]).unwrap();
    match archive.load() {
        Err(SyncError::ArchiveReadError(_)) => {}
        other => panic!("expected a read error, got {:?}", other),
    }
}

#[test]
fn test_failed_transaction_saves_nothing() {
    let (_dir, archive) = archive();
    let lock = WorkspaceLock::new(Arc::new(archive));

    let result: Result<(), SyncError> = lock.transact(|tables| {
        tables.versions.add(row("$/p/a.txt", 1));
        Err(SyncError::invariant("abandoned"))
    });
    assert!(result.is_err());
    assert!(lock.read(|tables| Ok(tables.versions.is_empty())).unwrap());

    let count = lock
        .transact(|tables| {
            tables.versions.add(row("$/p/a.txt", 1));
            tables.versions.add(row("$/p/a.txt", 0));
            Ok(tables.versions.len())
        })
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(lock.read(|tables| Ok(tables.versions.len())).unwrap(), 2);
}
