// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use regionserver::catalog::RegionInfo;
use regionserver::keys::{Column, RowKey};
use regionserver::region::Region;
use regionserver::wal::Wal;
use tempfile::tempdir;

fn open_region(root: &std::path::Path, name: &str) -> Arc<Region> {
    let wal = Arc::new(Wal::open(root.join("wal")).unwrap());
    let info = RegionInfo::new(name, Vec::new(), Vec::new(), 1, vec!["f".into()]);
    Arc::new(Region::open(info, root.to_path_buf(), wal, 0).unwrap())
}

#[test]
fn writes_are_visible_after_commit_and_survive_a_flush() {
    let dir = tempdir().unwrap();
    let region = open_region(dir.path(), "t");
    let col = Column::new("f", "c");

    let lock = region.start_update(RowKey::from("row-1")).unwrap();
    region.put(lock, col.clone(), b"v1".to_vec()).unwrap();
    region.commit(lock, 10).unwrap();

    let got = region.get(&RowKey::from("row-1"), &col, None, 1).unwrap();
    assert_eq!(got, vec![b"v1".to_vec()]);

    region.flush(100).unwrap();
    let got_after_flush = region.get(&RowKey::from("row-1"), &col, None, 1).unwrap();
    assert_eq!(got_after_flush, vec![b"v1".to_vec()]);
}

#[test]
fn multiple_versions_come_back_newest_first_and_respect_n_versions() {
    let dir = tempdir().unwrap();
    let region = open_region(dir.path(), "t");
    let col = Column::new("f", "c");

    for (value, ts) in [(b"v1".to_vec(), 1u64), (b"v2".to_vec(), 2), (b"v3".to_vec(), 3)] {
        let lock = region.start_update(RowKey::from("row-1")).unwrap();
        region.put(lock, col.clone(), value).unwrap();
        region.commit(lock, ts).unwrap();
    }

    let got = region.get(&RowKey::from("row-1"), &col, None, 2).unwrap();
    assert_eq!(got, vec![b"v3".to_vec(), b"v2".to_vec()]);
}

#[test]
fn a_deleted_cell_is_shadowed_by_its_tombstone() {
    let dir = tempdir().unwrap();
    let region = open_region(dir.path(), "t");
    let col = Column::new("f", "c");

    let lock = region.start_update(RowKey::from("row-1")).unwrap();
    region.put(lock, col.clone(), b"v1".to_vec()).unwrap();
    region.commit(lock, 1).unwrap();

    region.delete_all(&RowKey::from("row-1"), &col, 2).unwrap();

    let got = region.get(&RowKey::from("row-1"), &col, None, 5).unwrap();
    assert!(got.is_empty());
}

#[test]
fn replaying_the_wal_into_a_freshly_opened_region_restores_uncommitted_flush_state() {
    let dir = tempdir().unwrap();
    let wal = Arc::new(Wal::open(dir.path().join("wal")).unwrap());
    let info = RegionInfo::new("t", Vec::new(), Vec::new(), 1, vec!["f".into()]);
    let col = Column::new("f", "c");

    {
        let region = Region::open(info.clone(), dir.path().to_path_buf(), Arc::clone(&wal), 0).unwrap();
        let lock = region.start_update(RowKey::from("row-1")).unwrap();
        region.put(lock, col.clone(), b"v1".to_vec()).unwrap();
        region.commit(lock, 1).unwrap();
        // no flush: the write only exists in the WAL and the in-memory store
    }

    let reopened = Region::open(info, dir.path().to_path_buf(), wal, 0).unwrap();
    let got = reopened.get(&RowKey::from("row-1"), &col, None, 1).unwrap();
    assert_eq!(got, vec![b"v1".to_vec()]);
}
