// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use regionserver::catalog::{self, RegionInfo};
use regionserver::keys::{Column, RowKey};
use regionserver::merge::{OfflineMerger, OnlineMerger};
use regionserver::region::Region;
use regionserver::wal::Wal;
use tempfile::tempdir;

fn region_with_rows(root: &std::path::Path, start: &[u8], end: &[u8], id: u64, rows: &[&str]) -> RegionInfo {
    let wal = Arc::new(Wal::open(root.join(format!("wal-{}", id))).unwrap());
    let info = RegionInfo::new("orders", start.to_vec(), end.to_vec(), id, vec!["f".into()]);
    let region = Region::open(info.clone(), root.to_path_buf(), wal, 0).unwrap();
    let col = Column::new("f", "c");
    for row in rows {
        let lock = region.start_update(RowKey::from(*row)).unwrap();
        region.put(lock, col.clone(), row.as_bytes().to_vec()).unwrap();
        region.commit(lock, 1).unwrap();
    }
    region.flush(1).unwrap();
    info
}

fn open_catalog(root: &std::path::Path) -> Region {
    let wal = Arc::new(Wal::open(root.join("wal-catalog")).unwrap());
    let info = RegionInfo::new(catalog::META_TABLE, Vec::new(), Vec::new(), 0, vec!["info".into()]);
    Region::open(info, root.to_path_buf(), wal, 0).unwrap()
}

#[test]
fn offline_merge_of_a_disabled_table_yields_one_region_spanning_both_ranges() {
    let dir = tempdir().unwrap();
    let catalog = open_catalog(dir.path());
    let left = region_with_rows(dir.path(), b"a", b"m", 1, &["b", "c"]);
    let right = region_with_rows(dir.path(), b"m", b"z", 2, &["n", "o"]);

    let merged = OfflineMerger::merge(dir.path(), &left, &right, true, &catalog, "server-1", 1, 1).unwrap();
    assert_eq!(merged.table, "orders");
    assert_eq!(merged.start_key, b"a".to_vec());
    assert_eq!(merged.end_key, b"z".to_vec());
}

#[test]
fn offline_merge_refuses_regions_of_an_enabled_table() {
    let dir = tempdir().unwrap();
    let catalog = open_catalog(dir.path());
    let left = region_with_rows(dir.path(), b"a", b"m", 1, &["b"]);
    let right = region_with_rows(dir.path(), b"m", b"z", 2, &["n"]);

    assert!(OfflineMerger::merge(dir.path(), &left, &right, false, &catalog, "server-1", 1, 1).is_err());
}

#[test]
fn online_merge_does_not_require_a_disabled_table_but_still_checks_adjacency() {
    let dir = tempdir().unwrap();
    let catalog = open_catalog(dir.path());
    let left = region_with_rows(dir.path(), b"a", b"m", 1, &["b"]);
    let non_adjacent = region_with_rows(dir.path(), b"p", b"z", 2, &["q"]);

    assert!(OnlineMerger::merge(dir.path(), &left, &non_adjacent, &catalog, "server-1", 1, 1).is_err());

    let right = region_with_rows(dir.path(), b"m", b"z", 3, &["n"]);
    assert!(OnlineMerger::merge(dir.path(), &left, &right, &catalog, "server-1", 1, 2).is_ok());
}
