// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use regionserver::catalog::RegionInfo;
use regionserver::keys::{Column, RowKey};
use regionserver::region::Region;
use regionserver::wal::Wal;
use tempfile::tempdir;

#[test]
fn splitting_a_region_produces_two_adjacent_children_covering_the_parent_range() {
    let dir = tempdir().unwrap();
    let wal = Arc::new(Wal::open(dir.path().join("wal")).unwrap());
    let info = RegionInfo::new("t", b"a".to_vec(), b"z".to_vec(), 1, vec!["f".into()]);
    let region = Region::open(info, dir.path().to_path_buf(), wal, 0).unwrap();

    let col = Column::new("f", "c");
    for row in ["b", "h", "m", "s", "y"] {
        let lock = region.start_update(RowKey::from(row)).unwrap();
        region.put(lock, col.clone(), b"v".to_vec()).unwrap();
        region.commit(lock, 1).unwrap();
    }

    let mid = region.approximate_mid_key().unwrap();
    let (left, right) = region.close_and_split(&mid, 100).unwrap();

    assert_eq!(left.start_key, b"a".to_vec());
    assert_eq!(left.end_key, mid.as_bytes());
    assert_eq!(right.start_key, mid.as_bytes());
    assert_eq!(right.end_key, b"z".to_vec());
    assert_eq!(left.end_key, right.start_key);

    // the parent is already closed; a second split attempt must fail cleanly
    assert!(region.close_and_split(&mid, 101).is_err());
}

#[test]
fn scanning_both_children_yields_the_same_cells_as_the_parent() {
    let dir = tempdir().unwrap();
    let wal = Arc::new(Wal::open(dir.path().join("wal")).unwrap());
    let info = RegionInfo::new("t", b"a".to_vec(), b"z".to_vec(), 1, vec!["f".into()]);
    let region = Region::open(info, dir.path().to_path_buf(), wal, 0).unwrap();

    let col = Column::new("f", "c");
    let rows = ["b", "h", "m", "s", "y"];
    for row in rows {
        let lock = region.start_update(RowKey::from(row)).unwrap();
        region.put(lock, col.clone(), row.as_bytes().to_vec()).unwrap();
        region.commit(lock, 1).unwrap();
    }

    let mid = region.approximate_mid_key().unwrap();
    let (left_info, right_info) = region.close_and_split(&mid, 100).unwrap();

    let wal = region.wal_handle();
    let left = Region::open(left_info, dir.path().to_path_buf(), Arc::clone(&wal), 0).unwrap();
    let right = Region::open(right_info, dir.path().to_path_buf(), wal, 0).unwrap();

    let mut seen: Vec<Vec<u8>> = Vec::new();
    for child in [&left, &right] {
        for row in child.scan_rows(&[], &RowKey::new(Vec::<u8>::new()), None).unwrap() {
            if let Some(value) = child.get(&row, &col, None, 1).unwrap().into_iter().next() {
                seen.push(value);
            }
        }
    }
    seen.sort();
    let mut expected: Vec<Vec<u8>> = rows.iter().map(|r| r.as_bytes().to_vec()).collect();
    expected.sort();
    assert_eq!(seen, expected);
}
