// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

use std::sync::Arc;
use std::time::Duration;

use regionserver::catalog::RegionInfo;
use regionserver::keys::{Column, RowKey};
use regionserver::lease::LeaseManager;
use regionserver::region::Region;
use regionserver::wal::Wal;
use tempfile::tempdir;

fn open_region(root: &std::path::Path) -> Arc<Region> {
    let wal = Arc::new(Wal::open(root.join("wal")).unwrap());
    let info = RegionInfo::new("t", Vec::new(), Vec::new(), 1, vec!["f".into()]);
    Arc::new(Region::open(info, root.to_path_buf(), wal, 0).unwrap())
}

#[test]
fn a_scanner_is_usable_until_its_lease_lapses_then_is_rejected() {
    let dir = tempdir().unwrap();
    let region = open_region(dir.path());
    let col = Column::new("f", "c");
    let lock = region.start_update(RowKey::from("row-1")).unwrap();
    region.put(lock, col.clone(), b"v".to_vec()).unwrap();
    region.commit(lock, 1).unwrap();

    let manager = LeaseManager::new(Duration::from_millis(20));
    let id = manager.open_scanner(region, vec![col], RowKey::from(""), None);

    let batch = manager.next(id, 10).unwrap();
    assert_eq!(batch.len(), 1);

    std::thread::sleep(Duration::from_millis(60));
    assert!(manager.next(id, 10).is_err());
}

#[test]
fn closing_a_scanner_makes_its_id_unusable() {
    let dir = tempdir().unwrap();
    let region = open_region(dir.path());
    let manager = LeaseManager::new(Duration::from_secs(60));
    let id = manager.open_scanner(region, Vec::new(), RowKey::from(""), None);
    manager.close(id).unwrap();
    assert!(manager.next(id, 10).is_err());
}
