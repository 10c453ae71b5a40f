// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! Per-range MVCC store: memcache + ordered on-disk files, plus the row
//! lock / commit / flush / compact / split machinery.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;

use crate::catalog::RegionInfo;
use crate::errors::{Error, Result};
use crate::keys::{CellKey, Column, RowKey, SeqId, Value};
use crate::metrics::{COMPACTION_COUNTER_VEC, FLUSH_COUNTER_VEC, FLUSH_DURATION_HISTOGRAM, SPLIT_COUNTER_VEC};
use crate::store::{store_dir, write_refs, FileReference, Store};
use crate::wal::{Wal, WalEntry};

/// `OPENING -> OPEN -> {SPLITTING, CLOSING} -> CLOSED`.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum RegionState {
    Opening,
    Open,
    Splitting,
    Closing,
    Closed,
}

struct PendingUpdate {
    row: RowKey,
    edits: Vec<(Column, Value)>,
}

/// A single pending update's row lock, held from `start_update` to
/// `commit`/`abort`. Locks never span more than one commit.
struct RowLocks {
    locked_rows: std::collections::HashSet<RowKey>,
    pending: BTreeMap<u64, PendingUpdate>,
    next_lock_id: u64,
}

impl RowLocks {
    fn new() -> RowLocks {
        RowLocks {
            locked_rows: std::collections::HashSet::new(),
            pending: BTreeMap::new(),
            next_lock_id: 1,
        }
    }
}

/// Per-range half-open key range `[start_key, end_key)` of one table, with
/// one store per column family.
pub struct Region {
    pub info: RwLock<RegionInfo>,
    pub state: Mutex<RegionState>,
    stores: RwLock<BTreeMap<String, Store>>,
    row_locks: Mutex<RowLocks>,
    row_unlocked: Condvar,
    min_seq: AtomicU64,
    max_seq: AtomicU64,
    wal: Arc<Wal>,
    root: PathBuf,
    last_flush_ms: AtomicU64,
}

impl Region {
    /// Opens a region: creates/opens its per-family stores, then replays
    /// the WAL tail past `min_seq` into memcache.
    pub fn open(info: RegionInfo, root: PathBuf, wal: Arc<Wal>, min_seq: SeqId) -> Result<Region> {
        // A restarted server rediscovers its true replay watermark from the
        // descriptor it persisted on a previous flush/close, rather than
        // trusting whatever floor the caller passed (typically 0).
        let min_seq = match crate::catalog::read_descriptor(&root, &info.table, info.region_id) {
            Ok(persisted) => min_seq.max(persisted.min_seq),
            Err(_) => min_seq,
        };
        crate::catalog::write_descriptor(&root, &info)?;
        let mut stores = BTreeMap::new();
        for family in &info.families {
            let dir = store_dir(&root, &info.table, info.region_id, family);
            stores.insert(family.clone(), Store::open(dir, family.clone())?);
        }
        let region = Region {
            info: RwLock::new(info.clone()),
            state: Mutex::new(RegionState::Opening),
            stores: RwLock::new(stores),
            row_locks: Mutex::new(RowLocks::new()),
            row_unlocked: Condvar::new(),
            min_seq: AtomicU64::new(min_seq),
            max_seq: AtomicU64::new(min_seq),
            wal,
            root,
            last_flush_ms: AtomicU64::new(0),
        };
        region.replay_wal()?;
        *region.state.lock() = RegionState::Open;
        Ok(region)
    }

    fn replay_wal(&self) -> Result<()> {
        let name = self.info.read().name();
        let entries = self.wal.replay(&name, self.min_seq.load(Ordering::SeqCst))?;
        let mut stores = self.stores.write();
        for entry in entries {
            if let Some(store) = stores.get_mut(&entry.family) {
                store.put(
                    CellKey {
                        row: entry.row_key(),
                        column: entry.column(),
                        timestamp: entry.timestamp,
                    },
                    entry.value,
                );
            }
            self.max_seq.fetch_max(entry.sequence_id, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn name(&self) -> String {
        self.info.read().name()
    }

    pub fn state(&self) -> RegionState {
        *self.state.lock()
    }

    fn require_readable(&self) -> Result<()> {
        match *self.state.lock() {
            RegionState::Open | RegionState::Closing => Ok(()),
            _ => Err(Error::NotServingRegion(self.name())),
        }
    }

    fn require_writable(&self) -> Result<()> {
        match *self.state.lock() {
            RegionState::Open => Ok(()),
            _ => Err(Error::NotServingRegion(self.name())),
        }
    }

    // ---- reads ----

    pub fn get(&self, row: &RowKey, column: &Column, ts: Option<u64>, n_versions: usize) -> Result<Vec<Vec<u8>>> {
        self.require_readable()?;
        let ts = ts.unwrap_or(u64::MAX);
        let stores = self.stores.read();
        let store = stores
            .get(&column.family)
            .ok_or_else(|| Error::NotServingRegion(self.name()))?;
        Ok(store.get(row, column, ts, n_versions.max(1)))
    }

    pub fn get_full(&self, row: &RowKey) -> Result<BTreeMap<Column, Vec<u8>>> {
        self.require_readable()?;
        let stores = self.stores.read();
        let mut out = BTreeMap::new();
        for store in stores.values() {
            out.extend(store.get_full_row(row));
        }
        Ok(out)
    }

    /// Builds a scan cursor over the given families (or all families if
    /// `columns` is empty), starting at `start_row`. The lease manager
    /// wraps this in a `ScannerCursor` with a renewable lease.
    pub fn scan_rows(&self, columns: &[Column], start_row: &RowKey, ts: Option<u64>) -> Result<Vec<RowKey>> {
        self.require_readable()?;
        let ts = ts.unwrap_or(u64::MAX);
        let stores = self.stores.read();
        let families: Vec<String> = if columns.is_empty() {
            stores.keys().cloned().collect()
        } else {
            let mut fams: Vec<String> = columns.iter().map(|c| c.family.clone()).collect();
            fams.sort();
            fams.dedup();
            fams
        };
        let mut rows = Vec::new();
        for family in families {
            if let Some(store) = stores.get(&family) {
                rows.extend(store.rows_from(start_row, ts));
            }
        }
        rows.sort();
        rows.dedup();
        Ok(rows)
    }

    pub fn scan_row(&self, columns: &[Column], row: &RowKey, ts: Option<u64>) -> Result<BTreeMap<Column, Vec<u8>>> {
        let ts = ts.unwrap_or(u64::MAX);
        let stores = self.stores.read();
        let mut out = BTreeMap::new();
        if columns.is_empty() {
            for store in stores.values() {
                for (col, val) in store.get_full_row(row) {
                    out.insert(col, val);
                }
            }
        } else {
            for column in columns {
                if let Some(store) = stores.get(&column.family) {
                    let vs = store.get(row, column, ts, 1);
                    if let Some(v) = vs.into_iter().next() {
                        out.insert(column.clone(), v);
                    }
                }
            }
        }
        Ok(out)
    }

    // ---- writes ----

    /// Acquires the row lock for `row`, returning a server-local lock id.
    /// Blocks the calling thread while another update holds the same row's
    /// lock.
    pub fn start_update(&self, row: RowKey) -> Result<u64> {
        self.require_writable()?;
        let mut locks = self.row_locks.lock();
        while locks.locked_rows.contains(&row) {
            self.row_unlocked.wait(&mut locks);
        }
        locks.locked_rows.insert(row.clone());
        let lock_id = locks.next_lock_id;
        locks.next_lock_id += 1;
        locks.pending.insert(lock_id, PendingUpdate { row, edits: Vec::new() });
        Ok(lock_id)
    }

    pub fn put(&self, lock_id: u64, column: Column, value: Vec<u8>) -> Result<()> {
        let mut locks = self.row_locks.lock();
        let update = locks.pending.get_mut(&lock_id).ok_or(Error::UnknownLock(lock_id))?;
        update.edits.push((column, Value::Put(value)));
        Ok(())
    }

    pub fn delete(&self, lock_id: u64, column: Column) -> Result<()> {
        let mut locks = self.row_locks.lock();
        let update = locks.pending.get_mut(&lock_id).ok_or(Error::UnknownLock(lock_id))?;
        update.edits.push((column, Value::Tombstone));
        Ok(())
    }

    /// Assigns a sequence id, appends all buffered edits to the WAL, then
    /// applies them to memcache under the store lock, then releases the
    /// row lock. Visible only after the memcache apply completes.
    pub fn commit(&self, lock_id: u64, timestamp: u64) -> Result<()> {
        let update = {
            let mut locks = self.row_locks.lock();
            locks.pending.remove(&lock_id).ok_or(Error::UnknownLock(lock_id))?
        };
        let release = || {
            self.row_locks.lock().locked_rows.remove(&update.row);
            self.row_unlocked.notify_all();
        };
        if update.edits.is_empty() {
            release();
            return Ok(());
        }

        let name = self.name();
        let seq = self.wal.next_sequence_id();
        let entries: Vec<WalEntry> = update
            .edits
            .iter()
            .map(|(column, value)| WalEntry {
                sequence_id: seq,
                region: name.clone(),
                row: update.row.as_bytes().to_vec(),
                family: column.family.clone(),
                qualifier: column.qualifier.clone(),
                timestamp,
                value: value.clone(),
            })
            .collect();

        if let Err(e) = self.wal.append(&entries) {
            release();
            return Err(e);
        }

        {
            let mut stores = self.stores.write();
            for (column, value) in update.edits {
                if let Some(store) = stores.get_mut(&column.family) {
                    store.put(
                        CellKey {
                            row: update.row.clone(),
                            column,
                            timestamp,
                        },
                        value,
                    );
                }
            }
        }
        self.max_seq.fetch_max(seq, Ordering::SeqCst);
        release();
        Ok(())
    }

    pub fn abort(&self, lock_id: u64) {
        let removed = {
            let mut locks = self.row_locks.lock();
            locks.pending.remove(&lock_id)
        };
        if let Some(update) = removed {
            self.row_locks.lock().locked_rows.remove(&update.row);
            self.row_unlocked.notify_all();
        }
    }

    /// `deleteAll(row, col, ts)`: a single-shot tombstone commit, bypassing
    /// the start/put/commit three-step for the common "delete everything
    /// at or before ts" case.
    pub fn delete_all(&self, row: &RowKey, column: &Column, timestamp: u64) -> Result<()> {
        let lock_id = self.start_update(row.clone())?;
        self.delete(lock_id, column.clone())?;
        self.commit(lock_id, timestamp)
    }

    pub fn close(&self, abort: bool) {
        let mut state = self.state.lock();
        *state = RegionState::Closed;
        if !abort {
            drop(state);
            self.persist_seq_bounds();
        }
    }

    // ---- flush / compact / split ----

    pub fn memcache_bytes(&self) -> u64 {
        self.stores.read().values().map(|s| s.memcache_bytes() as u64).sum()
    }

    pub fn last_flush_ms(&self) -> u64 {
        self.last_flush_ms.load(Ordering::SeqCst)
    }

    /// Snapshots every store's memcache, writes new store files, and
    /// records `flushSeqId = S_max` at snapshot time. Fatal
    /// `DroppedSnapshot` if a snapshot is taken but cannot be promoted.
    pub fn flush(&self, now_ms: u64) -> Result<()> {
        let flush_seq = self.max_seq.load(Ordering::SeqCst);
        let mut stores = self.stores.write();
        let mut flushed_any = false;
        for store in stores.values_mut() {
            match store.flush(flush_seq) {
                Ok(Some(_)) => flushed_any = true,
                Ok(None) => {}
                Err(e) => {
                    FLUSH_COUNTER_VEC.with_label_values(&["dropped_snapshot"]).inc();
                    return Err(Error::DroppedSnapshot(format!("{}: {}", self.name(), e)));
                }
            }
        }
        drop(stores);
        if flushed_any {
            self.min_seq.fetch_max(flush_seq, Ordering::SeqCst);
            let _ = self.wal.mark_flushed(&self.name(), flush_seq);
            self.last_flush_ms.store(now_ms, Ordering::SeqCst);
            self.persist_seq_bounds();
            FLUSH_COUNTER_VEC.with_label_values(&["ok"]).inc();
        }
        Ok(())
    }

    /// Records the current min/max sequence ids in the on-disk descriptor
    /// so a later reopen can resume WAL replay from this point instead of
    /// from the beginning. Best-effort: a failure here just costs a future
    /// reopen a longer replay, not correctness.
    fn persist_seq_bounds(&self) {
        let mut info = self.info.write();
        info.min_seq = self.min_seq.load(Ordering::SeqCst);
        info.max_seq = self.max_seq.load(Ordering::SeqCst);
        let _ = crate::catalog::write_descriptor(&self.root, &info);
    }

    pub fn flush_timed(&self, now_ms: u64) -> Result<()> {
        let start = std::time::Instant::now();
        let result = self.flush(now_ms);
        let label = if result.is_ok() { "ok" } else { "err" };
        FLUSH_DURATION_HISTOGRAM
            .with_label_values(&[label])
            .observe(start.elapsed().as_secs_f64());
        result
    }

    pub fn needs_compaction(&self, batch_size: usize) -> bool {
        self.stores.read().values().any(|s| s.file_count() > batch_size)
    }

    pub fn compact(&self, batch_size: usize, max_versions: usize, ttl_ms: u64, now_ms: u64) -> Result<()> {
        let mut stores = self.stores.write();
        let mut any = false;
        for store in stores.values_mut() {
            match store.compact(batch_size, max_versions, ttl_ms, now_ms) {
                Ok(did) => any |= did,
                Err(e) => {
                    COMPACTION_COUNTER_VEC.with_label_values(&["err"]).inc();
                    return Err(e);
                }
            }
        }
        if any {
            COMPACTION_COUNTER_VEC.with_label_values(&["ok"]).inc();
        }
        Ok(())
    }

    pub fn largest_store_size(&self) -> u64 {
        self.stores
            .read()
            .values()
            .map(|s| s.approximate_size())
            .max()
            .unwrap_or(0)
    }

    /// The middle row across every store, used by the split-or-compact
    /// chore to pick `midKey`.
    pub fn approximate_mid_key(&self) -> Option<RowKey> {
        let stores = self.stores.read();
        let mut rows: Vec<RowKey> = Vec::new();
        for store in stores.values() {
            rows.extend(store.rows_from(&RowKey::new(Vec::new()), u64::MAX));
        }
        rows.sort();
        rows.dedup();
        rows.get(rows.len() / 2).cloned()
    }

    /// Stops new writers, flushes to empty memcache, closes stores, and
    /// returns two child region descriptors whose stores hold file
    /// references into the parent.
    pub fn close_and_split(&self, mid_key: &RowKey, now_ms: u64) -> Result<(RegionInfo, RegionInfo)> {
        {
            let mut state = self.state.lock();
            if *state != RegionState::Open {
                return Err(Error::NotServingRegion(self.name()));
            }
            *state = RegionState::Splitting;
        }
        self.flush(now_ms)?;

        let parent = self.info.read().clone();
        let mut left = RegionInfo::new(
            parent.table.clone(),
            parent.start_key.clone(),
            mid_key.as_bytes().to_vec(),
            parent.region_id * 2,
            parent.families.clone(),
        );
        let mut right = RegionInfo::new(
            parent.table.clone(),
            mid_key.as_bytes().to_vec(),
            parent.end_key.clone(),
            parent.region_id * 2 + 1,
            parent.families.clone(),
        );
        left.offline = false;
        right.offline = false;

        {
            let stores = self.stores.read();
            for (family, store) in stores.iter() {
                let mut left_refs = Vec::new();
                let mut right_refs = Vec::new();
                for path in store.file_paths() {
                    left_refs.push(FileReference {
                        path: path.clone(),
                        lower_bound: None,
                        upper_bound: Some(mid_key.as_bytes().to_vec()),
                    });
                    right_refs.push(FileReference {
                        path,
                        lower_bound: Some(mid_key.as_bytes().to_vec()),
                        upper_bound: None,
                    });
                }
                write_refs(&store_dir(&self.root, &parent.table, left.region_id, family), &left_refs)?;
                write_refs(&store_dir(&self.root, &parent.table, right.region_id, family), &right_refs)?;
            }
        }

        {
            let mut info = self.info.write();
            info.offline = true;
            info.split = true;
        }
        *self.state.lock() = RegionState::Closed;
        SPLIT_COUNTER_VEC.with_label_values(&["ok"]).inc();
        Ok((left, right))
    }

    pub fn root_dir(&self) -> &PathBuf {
        &self.root
    }

    pub fn wal_handle(&self) -> Arc<Wal> {
        Arc::clone(&self.wal)
    }
}

/// Generates a fresh 64-bit scanner id; collision probability is treated as
/// zero.
pub fn random_scanner_id() -> u64 {
    rand::thread_rng().gen()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_region(dir: &std::path::Path, table: &str, start: &[u8], end: &[u8]) -> Region {
        let wal = Arc::new(Wal::open(dir.join("wal")).unwrap());
        let info = RegionInfo::new(table, start.to_vec(), end.to_vec(), 1, vec!["f".into()]);
        Region::open(info, dir.to_path_buf(), wal, 0).unwrap()
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempdir().unwrap();
        let region = open_region(dir.path(), "t", b"a", b"z");
        let row = RowKey::from("k1");
        let col = Column::new("f", "c");

        let lock = region.start_update(row.clone()).unwrap();
        region.put(lock, col.clone(), b"v1".to_vec()).unwrap();
        region.commit(lock, 100).unwrap();

        let values = region.get(&row, &col, Some(100), 1).unwrap();
        assert_eq!(values, vec![b"v1".to_vec()]);
    }

    #[test]
    fn versioning_returns_newest_first_capped_at_n() {
        let dir = tempdir().unwrap();
        let region = open_region(dir.path(), "t", b"a", b"z");
        let row = RowKey::from("k1");
        let col = Column::new("f", "c");

        for (ts, val) in [(1u64, "a"), (2, "b"), (3, "c")] {
            let lock = region.start_update(row.clone()).unwrap();
            region.put(lock, col.clone(), val.as_bytes().to_vec()).unwrap();
            region.commit(lock, ts).unwrap();
        }

        assert_eq!(
            region.get(&row, &col, Some(3), 2).unwrap(),
            vec![b"c".to_vec(), b"b".to_vec()]
        );
        assert_eq!(
            region.get(&row, &col, Some(2), 5).unwrap(),
            vec![b"b".to_vec(), b"a".to_vec()]
        );
    }

    #[test]
    fn delete_all_tombstones_shadow_same_timestamp_write() {
        let dir = tempdir().unwrap();
        let region = open_region(dir.path(), "t", b"a", b"z");
        let row = RowKey::from("k1");
        let col = Column::new("f", "c");

        let lock = region.start_update(row.clone()).unwrap();
        region.put(lock, col.clone(), b"v".to_vec()).unwrap();
        region.commit(lock, 10).unwrap();

        region.delete_all(&row, &col, 10).unwrap();

        assert!(region.get(&row, &col, Some(10), 1).unwrap().is_empty());
    }

    #[test]
    fn commit_is_visible_to_a_subsequent_get_on_the_same_server() {
        let dir = tempdir().unwrap();
        let region = open_region(dir.path(), "t", b"a", b"z");
        let row = RowKey::from("k1");
        let col = Column::new("f", "c");
        let lock = region.start_update(row.clone()).unwrap();
        region.put(lock, col.clone(), b"v1".to_vec()).unwrap();
        region.commit(lock, 100).unwrap();
        assert_eq!(region.get(&row, &col, Some(100), 1).unwrap(), vec![b"v1".to_vec()]);
    }

    #[test]
    fn flush_then_replay_from_flush_point_is_a_no_op() {
        let dir = tempdir().unwrap();
        let region = open_region(dir.path(), "t", b"a", b"z");
        let row = RowKey::from("k1");
        let col = Column::new("f", "c");
        let lock = region.start_update(row.clone()).unwrap();
        region.put(lock, col, b"v1".to_vec()).unwrap();
        region.commit(lock, 100).unwrap();
        region.flush(0).unwrap();

        let replayed = region.wal_handle().replay(&region.name(), region.min_seq.load(Ordering::SeqCst)).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn split_marks_parent_offline_and_splits_range_at_mid_key() {
        let dir = tempdir().unwrap();
        let region = open_region(dir.path(), "t", b"a", b"z");
        let mid = RowKey::from("m");
        let (left, right) = region.close_and_split(&mid, 0).unwrap();

        assert_eq!(left.start_key, b"a".to_vec());
        assert_eq!(left.end_key, b"m".to_vec());
        assert_eq!(right.start_key, b"m".to_vec());
        assert_eq!(right.end_key, b"z".to_vec());

        let info = region.info.read();
        assert!(info.offline);
        assert!(info.split);
        assert_eq!(region.state(), RegionState::Closed);
    }

    #[test]
    fn split_children_together_see_every_parent_cell_via_file_references() {
        let dir = tempdir().unwrap();
        let region = open_region(dir.path(), "t", b"a", b"z");
        let col = Column::new("f", "c");
        let rows = ["b", "h", "m", "s", "y"];
        for row in rows {
            let lock = region.start_update(RowKey::from(row)).unwrap();
            region.put(lock, col.clone(), row.as_bytes().to_vec()).unwrap();
            region.commit(lock, 1).unwrap();
        }

        let mid = RowKey::from("m");
        let (left_info, right_info) = region.close_and_split(&mid, 0).unwrap();

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

    #[test]
    fn reopen_resumes_from_the_persisted_watermark_not_the_callers_floor() {
        let dir = tempdir().unwrap();
        let region = open_region(dir.path(), "t", b"a", b"z");
        let col = Column::new("f", "c");

        let lock = region.start_update(RowKey::from("a")).unwrap();
        region.put(lock, col.clone(), b"v1".to_vec()).unwrap();
        region.commit(lock, 1).unwrap();
        region.flush(0).unwrap();
        let flushed_min_seq = region.min_seq.load(Ordering::SeqCst);
        assert!(flushed_min_seq > 0);

        let lock = region.start_update(RowKey::from("b")).unwrap();
        region.put(lock, col, b"v2".to_vec()).unwrap();
        region.commit(lock, 2).unwrap();
        region.close(false);

        let wal = region.wal_handle();
        let info = RegionInfo::new("t", b"a".to_vec(), b"z".to_vec(), 1, vec!["f".into()]);
        let reopened = Region::open(info, dir.path().to_path_buf(), wal, 0).unwrap();
        assert_eq!(reopened.min_seq.load(Ordering::SeqCst), flushed_min_seq);
    }

    #[test]
    fn unknown_lock_id_is_rejected() {
        let dir = tempdir().unwrap();
        let region = open_region(dir.path(), "t", b"a", b"z");
        let col = Column::new("f", "c");
        let err = region.put(999, col, b"v".to_vec()).unwrap_err();
        assert!(matches!(err, Error::UnknownLock(999)));
    }
}
