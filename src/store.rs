// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! A store: the memcache plus the ordered list of immutable on-disk files
//! for one column family within one region.
//!
//! Store files are represented as a sorted run of cells read fully into
//! memory on open. This keeps the merge-iterator logic the same shape as a
//! real LSM engine's file iterators, ordered by (row asc, col asc, ts desc),
//! without pulling in an embedded-engine dependency unavailable to this
//! workspace; see DESIGN.md.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_derive::{Deserialize, Serialize};

use crate::errors::Result;
use crate::keys::{Cell, CellKey, Column, RowKey, SeqId, Value};

/// In-memory ordered buffer of recent mutations for one store.
#[derive(Default)]
pub struct MemCache {
    map: BTreeMap<CellKey, Value>,
    bytes: usize,
}

impl MemCache {
    pub fn new() -> MemCache {
        MemCache::default()
    }

    pub fn put(&mut self, key: CellKey, value: Value) {
        let added = key.row.as_bytes().len()
            + key.column.family.len()
            + key.column.qualifier.len()
            + 8
            + match &value {
                Value::Put(v) => v.len(),
                Value::Tombstone => 0,
            };
        if let Some(old) = self.map.insert(key, value) {
            self.bytes = self.bytes.saturating_sub(match old {
                Value::Put(v) => v.len(),
                Value::Tombstone => 0,
            });
        }
        self.bytes += added;
    }

    pub fn approximate_bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CellKey, &Value)> {
        self.map.iter()
    }

    /// Swaps in an empty memcache, returning the previous contents. Used by
    /// `flush`: the swap happens under the store lock so readers never
    /// observe a torn snapshot.
    pub fn swap_empty(&mut self) -> MemCache {
        std::mem::take(self)
    }

    pub fn into_cells(self) -> Vec<Cell> {
        self.map
            .into_iter()
            .map(|(key, value)| Cell { key, value })
            .collect()
    }
}

/// An immutable on-disk sorted run of cells for one store.
pub struct StoreFile {
    pub id: u64,
    pub path: PathBuf,
    pub flush_seq_id: SeqId,
    /// `true` for a file this store wrote itself (safe to delete once
    /// compacted away); `false` for a reference into a parent's file left
    /// behind by a split, which a sibling child may also still be reading.
    pub owned: bool,
    cells: Vec<Cell>,
}

impl StoreFile {
    fn write_new(path: PathBuf, id: u64, flush_seq_id: SeqId, mut cells: Vec<Cell>) -> Result<StoreFile> {
        cells.sort_by(|a, b| a.key.cmp(&b.key));
        let encoded: Vec<(CellKey, Value)> =
            cells.iter().map(|c| (c.key.clone(), c.value.clone())).collect();
        let bytes = bincode::serialize(&(flush_seq_id, &encoded))?;
        fs::write(&path, bytes)?;
        Ok(StoreFile {
            id,
            path,
            flush_seq_id,
            owned: true,
            cells,
        })
    }

    pub fn open(path: PathBuf, id: u64) -> Result<StoreFile> {
        let data = fs::read(&path)?;
        let (flush_seq_id, encoded): (SeqId, Vec<(CellKey, Value)>) = bincode::deserialize(&data)?;
        let cells = encoded
            .into_iter()
            .map(|(key, value)| Cell { key, value })
            .collect();
        Ok(StoreFile {
            id,
            path,
            flush_seq_id,
            owned: true,
            cells,
        })
    }

    /// Opens a file this store does not own — a parent's file left behind
    /// by a split — keeping only the cells `reference`'s bounds admit.
    pub fn open_reference(reference: &FileReference, id: u64) -> Result<StoreFile> {
        let data = fs::read(&reference.path)?;
        let (flush_seq_id, encoded): (SeqId, Vec<(CellKey, Value)>) = bincode::deserialize(&data)?;
        let cells = encoded
            .into_iter()
            .map(|(key, value)| Cell { key, value })
            .filter(|c| reference.matches(c.row().as_bytes()))
            .collect();
        Ok(StoreFile {
            id,
            path: reference.path.clone(),
            flush_seq_id,
            owned: false,
            cells,
        })
    }

    pub fn approximate_bytes(&self) -> usize {
        self.cells
            .iter()
            .map(|c| match &c.value {
                Value::Put(v) => v.len() + 24,
                Value::Tombstone => 24,
            })
            .sum()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }
}

/// All cells in one column family within one region: memcache plus the
/// ordered (newest-first) list of store files.
pub struct Store {
    pub family: String,
    dir: PathBuf,
    memcache: MemCache,
    files: Vec<StoreFile>,
    next_file_id: AtomicU64,
    /// References into a parent's store files, carried over from a split
    /// until compaction materializes them into this store's own files.
    refs: Vec<FileReference>,
}

impl Store {
    pub fn open(dir: PathBuf, family: impl Into<String>) -> Result<Store> {
        fs::create_dir_all(&dir)?;
        let mut files = Vec::new();
        let mut max_id = 0u64;
        if dir.exists() {
            let mut entries: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().map(|e| e == "sf").unwrap_or(false))
                .collect();
            entries.sort();
            for path in entries {
                let id: u64 = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                max_id = max_id.max(id);
                files.push(StoreFile::open(path, id)?);
            }
            // newest first: higher id was created later
            files.sort_by(|a, b| b.id.cmp(&a.id));
        }

        let refs = read_refs(&dir)?;
        for reference in &refs {
            max_id += 1;
            files.push(StoreFile::open_reference(reference, max_id)?);
        }

        Ok(Store {
            family: family.into(),
            dir,
            memcache: MemCache::new(),
            files,
            next_file_id: AtomicU64::new(max_id + 1),
            refs,
        })
    }

    pub fn put(&mut self, key: CellKey, value: Value) {
        self.memcache.put(key, value);
    }

    pub fn memcache_bytes(&self) -> usize {
        self.memcache.approximate_bytes()
    }

    pub fn approximate_size(&self) -> u64 {
        let file_bytes: usize = self.files.iter().map(|f| f.approximate_bytes()).sum();
        (file_bytes + self.memcache.approximate_bytes()) as u64
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Snapshot memcache (swap with empty), write a new store file in
    /// sorted order, and atomically promote it into the file list. Returns
    /// the new file's flush sequence id, or `None` if the memcache was
    /// already empty (nothing to flush).
    pub fn flush(&mut self, flush_seq_id: SeqId) -> Result<Option<SeqId>> {
        if self.memcache.is_empty() {
            return Ok(None);
        }
        let snapshot = self.memcache.swap_empty();
        let cells = snapshot.into_cells();
        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("{:020}.sf", id));
        let file = StoreFile::write_new(path, id, flush_seq_id, cells)?;
        self.files.insert(0, file);
        Ok(Some(flush_seq_id))
    }

    /// Merges the oldest `batch_size` files into one, dropping cells
    /// shadowed by an older tombstone beyond `ttl_ms` or beyond
    /// `max_versions`. Idempotent: a store with <= 1 file is a no-op.
    pub fn compact(&mut self, batch_size: usize, max_versions: usize, ttl_ms: u64, now_ms: u64) -> Result<bool> {
        if self.files.len() <= 1 {
            return Ok(false);
        }
        let n = batch_size.min(self.files.len());
        let start = self.files.len() - n;
        let oldest: Vec<StoreFile> = self.files.split_off(start);

        let mut all_cells: Vec<Cell> = Vec::new();
        for f in &oldest {
            all_cells.extend_from_slice(f.cells());
        }
        all_cells.sort_by(|a, b| a.key.cmp(&b.key));

        let mut kept: Vec<Cell> = Vec::new();
        let mut versions_seen = 0usize;
        let mut current: Option<(RowKey, Column)> = None;
        let mut tombstoned = false;
        for cell in all_cells {
            let ident = (cell.row().clone(), cell.column().clone());
            if current.as_ref() != Some(&ident) {
                current = Some(ident);
                versions_seen = 0;
                tombstoned = false;
            }
            if tombstoned {
                continue;
            }
            if cell.value.is_tombstone() {
                tombstoned = true;
                if ttl_ms == 0 || now_ms.saturating_sub(cell.timestamp()) <= ttl_ms {
                    kept.push(cell);
                }
                continue;
            }
            if ttl_ms != 0 && now_ms.saturating_sub(cell.timestamp()) > ttl_ms {
                continue;
            }
            if max_versions != 0 && versions_seen >= max_versions {
                continue;
            }
            versions_seen += 1;
            kept.push(cell);
        }

        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("{:020}.sf", id));
        let flush_seq_id = oldest.iter().map(|f| f.flush_seq_id).max().unwrap_or(0);
        let merged = StoreFile::write_new(path, id, flush_seq_id, kept)?;
        // swap: insert merged at the position the oldest files occupied
        self.files.push(merged);

        let mut refs_changed = false;
        for f in &oldest {
            if f.owned {
                let _ = fs::remove_file(&f.path);
            } else {
                let before = self.refs.len();
                self.refs.retain(|r| r.path != f.path);
                refs_changed |= self.refs.len() != before;
            }
        }
        if refs_changed {
            write_refs(&self.dir, &self.refs)?;
        }
        Ok(true)
    }

    /// Every (row, column) present, newest-first, capped at `n_versions`
    /// values, newest ≤ `ts`. A tombstone shadows all older values.
    pub fn get(&self, row: &RowKey, column: &Column, ts: u64, n_versions: usize) -> Vec<Vec<u8>> {
        let mut by_ts: BTreeMap<u64, Value> = BTreeMap::new();
        for (key, value) in self.memcache.iter() {
            if &key.row == row && &key.column == column && key.timestamp <= ts {
                by_ts.insert(key.timestamp, value.clone());
            }
        }
        for file in &self.files {
            for cell in file.cells() {
                if cell.row() == row && cell.column() == column && cell.timestamp() <= ts {
                    by_ts.entry(cell.timestamp()).or_insert_with(|| cell.value.clone());
                }
            }
        }
        let mut out = Vec::new();
        for (_, value) in by_ts.into_iter().rev() {
            match value {
                Value::Tombstone => break,
                Value::Put(v) => {
                    out.push(v);
                    if out.len() >= n_versions {
                        break;
                    }
                }
            }
        }
        out
    }

    /// Latest non-tombstoned value per column present for `row`.
    pub fn get_full_row(&self, row: &RowKey) -> BTreeMap<Column, Vec<u8>> {
        let mut latest: BTreeMap<Column, (u64, Value)> = BTreeMap::new();
        let mut visit = |column: Column, ts: u64, value: Value| match latest.get(&column) {
            Some((best_ts, _)) if *best_ts >= ts => {}
            _ => {
                latest.insert(column, (ts, value));
            }
        };
        for (key, value) in self.memcache.iter() {
            if &key.row == row {
                visit(key.column.clone(), key.timestamp, value.clone());
            }
        }
        for file in &self.files {
            for cell in file.cells() {
                if cell.row() == row {
                    visit(cell.column().clone(), cell.timestamp(), cell.value.clone());
                }
            }
        }
        latest
            .into_iter()
            .filter_map(|(col, (_, value))| match value {
                Value::Put(v) => Some((col, v)),
                Value::Tombstone => None,
            })
            .collect()
    }

    /// All distinct rows at or after `start_row`, in ascending order, that
    /// have at least one visible (non-tombstoned) cell at or before `ts`.
    pub fn rows_from(&self, start_row: &RowKey, ts: u64) -> Vec<RowKey> {
        let mut rows: Vec<RowKey> = Vec::new();
        for (key, _) in self.memcache.iter() {
            if &key.row >= start_row && key.timestamp <= ts {
                if rows.last() != Some(&key.row) {
                    rows.push(key.row.clone());
                }
            }
        }
        for file in &self.files {
            for cell in file.cells() {
                if cell.row() >= start_row && cell.timestamp() <= ts {
                    if !rows.contains(cell.row()) {
                        rows.push(cell.row().clone());
                    }
                }
            }
        }
        rows.sort();
        rows.dedup();
        rows
    }

    /// Splits this store's files into two child directories by reference:
    /// used by `Region::close_and_split`. The parent's files are left on
    /// disk; children read through `StoreFile::open` lazily when they
    /// compact.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

/// A reference from a child store to one of the parent's store files, with
/// the half of the key range the child is entitled to read. The file
/// itself is owned by the filesystem layer (on disk), never by a `Region`:
/// this struct is a value-type pointer, not ownership.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileReference {
    pub path: PathBuf,
    pub lower_bound: Option<Vec<u8>>,
    pub upper_bound: Option<Vec<u8>>,
}

impl FileReference {
    pub fn matches(&self, row: &[u8]) -> bool {
        let above_lower = self.lower_bound.as_deref().map(|b| row >= b).unwrap_or(true);
        let below_upper = self.upper_bound.as_deref().map(|b| row < b).unwrap_or(true);
        above_lower && below_upper
    }
}

fn refs_path(dir: &Path) -> PathBuf {
    dir.join("refs.bin")
}

fn read_refs(dir: &Path) -> Result<Vec<FileReference>> {
    let path = refs_path(dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read(path)?;
    Ok(bincode::deserialize(&data)?)
}

/// Persists the set of parent-file references a split child should read
/// through until compaction materializes them into its own files.
pub fn write_refs(dir: &Path, refs: &[FileReference]) -> Result<()> {
    fs::create_dir_all(dir)?;
    if refs.is_empty() {
        return Ok(());
    }
    fs::write(refs_path(dir), bincode::serialize(refs)?)?;
    Ok(())
}

pub fn store_dir(root: &Path, table: &str, region_id: u64, family: &str) -> PathBuf {
    root.join(table).join(region_id.to_string()).join(family)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cell(row: &str, col: &str, ts: u64, value: Value) -> (CellKey, Value) {
        let (f, q) = {
            let mut parts = col.splitn(2, ':');
            (parts.next().unwrap().to_owned(), parts.next().unwrap().to_owned())
        };
        (
            CellKey {
                row: RowKey::from(row),
                column: Column::new(f, q),
                timestamp: ts,
            },
            value,
        )
    }

    #[test]
    fn memcache_get_returns_versions_newest_first() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path().to_path_buf(), "f").unwrap();
        let (k1, v1) = cell("k1", "f:c", 1, Value::Put(b"a".to_vec()));
        let (k2, v2) = cell("k1", "f:c", 2, Value::Put(b"b".to_vec()));
        let (k3, v3) = cell("k1", "f:c", 3, Value::Put(b"c".to_vec()));
        store.put(k1, v1);
        store.put(k2, v2);
        store.put(k3, v3);

        let row = RowKey::from("k1");
        let col = Column::new("f", "c");
        assert_eq!(store.get(&row, &col, 3, 2), vec![b"c".to_vec(), b"b".to_vec()]);
        assert_eq!(store.get(&row, &col, 2, 5), vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn tombstone_shadows_older_values() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path().to_path_buf(), "f").unwrap();
        let (k1, v1) = cell("k1", "f:c", 10, Value::Put(b"v".to_vec()));
        store.put(k1, v1);
        let (k2, v2) = cell("k1", "f:c", 10, Value::Tombstone);
        store.put(k2, v2);

        let row = RowKey::from("k1");
        let col = Column::new("f", "c");
        assert!(store.get(&row, &col, 10, 1).is_empty());
    }

    #[test]
    fn flush_persists_memcache_and_clears_it() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path().to_path_buf(), "f").unwrap();
        let (k1, v1) = cell("k1", "f:c", 1, Value::Put(b"a".to_vec()));
        store.put(k1, v1);
        assert!(store.memcache_bytes() > 0);

        let flushed = store.flush(5).unwrap();
        assert_eq!(flushed, Some(5));
        assert_eq!(store.memcache_bytes(), 0);
        assert_eq!(store.file_count(), 1);

        let row = RowKey::from("k1");
        let col = Column::new("f", "c");
        assert_eq!(store.get(&row, &col, 1, 1), vec![b"a".to_vec()]);
    }

    #[test]
    fn a_store_opened_with_refs_sees_the_referenced_files_cells() {
        let parent_dir = tempdir().unwrap();
        let mut parent = Store::open(parent_dir.path().to_path_buf(), "f").unwrap();
        for row in ["b", "n"] {
            let (k, v) = cell(row, "f:c", 1, Value::Put(row.as_bytes().to_vec()));
            parent.put(k, v);
        }
        parent.flush(1).unwrap();
        let parent_file = parent.file_paths().remove(0);

        let child_dir = tempdir().unwrap();
        write_refs(
            child_dir.path(),
            &[FileReference {
                path: parent_file,
                lower_bound: None,
                upper_bound: Some(b"m".to_vec()),
            }],
        )
        .unwrap();

        let child = Store::open(child_dir.path().to_path_buf(), "f").unwrap();
        let col = Column::new("f", "c");
        assert_eq!(child.get(&RowKey::from("b"), &col, 1, 1), vec![b"b".to_vec()]);
        assert!(child.get(&RowKey::from("n"), &col, 1, 1).is_empty());
    }

    #[test]
    fn compaction_drops_a_consumed_reference_from_refs_bin() {
        let parent_dir = tempdir().unwrap();
        let mut parent = Store::open(parent_dir.path().to_path_buf(), "f").unwrap();
        let (k, v) = cell("b", "f:c", 1, Value::Put(b"v".to_vec()));
        parent.put(k, v);
        parent.flush(1).unwrap();
        let parent_file = parent.file_paths().remove(0);

        let child_dir = tempdir().unwrap();
        write_refs(
            child_dir.path(),
            &[FileReference {
                path: parent_file.clone(),
                lower_bound: None,
                upper_bound: None,
            }],
        )
        .unwrap();

        let mut child = Store::open(child_dir.path().to_path_buf(), "f").unwrap();
        let (k, v) = cell("c", "f:c", 2, Value::Put(b"w".to_vec()));
        child.put(k, v);
        child.flush(2).unwrap();
        assert_eq!(child.file_count(), 2);

        child.compact(2, 3, 0, 0).unwrap();
        assert_eq!(child.file_count(), 1);
        assert!(read_refs(child_dir.path()).unwrap().is_empty());
        // the parent's own file is untouched: a sibling child may still reference it
        assert!(parent_file.exists());
    }

    #[test]
    fn compaction_merges_oldest_files_and_drops_extra_versions() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path().to_path_buf(), "f").unwrap();
        for ts in 1..=5u64 {
            let (k, v) = cell("k1", "f:c", ts, Value::Put(vec![ts as u8]));
            store.put(k, v);
            store.flush(ts).unwrap();
        }
        assert_eq!(store.file_count(), 5);
        let compacted = store.compact(5, 2, 0, 0).unwrap();
        assert!(compacted);
        assert_eq!(store.file_count(), 1);

        let row = RowKey::from("k1");
        let col = Column::new("f", "c");
        assert_eq!(store.get(&row, &col, 5, 10).len(), 2);
    }
}
