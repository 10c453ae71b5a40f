// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! Write-ahead log: one append-only file per server incarnation.
//! Entries are framed `[len: u32][crc32: u32][payload]` so
//! `replay` can truncate at the first malformed or checksum-mismatched
//! record, tolerating a partial tail left by a crash mid-append.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};

use crate::errors::Result;
use crate::keys::{Column, RowKey, SeqId, Value};
use crate::metrics::WAL_APPEND_DURATION_HISTOGRAM;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalEntry {
    pub sequence_id: SeqId,
    pub region: String,
    pub row: Vec<u8>,
    pub family: String,
    pub qualifier: String,
    pub timestamp: u64,
    pub value: Value,
}

impl WalEntry {
    pub fn column(&self) -> Column {
        Column::new(self.family.clone(), self.qualifier.clone())
    }

    pub fn row_key(&self) -> RowKey {
        RowKey::new(self.row.clone())
    }
}

struct Inner {
    file: File,
    generation: u64,
}

/// A rolled-off generation file, retained until every region that wrote
/// into it has flushed past its own last entry's sequence id there.
struct RetainedGeneration {
    path: PathBuf,
    max_seq_by_region: HashMap<String, SeqId>,
}

/// Append-only sequence of row/column/timestamp edits, monotonically
/// sequenced across every region hosted on this server.
pub struct Wal {
    dir: PathBuf,
    inner: Mutex<Inner>,
    next_seq: AtomicU64,
    /// Files from earlier generations, retained until every region they
    /// cover has reported a flush at or past their last entry's sequence id.
    retained: Mutex<Vec<RetainedGeneration>>,
    /// Each region's most recent reported flush sequence id, across every
    /// generation, so a generation a region wrote into long ago but hasn't
    /// flushed since isn't deleted out from under it.
    region_flushed: Mutex<HashMap<String, SeqId>>,
}

impl Wal {
    /// Opens (creating if absent) the log directory
    /// `log_<host>_<incarnation>_<port>/` and starts a fresh generation.
    pub fn open(dir: PathBuf) -> Result<Wal> {
        fs::create_dir_all(&dir)?;
        let generation = next_generation(&dir)?;
        let path = generation_path(&dir, generation);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Wal {
            dir,
            inner: Mutex::new(Inner { file, generation }),
            next_seq: AtomicU64::new(1),
            retained: Mutex::new(Vec::new()),
            region_flushed: Mutex::new(HashMap::new()),
        })
    }

    pub fn next_sequence_id(&self) -> SeqId {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Appends one commit's worth of entries atomically: either all are
    /// durable on return, or the append failed and none are (a torn write
    /// is caught by `replay`'s checksum truncation, never surfaced as a
    /// partial commit).
    pub fn append(&self, entries: &[WalEntry]) -> Result<()> {
        let start = std::time::Instant::now();
        let result = self.append_inner(entries);
        let label = if result.is_ok() { "ok" } else { "err" };
        WAL_APPEND_DURATION_HISTOGRAM
            .with_label_values(&[label])
            .observe(start.elapsed().as_secs_f64());
        result
    }

    fn append_inner(&self, entries: &[WalEntry]) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut buf = Vec::new();
        for entry in entries {
            let payload = bincode::serialize(entry)?;
            let mut hasher = Hasher::new();
            hasher.update(&payload);
            let crc = hasher.finalize();
            buf.write_u32::<LittleEndian>(payload.len() as u32)?;
            buf.write_u32::<LittleEndian>(crc)?;
            buf.extend_from_slice(&payload);
        }
        inner.file.write_all(&buf)?;
        inner.file.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Closes the current file and opens a new, higher-generation one.
    /// Old generations are retained until `mark_flushed` reports every
    /// region covered has flushed past their last entry's sequence id.
    pub fn roll(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let old_path = generation_path(&self.dir, inner.generation);
        let max_seq_by_region = if old_path.exists() {
            let data = fs::read(&old_path)?;
            let mut by_region: HashMap<String, SeqId> = HashMap::new();
            for entry in read_entries(&data) {
                let max = by_region.entry(entry.region).or_insert(0);
                *max = (*max).max(entry.sequence_id);
            }
            by_region
        } else {
            HashMap::new()
        };
        self.retained.lock().push(RetainedGeneration {
            path: old_path,
            max_seq_by_region,
        });

        let generation = inner.generation + 1;
        let path = generation_path(&self.dir, generation);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        *inner = Inner { file, generation };
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// `region` reports it has durably flushed everything up to and
    /// including `up_to_seq`. A retained generation is deletable only once
    /// every region that wrote into it has reported a flush at or past its
    /// own last entry there — not just the caller's.
    pub fn mark_flushed(&self, region: &str, up_to_seq: SeqId) -> Result<Vec<PathBuf>> {
        {
            let mut region_flushed = self.region_flushed.lock();
            let entry = region_flushed.entry(region.to_owned()).or_insert(0);
            *entry = (*entry).max(up_to_seq);
        }

        let region_flushed = self.region_flushed.lock();
        let mut retained = self.retained.lock();
        let mut deletable = Vec::new();
        retained.retain(|gen| {
            let fully_covered = gen.max_seq_by_region.iter().all(|(region, max_seq)| {
                region_flushed.get(region).copied().unwrap_or(0) >= *max_seq
            });
            if fully_covered {
                deletable.push(gen.path.clone());
                false
            } else {
                true
            }
        });
        for path in &deletable {
            let _ = fs::remove_file(path);
        }
        Ok(deletable)
    }

    /// Replays entries addressed to `region` with `sequence_id > from_seq`,
    /// in sequence-id order, across every retained generation plus the
    /// current file. Truncates at the first malformed or checksum-mismatched
    /// record, tolerating a partial tail.
    pub fn replay(&self, region: &str, from_seq: SeqId) -> Result<Vec<WalEntry>> {
        let mut paths: Vec<PathBuf> = self.retained.lock().iter().map(|gen| gen.path.clone()).collect();
        let current_generation = self.inner.lock().generation;
        paths.push(generation_path(&self.dir, current_generation));

        let mut out = Vec::new();
        for path in paths {
            if !path.exists() {
                continue;
            }
            let data = fs::read(&path)?;
            out.extend(read_entries(&data));
        }
        out.retain(|e| e.region == region && e.sequence_id > from_seq);
        out.sort_by_key(|e| e.sequence_id);
        Ok(out)
    }

    /// Deletes all WAL files for this incarnation. Called only on clean
    /// shutdown; an aborted server leaves them for the next startup's
    /// replay.
    pub fn delete_all(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

fn generation_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{:010}.wal", generation))
}

fn next_generation(dir: &Path) -> Result<u64> {
    let mut max = 0u64;
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if let Ok(g) = stem.parse::<u64>() {
                    max = max.max(g);
                }
            }
        }
    }
    Ok(if max == 0 { 1 } else { max + 1 })
}

/// Reads framed entries from a WAL file's raw bytes, stopping at the first
/// record whose length/checksum doesn't check out.
fn read_entries(data: &[u8]) -> Vec<WalEntry> {
    let mut out = Vec::new();
    let mut cursor = data;
    loop {
        if cursor.len() < 8 {
            break;
        }
        let mut header = cursor;
        let len = match header.read_u32::<LittleEndian>() {
            Ok(v) => v as usize,
            Err(_) => break,
        };
        let crc = match header.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(_) => break,
        };
        if header.len() < len {
            break;
        }
        let payload = &header[..len];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != crc {
            break;
        }
        match bincode::deserialize::<WalEntry>(payload) {
            Ok(entry) => out.push(entry),
            Err(_) => break,
        }
        cursor = &header[len..];
    }
    out
}
