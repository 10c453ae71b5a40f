// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! The region descriptor and the two well-known catalog tables.
//!
//! `root` and `meta` are ordinary regions of a reserved table name; their
//! rows carry `info:regioninfo` / `info:server` / `info:startcode` and,
//! mid-split, `info:splitA` / `info:splitB`. This module only defines the
//! descriptor shape and the reserved names; the rows themselves live
//! inside a `Region` like any other table's rows.

use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};

use crate::errors::Result;
use crate::keys::{Column, RowKey};
use crate::region::Region;

pub const ROOT_TABLE: &str = "-ROOT-";
pub const META_TABLE: &str = ".META.";

pub const COL_REGIONINFO: &str = "info:regioninfo";
pub const COL_SERVER: &str = "info:server";
pub const COL_STARTCODE: &str = "info:startcode";
pub const COL_SPLIT_A: &str = "info:splitA";
pub const COL_SPLIT_B: &str = "info:splitB";

/// Serialized form of a region: table name, key range, id, and the two
/// split-in-progress catalog flags.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionInfo {
    pub table: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub region_id: u64,
    pub offline: bool,
    pub split: bool,
    pub families: Vec<String>,
    /// Lowest sequence id this region's stores already cover, i.e. the WAL
    /// replay watermark a reopen can start from rather than replaying the
    /// whole retained tail.
    pub min_seq: u64,
    /// Highest sequence id this region has applied.
    pub max_seq: u64,
}

impl RegionInfo {
    pub fn new(
        table: impl Into<String>,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        region_id: u64,
        families: Vec<String>,
    ) -> RegionInfo {
        RegionInfo {
            table: table.into(),
            start_key,
            end_key,
            region_id,
            offline: false,
            split: false,
            families,
            min_seq: 0,
            max_seq: 0,
        }
    }

    /// `table,startKey,regionId` — the catalog row name for this region.
    pub fn name(&self) -> String {
        format!(
            "{},{},{}",
            self.table,
            String::from_utf8_lossy(&self.start_key),
            self.region_id
        )
    }

    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.start_key.as_slice() && (self.end_key.is_empty() || row < &self.end_key[..])
    }

    /// Two regions overlap if their ranges intersect; both must be of the
    /// same table for this to be meaningful.
    pub fn overlaps(&self, other: &RegionInfo) -> bool {
        if self.table != other.table {
            return false;
        }
        let self_end_unbounded = self.end_key.is_empty();
        let other_end_unbounded = other.end_key.is_empty();
        let starts_before_other_ends = other_end_unbounded || self.start_key < other.end_key;
        let other_starts_before_self_ends = self_end_unbounded || other.start_key < self.end_key;
        starts_before_other_ends && other_starts_before_self_ends
    }

    pub fn encode(&self) -> crate::errors::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::errors::Result<RegionInfo> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Where a region's descriptor lives on disk, alongside its per-family
/// store directories: `root/table/region_id/info/region.info`.
pub fn descriptor_path(root: &Path, table: &str, region_id: u64) -> PathBuf {
    root.join(table).join(region_id.to_string()).join("info").join("region.info")
}

/// Persists a region's descriptor so a restarted server can rediscover it
/// without waiting on a master instruction to resend it.
pub fn write_descriptor(root: &Path, info: &RegionInfo) -> Result<()> {
    let path = descriptor_path(root, &info.table, info.region_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, info.encode()?)?;
    Ok(())
}

pub fn read_descriptor(root: &Path, table: &str, region_id: u64) -> Result<RegionInfo> {
    let bytes = std::fs::read(descriptor_path(root, table, region_id))?;
    RegionInfo::decode(&bytes)
}

/// Writes (or overwrites) the catalog row for `info`: `regioninfo`, `server`,
/// and `startcode`, as a single row commit. The catalog is an ordinary
/// region; this goes through the same row-lock discipline as any other
/// table write.
pub fn put_row(catalog: &Region, info: &RegionInfo, server_name: &str, start_code: u64, ts: u64) -> Result<()> {
    let lock = catalog.start_update(RowKey::from(info.name()))?;
    catalog.put(lock, Column::parse(COL_REGIONINFO)?, info.encode()?)?;
    catalog.put(lock, Column::parse(COL_SERVER)?, server_name.as_bytes().to_vec())?;
    catalog.put(lock, Column::parse(COL_STARTCODE)?, start_code.to_be_bytes().to_vec())?;
    catalog.commit(lock, ts)?;
    Ok(())
}

/// Deletes every column of the catalog row named `region_name` in a single
/// row commit. Used by merge to retire both parent rows.
pub fn delete_row(catalog: &Region, region_name: &str, ts: u64) -> Result<()> {
    let lock = catalog.start_update(RowKey::from(region_name.to_owned()))?;
    catalog.delete(lock, Column::parse(COL_REGIONINFO)?)?;
    catalog.delete(lock, Column::parse(COL_SERVER)?)?;
    catalog.delete(lock, Column::parse(COL_STARTCODE)?)?;
    catalog.commit(lock, ts)?;
    Ok(())
}

/// Records a split in progress on the parent's catalog row: the parent's
/// own (now offline) descriptor plus the two child pointers, in one commit.
pub fn mark_split(catalog: &Region, parent: &RegionInfo, left: &RegionInfo, right: &RegionInfo, ts: u64) -> Result<()> {
    let lock = catalog.start_update(RowKey::from(parent.name()))?;
    catalog.put(lock, Column::parse(COL_REGIONINFO)?, parent.encode()?)?;
    catalog.put(lock, Column::parse(COL_SPLIT_A)?, left.encode()?)?;
    catalog.put(lock, Column::parse(COL_SPLIT_B)?, right.encode()?)?;
    catalog.commit(lock, ts)?;
    Ok(())
}
