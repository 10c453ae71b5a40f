// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! Combines two adjacent, already-closed regions of one table into a
//! single region whose store directories hold copies of both parents'
//! files. The online and offline paths share this one core routine;
//! they differ only in what they require before calling it. The caller
//! is responsible for writing the merged descriptor and removing the two
//! source rows from the catalog region in a single row commit, so a
//! reader never observes the catalog in a state with three live rows for
//! the same key range.

use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::{self, RegionInfo};
use crate::errors::{Error, Result};
use crate::metrics::MERGE_COUNTER_VEC;
use crate::region::Region;
use crate::store::store_dir;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum MergeMode {
    Online,
    Offline,
}

fn mode_label(mode: MergeMode) -> &'static str {
    match mode {
        MergeMode::Online => "online",
        MergeMode::Offline => "offline",
    }
}

/// Merges `left` and `right`. Both must be regions of the same table with
/// `left.end_key == right.start_key`. Returns the descriptor for the new
/// combined region. The offline path additionally requires the caller to
/// assert the table is disabled; the online path relies on both regions
/// having already been closed and reported, so no disabled-table check
/// applies.
///
/// The catalog row swap — delete both parents, insert the merged row — runs
/// against `catalog` as three sequential single-row commits, matching the
/// same row-lock discipline any other table write goes through. A reader
/// never sees more than the old pair or the new singleton: it never sees
/// three live rows for the same key range, but it can transiently see zero.
#[allow(clippy::too_many_arguments)]
pub fn merge_core(
    root: &Path,
    left: &RegionInfo,
    right: &RegionInfo,
    mode: MergeMode,
    table_disabled: bool,
    catalog: &Region,
    server_name: &str,
    start_code: u64,
    ts: u64,
) -> Result<RegionInfo> {
    if left.table != right.table {
        return Err(Error::Config(format!(
            "cannot merge regions of different tables: {} and {}",
            left.table, right.table
        )));
    }
    if left.end_key != right.start_key {
        return Err(Error::Config(format!(
            "regions {} and {} are not adjacent",
            left.name(),
            right.name()
        )));
    }
    if mode == MergeMode::Offline && !table_disabled {
        return Err(Error::TableNotDisabled(left.table.clone()));
    }

    let mut families = left.families.clone();
    for family in &right.families {
        if !families.contains(family) {
            families.push(family.clone());
        }
    }
    families.sort();

    let merged_id = left.region_id.wrapping_mul(31).wrapping_add(right.region_id);
    let merged = RegionInfo::new(left.table.clone(), left.start_key.clone(), right.end_key.clone(), merged_id, families.clone());

    for family in &families {
        let dest = store_dir(root, &merged.table, merged.region_id, family);
        fs::create_dir_all(&dest)?;
        for parent in [left, right] {
            let src = store_dir(root, &parent.table, parent.region_id, family);
            if !src.exists() {
                continue;
            }
            copy_store_files(&src, &dest, parent.region_id)?;
        }
    }

    catalog::delete_row(catalog, &left.name(), ts)?;
    catalog::delete_row(catalog, &right.name(), ts)?;
    catalog::put_row(catalog, &merged, server_name, start_code, ts)?;

    MERGE_COUNTER_VEC.with_label_values(&[mode_label(mode)]).inc();
    Ok(merged)
}

/// Copies every store file from `src` into `dest`, prefixing each name
/// with the source region's id since both parents number their files
/// from zero.
fn copy_store_files(src: &Path, dest: &Path, source_region_id: u64) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let prefixed = format!("{}-{}", source_region_id, name.to_string_lossy());
        fs::copy(entry.path(), dest.join(prefixed))?;
    }
    Ok(())
}

/// Merges two regions of a live table. Callers must close both regions
/// and report the closes to the master before invoking this.
pub struct OnlineMerger;

impl OnlineMerger {
    pub fn merge(
        root: &Path,
        left: &RegionInfo,
        right: &RegionInfo,
        catalog: &Region,
        server_name: &str,
        start_code: u64,
        ts: u64,
    ) -> Result<RegionInfo> {
        merge_core(root, left, right, MergeMode::Online, true, catalog, server_name, start_code, ts)
    }
}

/// Merges two regions of a disabled table directly on disk, with no
/// coordinating master involved.
pub struct OfflineMerger;

impl OfflineMerger {
    #[allow(clippy::too_many_arguments)]
    pub fn merge(
        root: &Path,
        left: &RegionInfo,
        right: &RegionInfo,
        table_disabled: bool,
        catalog: &Region,
        server_name: &str,
        start_code: u64,
        ts: u64,
    ) -> Result<RegionInfo> {
        merge_core(root, left, right, MergeMode::Offline, table_disabled, catalog, server_name, start_code, ts)
    }
}
