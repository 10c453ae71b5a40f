// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! Three cooperative periodic tasks — flush, split-or-compact, log-roll —
//! modeled as independent `Chore`s owned by a scheduler, each on its own
//! thread with its own period and exit mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::config::Config;
use crate::errors::{is_fatal, Result};
use crate::fs_probe::FsProbe;
use crate::master::MasterHandle;
use crate::region::Region;
use crate::registry::RegionRegistry;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A periodic background task. The scheduler owns chores and the
/// stop flags; chores take collaborator handles explicitly (WAL, registry,
/// filesystem probe) rather than a whole-server back-reference, so they
/// stay testable in isolation.
pub trait Chore: Send {
    fn name(&self) -> &'static str;
    fn period(&self) -> Duration;
    fn step(&mut self) -> Result<()>;
}

/// Runs one `Chore` on its own OS thread until `stop_requested` is set.
/// Each chore has its own exit mutex so shutdown can wait for one to
/// finish without interrupting another.
pub struct ChoreRunner {
    stop_requested: Arc<AtomicBool>,
    exit_lock: Arc<Mutex<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ChoreRunner {
    pub fn spawn<C: Chore + 'static>(mut chore: C, stop_requested: Arc<AtomicBool>) -> ChoreRunner {
        let exit_lock = Arc::new(Mutex::new(()));
        let exit_lock_thread = Arc::clone(&exit_lock);
        let stop_thread = Arc::clone(&stop_requested);
        let handle = thread::Builder::new()
            .name(chore.name().to_owned())
            .spawn(move || {
                let _guard = exit_lock_thread.lock();
                while !stop_thread.load(Ordering::SeqCst) {
                    if let Err(e) = chore.step() {
                        slog_global::warn!("chore iteration failed"; "chore" => chore.name(), "err" => format!("{}", e));
                    }
                    thread::sleep(chore.period());
                }
            })
            .expect("failed to spawn chore thread");
        ChoreRunner {
            stop_requested,
            exit_lock,
            handle: Some(handle),
        }
    }

    /// Signals the chore to stop, then blocks until its current iteration
    /// finishes (by taking its exit mutex) and its thread has joined.
    pub fn stop(mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.exit_lock.lock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// For each non-closed region, flushes it if its memcache exceeds the
/// configured byte threshold or if it has not flushed in the configured
/// interval. A `DroppedSnapshot` is fatal and requests the server stop.
pub struct Flusher {
    registry: Arc<RegionRegistry>,
    config: Arc<Config>,
    stop_requested: Arc<AtomicBool>,
}

impl Flusher {
    pub fn new(registry: Arc<RegionRegistry>, config: Arc<Config>, stop_requested: Arc<AtomicBool>) -> Flusher {
        Flusher {
            registry,
            config,
            stop_requested,
        }
    }
}

impl Chore for Flusher {
    fn name(&self) -> &'static str {
        "flusher"
    }

    fn period(&self) -> Duration {
        Duration::from_millis(self.config.flush_check_interval_ms)
    }

    fn step(&mut self) -> Result<()> {
        let now = now_ms();
        for region in self.registry.snapshot_online() {
            let stale = now.saturating_sub(region.last_flush_ms()) > self.config.flush_check_interval_ms * 10;
            if region.memcache_bytes() > self.config.flush_memcache_bytes || stale {
                if let Err(e) = region.flush_timed(now) {
                    if is_fatal(&e) {
                        slog_global::error!("fatal flush error, requesting server stop"; "region" => region.name(), "err" => format!("{}", e));
                        self.stop_requested.store(true, Ordering::SeqCst);
                        return Err(e);
                    }
                    slog_global::warn!("flush failed, will retry next cycle"; "region" => region.name(), "err" => format!("{}", e));
                }
            }
        }
        Ok(())
    }
}

/// For each region: compact if it needs compaction, then split if any
/// store exceeds `max.filesize`. Reports the split to the master's
/// outbound queue. Errors here probe the filesystem rather than crash.
pub struct SplitOrCompactChecker {
    registry: Arc<RegionRegistry>,
    config: Arc<Config>,
    master: Arc<MasterHandle>,
    fs_probe: Arc<FsProbe>,
    stop_requested: Arc<AtomicBool>,
    catalog: Arc<Region>,
    server_name: String,
    start_code: u64,
}

impl SplitOrCompactChecker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<RegionRegistry>,
        config: Arc<Config>,
        master: Arc<MasterHandle>,
        fs_probe: Arc<FsProbe>,
        stop_requested: Arc<AtomicBool>,
        catalog: Arc<Region>,
        server_name: String,
        start_code: u64,
    ) -> SplitOrCompactChecker {
        SplitOrCompactChecker {
            registry,
            config,
            master,
            fs_probe,
            stop_requested,
            catalog,
            server_name,
            start_code,
        }
    }
}

impl Chore for SplitOrCompactChecker {
    fn name(&self) -> &'static str {
        "split-or-compact-checker"
    }

    fn period(&self) -> Duration {
        Duration::from_millis(self.config.split_or_compact_check_interval_ms)
    }

    fn step(&mut self) -> Result<()> {
        let now = now_ms();
        for region in self.registry.snapshot_online() {
            if region.needs_compaction(self.config.compaction_batch_size) {
                if let Err(e) = region.compact(
                    self.config.compaction_batch_size,
                    self.config.max_versions,
                    self.config.ttl_ms,
                    now,
                ) {
                    slog_global::warn!("compaction failed"; "region" => region.name(), "err" => format!("{}", e));
                    if self.fs_probe.check().is_err() {
                        self.stop_requested.store(true, Ordering::SeqCst);
                        return Err(e);
                    }
                    continue;
                }
            }
            if region.largest_store_size() > self.config.hregion_max_filesize {
                if let Some(mid) = region.approximate_mid_key() {
                    let parent_name = region.name();
                    match region.close_and_split(&mid, now) {
                        Ok((left, right)) => {
                            // Catalog first, then tell the master: a crash between
                            // the two leaves the catalog as the source of truth for
                            // the next meta scan to pick up.
                            let parent = region.info.read().clone();
                            if let Err(e) = crate::catalog::mark_split(&self.catalog, &parent, &left, &right, now) {
                                slog_global::warn!("failed to record split on the parent catalog row"; "region" => parent_name.clone(), "err" => format!("{}", e));
                            }
                            for child in [&left, &right] {
                                if let Err(e) = crate::catalog::put_row(&self.catalog, child, &self.server_name, self.start_code, now) {
                                    slog_global::warn!("failed to insert split child catalog row"; "region" => child.name(), "err" => format!("{}", e));
                                }
                            }
                            self.master.report_split(&parent_name, left, right);
                        }
                        Err(e) => {
                            slog_global::warn!("split failed"; "region" => parent_name, "err" => format!("{}", e));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Rolls the WAL once its entry count exceeds the configured threshold.
pub struct LogRoller {
    wal: Arc<crate::wal::Wal>,
    config: Arc<Config>,
    entries_since_roll: Arc<AtomicEntryCounter>,
}

/// A tiny counter the commit path increments; the real entry count lives in
/// the WAL's own generation bookkeeping, but exposing it here keeps
/// `LogRoller` free of a back-reference into `Region`/`RegionServer`.
pub struct AtomicEntryCounter(std::sync::atomic::AtomicU64);

impl AtomicEntryCounter {
    pub fn new() -> AtomicEntryCounter {
        AtomicEntryCounter(std::sync::atomic::AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::SeqCst)
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for AtomicEntryCounter {
    fn default() -> Self {
        AtomicEntryCounter::new()
    }
}

impl LogRoller {
    pub fn new(wal: Arc<crate::wal::Wal>, config: Arc<Config>, entries_since_roll: Arc<AtomicEntryCounter>) -> LogRoller {
        LogRoller {
            wal,
            config,
            entries_since_roll,
        }
    }
}

impl Chore for LogRoller {
    fn name(&self) -> &'static str {
        "log-roller"
    }

    fn period(&self) -> Duration {
        Duration::from_millis(self.config.log_roll_check_interval_ms)
    }

    fn step(&mut self) -> Result<()> {
        if self.entries_since_roll.get() > self.config.maxlogentries {
            self.wal.roll()?;
            self.entries_since_roll.take();
        }
        Ok(())
    }
}

/// Owns the three chores; `stop()` waits out any in-progress cycle for
/// each before returning.
pub struct ChoreScheduler {
    runners: Vec<ChoreRunner>,
}

impl ChoreScheduler {
    pub fn new() -> ChoreScheduler {
        ChoreScheduler { runners: Vec::new() }
    }

    pub fn add<C: Chore + 'static>(&mut self, chore: C, stop_requested: Arc<AtomicBool>) {
        self.runners.push(ChoreRunner::spawn(chore, stop_requested));
    }

    pub fn stop_all(self) {
        for runner in self.runners {
            runner.stop();
        }
    }
}

impl Default for ChoreScheduler {
    fn default() -> Self {
        ChoreScheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, RegionInfo};
    use crate::keys::{Column, RowKey};
    use crate::region::Region;
    use tempfile::tempdir;

    #[test]
    fn flusher_flushes_a_region_over_the_memcache_threshold() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(crate::wal::Wal::open(dir.path().join("wal")).unwrap());
        let info = RegionInfo::new("t", b"a".to_vec(), b"z".to_vec(), 1, vec!["f".into()]);
        let region = Arc::new(Region::open(info, dir.path().to_path_buf(), wal, 0).unwrap());

        let row = RowKey::from("k1");
        let col = Column::new("f", "c");
        let lock = region.start_update(row).unwrap();
        region.put(lock, col, vec![0u8; 128]).unwrap();
        region.commit(lock, 1).unwrap();

        let registry = Arc::new(RegionRegistry::new());
        registry.open(Arc::clone(&region)).unwrap();

        let mut config = Config::default();
        config.flush_memcache_bytes = 1;
        let config = Arc::new(config);
        let stop = Arc::new(AtomicBool::new(false));
        let mut flusher = Flusher::new(registry, config, stop);
        flusher.step().unwrap();

        assert_eq!(region.memcache_bytes(), 0);
    }

    #[test]
    fn log_roller_rolls_past_the_entry_threshold() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(crate::wal::Wal::open(dir.path().join("wal")).unwrap());
        let mut config = Config::default();
        config.maxlogentries = 1;
        let config = Arc::new(config);
        let counter = Arc::new(AtomicEntryCounter::new());
        counter.increment();
        counter.increment();

        let before = wal.generation();
        let mut roller = LogRoller::new(Arc::clone(&wal), config, counter);
        roller.step().unwrap();
        assert_eq!(wal.generation(), before + 1);
    }

    #[test]
    fn split_or_compact_checker_splits_an_oversized_region_and_records_it_on_the_catalog() {
        let dir = tempdir().unwrap();
        let wal = Arc::new(crate::wal::Wal::open(dir.path().join("wal")).unwrap());
        let info = RegionInfo::new("t", b"a".to_vec(), b"z".to_vec(), 1, vec!["f".into()]);
        let region = Arc::new(Region::open(info, dir.path().to_path_buf(), Arc::clone(&wal), 0).unwrap());

        let col = Column::new("f", "c");
        for row in ["a", "m", "y"] {
            let lock = region.start_update(RowKey::from(row)).unwrap();
            region.put(lock, col.clone(), vec![0u8; 64]).unwrap();
            region.commit(lock, 1).unwrap();
        }

        let registry = Arc::new(RegionRegistry::new());
        registry.open(Arc::clone(&region)).unwrap();

        let catalog_info = RegionInfo::new(catalog::META_TABLE, Vec::new(), Vec::new(), 0, vec!["info".into()]);
        let catalog = Arc::new(Region::open(catalog_info, dir.path().to_path_buf(), wal, 0).unwrap());

        let mut config = Config::default();
        config.hregion_max_filesize = 32;
        let config = Arc::new(config);
        let master = Arc::new(MasterHandle::new());
        let fs_probe = Arc::new(FsProbe::new(dir.path().to_path_buf()));
        let stop = Arc::new(AtomicBool::new(false));

        let mut checker = SplitOrCompactChecker::new(
            registry,
            config,
            master,
            fs_probe,
            stop,
            Arc::clone(&catalog),
            "server-1".to_owned(),
            1,
        );
        checker.step().unwrap();

        let parent_row = catalog.get_full(&RowKey::from("t,a,1")).unwrap();
        assert!(parent_row.contains_key(&Column::parse(catalog::COL_SPLIT_A).unwrap()));
        assert!(parent_row.contains_key(&Column::parse(catalog::COL_SPLIT_B).unwrap()));
    }
}
