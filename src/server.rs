// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! Wires together the registry, the shared WAL, the chore scheduler, the
//! lease manager, and the master heartbeat into one running server.
//! `init` performs the filesystem probe and the startup handshake; after
//! that, everything runs on background threads until `stop` or an
//! unrecoverable error sets `abort_requested`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::RegionInfo;
use crate::chore::{AtomicEntryCounter, ChoreScheduler, Flusher, LogRoller, SplitOrCompactChecker};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::fs_probe::FsProbe;
use crate::keys::{Column, RowKey};
use crate::lease::{LeaseManager, LeaseSweeper};
use crate::master::{self, HeartbeatService, Instruction, InstructionHandler, MasterClient, MasterHandle};
use crate::metrics::REGION_COUNT_GAUGE_VEC;
use crate::region::Region;
use crate::registry::RegionRegistry;
use crate::wal::Wal;

struct Inner {
    config: RwLock<Config>,
    root: PathBuf,
    registry: Arc<RegionRegistry>,
    wal: Arc<Wal>,
    master_handle: Arc<MasterHandle>,
    lease_manager: Arc<LeaseManager>,
    fs_probe: Arc<FsProbe>,
    entries_since_roll: Arc<AtomicEntryCounter>,
    server_name: String,
    start_code: u64,
    stop_requested: Arc<AtomicBool>,
    abort_requested: Arc<AtomicBool>,
    /// The locally-hosted catalog region: split and merge route their row
    /// swaps through it with the same row-lock discipline as any table.
    catalog: Arc<Region>,
    /// Set once `init` runs; `CallServerStartup` uses it to re-run the
    /// startup handshake without a process restart.
    master_client: RwLock<Option<Arc<dyn MasterClient>>>,
}

/// A handle to the running server. Cheap to clone: every field behind it
/// lives in an `Arc`.
#[derive(Clone)]
pub struct RegionServer {
    inner: Arc<Inner>,
}

/// Returned by `init`; stops every background thread in dependency order.
pub struct RunningServer {
    server: RegionServer,
    chores: ChoreScheduler,
    heartbeat: HeartbeatService,
    lease_sweeper: LeaseSweeper,
}

impl RegionServer {
    /// Opens the shared WAL and an empty registry under `config.rootdir`.
    /// Does not talk to the master or start any background thread; call
    /// `init` for that.
    pub fn new(config: Config, server_name: impl Into<String>, start_code: u64) -> Result<RegionServer> {
        let server_name = server_name.into();
        let root = PathBuf::from(&config.rootdir);
        std::fs::create_dir_all(&root)?;
        let wal_dir = root.join(format!("log_{}_{}", server_name, start_code));
        let wal = Arc::new(Wal::open(wal_dir)?);
        let fs_probe = Arc::new(FsProbe::new(root.clone()));
        let lease_manager = Arc::new(LeaseManager::new(config.regionserver_lease_period()));

        let catalog_info = RegionInfo::new(crate::catalog::META_TABLE, Vec::new(), Vec::new(), 0, vec!["info".to_owned()]);
        let catalog = Arc::new(Region::open(catalog_info, root.clone(), Arc::clone(&wal), 0)?);

        Ok(RegionServer {
            inner: Arc::new(Inner {
                registry: Arc::new(RegionRegistry::new()),
                wal,
                master_handle: Arc::new(MasterHandle::new()),
                lease_manager,
                fs_probe,
                entries_since_roll: Arc::new(AtomicEntryCounter::new()),
                server_name,
                start_code,
                stop_requested: Arc::new(AtomicBool::new(false)),
                abort_requested: Arc::new(AtomicBool::new(false)),
                root,
                config: RwLock::new(config),
                catalog,
                master_client: RwLock::new(None),
            }),
        })
    }

    pub fn config(&self) -> Config {
        self.inner.config.read().clone()
    }

    pub fn registry(&self) -> &Arc<RegionRegistry> {
        &self.inner.registry
    }

    pub fn lease_manager(&self) -> &Arc<LeaseManager> {
        &self.inner.lease_manager
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.abort_requested.load(Ordering::SeqCst)
    }

    /// Runs the filesystem probe, performs the master startup handshake,
    /// and starts every background thread (chores, lease sweeper,
    /// heartbeat). Returns a handle that stops them all on `stop`.
    pub fn init(&self, client: Arc<dyn MasterClient>) -> Result<RunningServer> {
        self.inner.fs_probe.check()?;

        let overrides = master::startup(client.as_ref(), &self.inner.server_name, self.inner.start_code)?;
        {
            let mut config = self.inner.config.write();
            config.apply_overrides(&overrides);
        }
        *self.inner.master_client.write() = Some(Arc::clone(&client));
        let config = Arc::new(self.inner.config.read().clone());

        let mut chores = ChoreScheduler::new();
        chores.add(
            Flusher::new(Arc::clone(&self.inner.registry), Arc::clone(&config), Arc::clone(&self.inner.stop_requested)),
            Arc::clone(&self.inner.stop_requested),
        );
        chores.add(
            SplitOrCompactChecker::new(
                Arc::clone(&self.inner.registry),
                Arc::clone(&config),
                Arc::clone(&self.inner.master_handle),
                Arc::clone(&self.inner.fs_probe),
                Arc::clone(&self.inner.stop_requested),
                Arc::clone(&self.inner.catalog),
                self.inner.server_name.clone(),
                self.inner.start_code,
            ),
            Arc::clone(&self.inner.stop_requested),
        );
        chores.add(
            LogRoller::new(Arc::clone(&self.inner.wal), Arc::clone(&config), Arc::clone(&self.inner.entries_since_roll)),
            Arc::clone(&self.inner.stop_requested),
        );

        let lease_sweeper = LeaseSweeper::spawn(Arc::clone(&self.inner.lease_manager), config.regionserver_lease_period());

        let heartbeat = HeartbeatService::start(
            client,
            Arc::new(self.clone()),
            Arc::clone(&self.inner.master_handle),
            Arc::clone(&config),
            self.inner.server_name.clone(),
            self.inner.start_code,
            Arc::clone(&self.inner.stop_requested),
            Arc::clone(&self.inner.abort_requested),
        )?;

        Ok(RunningServer {
            server: self.clone(),
            chores,
            heartbeat,
            lease_sweeper,
        })
    }

    /// Opens a region, replaying its share of the WAL, and registers it.
    pub fn open_region(&self, info: RegionInfo) -> Result<Arc<Region>> {
        let region = Arc::new(Region::open(info.clone(), self.inner.root.clone(), Arc::clone(&self.inner.wal), 0)?);
        self.inner.registry.open(Arc::clone(&region))?;
        REGION_COUNT_GAUGE_VEC.with_label_values(&["open"]).inc();
        self.inner.master_handle.report_opened(info);
        Ok(region)
    }

    /// Closes a region and removes it from the registry.
    pub fn close_region(&self, name: &str, abort: bool) -> Result<()> {
        let region = self.inner.registry.begin_close(name)?;
        region.close(abort);
        self.inner.registry.end_close(name);
        REGION_COUNT_GAUGE_VEC.with_label_values(&["open"]).dec();
        self.inner.master_handle.report_closed(name);
        Ok(())
    }

    pub fn get(&self, region_name: &str, row: &RowKey, column: &Column, ts: Option<u64>, n_versions: usize) -> Result<Vec<Vec<u8>>> {
        self.inner.registry.lookup(region_name, false)?.get(row, column, ts, n_versions)
    }

    pub fn start_update(&self, region_name: &str, row: RowKey) -> Result<(Arc<Region>, u64)> {
        let region = self.inner.registry.lookup(region_name, false)?;
        let lock_id = region.start_update(row)?;
        Ok((region, lock_id))
    }

    pub fn commit(&self, region: &Arc<Region>, lock_id: u64, timestamp: u64) -> Result<()> {
        region.commit(lock_id, timestamp)?;
        self.inner.entries_since_roll.increment();
        Ok(())
    }
}

impl InstructionHandler for RegionServer {
    fn apply(&self, instruction: Instruction) -> Result<()> {
        match instruction {
            Instruction::OpenRegion(info) => self.open_region(info).map(|_| ()),
            Instruction::CloseRegion(name) => self.close_region(&name, false),
            Instruction::CloseRegionWithoutReport(name) => {
                let region = self.inner.registry.begin_close(&name)?;
                region.close(false);
                self.inner.registry.end_close(&name);
                REGION_COUNT_GAUGE_VEC.with_label_values(&["open"]).dec();
                Ok(())
            }
            Instruction::Stop => {
                self.inner.stop_requested.store(true, Ordering::SeqCst);
                Ok(())
            }
            Instruction::CallServerStartup => {
                let client = self.inner.master_client.read().clone();
                let client = client.ok_or_else(|| Error::Remote("no master client registered yet".to_owned()))?;
                let overrides = master::startup(client.as_ref(), &self.inner.server_name, self.inner.start_code)?;
                self.inner.config.write().apply_overrides(&overrides);
                Ok(())
            }
        }
    }
}

impl RunningServer {
    /// Stops background threads in order: chores first (so no new flush
    /// or split starts), then the lease sweeper, then the heartbeat
    /// (letting the master see this server has stopped cleanly rather
    /// than silently vanishing).
    pub fn stop(self) {
        self.server.inner.stop_requested.store(true, Ordering::SeqCst);
        self.chores.stop_all();
        self.lease_sweeper.stop();
        self.heartbeat.join();
        if !self.server.is_aborted() {
            let _ = self.server.inner.wal.delete_all();
        }
    }

    pub fn server(&self) -> &RegionServer {
        &self.server
    }
}

/// `stop` RPC is refused outright: a standalone process is managed by its
/// supervisor (systemd, the master's own process manager), not by a peer
/// asking it to exit over the wire.
pub fn reject_remote_stop() -> Error {
    Error::Remote("stop is not accepted as a remote instruction".to_owned())
}
