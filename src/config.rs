// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! Server configuration: loaded once from a TOML file at startup, then
//! patched by the master's `regionServerStartup` override map in `init()`.
//! No other mutation is allowed afterward.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{Error, Result};

const DEFAULT_MAX_FILESIZE: u64 = 256 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `hbase.rootdir` — root of the on-disk layout (WAL dirs, table dirs, merge scratch dirs).
    pub rootdir: String,
    /// `hbase.hregion.max.filesize` — store file size that triggers a split.
    pub hregion_max_filesize: u64,
    /// `hbase.regionserver.msginterval` — heartbeat period, in milliseconds.
    pub msginterval_ms: u64,
    /// `hbase.master.lease.period` — time without a successful heartbeat before the server aborts.
    pub master_lease_period_ms: u64,
    /// `hbase.regionserver.lease.period` — default scanner lease TTL.
    pub regionserver_lease_period_ms: u64,
    /// `hbase.regionserver.maxlogentries` — WAL entry count that triggers a roll.
    pub maxlogentries: u64,
    /// `hbase.client.retries.number` — instruction retry budget before the worker gives up.
    pub client_retries_number: u32,
    /// `hbase.regionserver.handler.count` — sizing hint for the RPC handler pool (unused by the core, carried for parity).
    pub handler_count: u32,
    /// Memcache byte threshold that triggers a flush.
    pub flush_memcache_bytes: u64,
    /// Flush chore wake frequency.
    pub flush_check_interval_ms: u64,
    /// Split/compact chore period.
    pub split_or_compact_check_interval_ms: u64,
    /// Log roller wake frequency.
    pub log_roll_check_interval_ms: u64,
    /// Lease sweeper wake frequency.
    pub lease_sweep_interval_ms: u64,
    /// Number of oldest store files a single compaction merges.
    pub compaction_batch_size: usize,
    /// Max versions retained per (row, column) during compaction.
    pub max_versions: usize,
    /// Cell TTL; cells older than this (and shadowed) are dropped on compaction. 0 = no TTL.
    pub ttl_ms: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            rootdir: "/tmp/regionserver".to_owned(),
            hregion_max_filesize: DEFAULT_MAX_FILESIZE,
            msginterval_ms: 3_000,
            master_lease_period_ms: 30_000,
            regionserver_lease_period_ms: 60_000,
            maxlogentries: 32 * 1024,
            client_retries_number: 10,
            handler_count: 10,
            flush_memcache_bytes: 64 * 1024 * 1024,
            flush_check_interval_ms: 1_000,
            split_or_compact_check_interval_ms: 30_000,
            log_roll_check_interval_ms: 1_000,
            lease_sweep_interval_ms: 1_000,
            compaction_batch_size: 4,
            max_versions: 3,
            ttl_ms: 0,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let data = fs::read_to_string(path)?;
        toml::from_str(&data).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn msginterval(&self) -> Duration {
        Duration::from_millis(self.msginterval_ms)
    }

    pub fn master_lease_period(&self) -> Duration {
        Duration::from_millis(self.master_lease_period_ms)
    }

    pub fn regionserver_lease_period(&self) -> Duration {
        Duration::from_millis(self.regionserver_lease_period_ms)
    }

    /// Applies the master's startup override map. Called exactly once, from
    /// `RegionServer::init`, before any chore or RPC handler starts.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, String>) {
        for (key, value) in overrides {
            match key.as_str() {
                "hbase.rootdir" => self.rootdir = value.clone(),
                "hbase.hregion.max.filesize" => {
                    if let Ok(v) = value.parse() {
                        self.hregion_max_filesize = v;
                    }
                }
                "hbase.regionserver.msginterval" => {
                    if let Ok(v) = value.parse() {
                        self.msginterval_ms = v;
                    }
                }
                "hbase.master.lease.period" => {
                    if let Ok(v) = value.parse() {
                        self.master_lease_period_ms = v;
                    }
                }
                "hbase.regionserver.lease.period" => {
                    if let Ok(v) = value.parse() {
                        self.regionserver_lease_period_ms = v;
                    }
                }
                "hbase.regionserver.maxlogentries" => {
                    if let Ok(v) = value.parse() {
                        self.maxlogentries = v;
                    }
                }
                "hbase.client.retries.number" => {
                    if let Ok(v) = value.parse() {
                        self.client_retries_number = v;
                    }
                }
                "hbase.regionserver.handler.count" => {
                    if let Ok(v) = value.parse() {
                        self.handler_count = v;
                    }
                }
                _ => {
                    slog_global::warn!("ignoring unrecognized config override"; "key" => key);
                }
            }
        }
    }
}
