// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! Scanners and the leases that bound their lifetime. A scanner is just a
//! row cursor plus a renewable TTL; a background sweeper closes any
//! scanner whose lease has lapsed so a client that vanished mid-scan
//! doesn't pin a region's stores open forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::errors::{Error, Result};
use crate::keys::{Column, RowKey};
use crate::metrics::SCANNER_LEASE_EXPIRED_COUNTER;
use crate::region::{random_scanner_id, Region};

/// One open scan: the region it reads from, the columns it's restricted
/// to (empty = all), the timestamp ceiling, and its progress cursor.
struct ScannerCursor {
    region: Arc<Region>,
    columns: Vec<Column>,
    timestamp: Option<u64>,
    next_row: Option<RowKey>,
    expires_at: Instant,
    ttl: Duration,
}

impl ScannerCursor {
    fn renew(&mut self) {
        self.expires_at = Instant::now() + self.ttl;
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Tracks every open scanner across every region on this server, and
/// sweeps expired ones on a background thread.
pub struct LeaseManager {
    scanners: Mutex<HashMap<u64, ScannerCursor>>,
    default_ttl: Duration,
}

impl LeaseManager {
    pub fn new(default_ttl: Duration) -> LeaseManager {
        LeaseManager {
            scanners: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Opens a scanner and returns its id. The first batch is not fetched
    /// here; call `next` to pull rows and renew the lease in one step.
    pub fn open_scanner(&self, region: Arc<Region>, columns: Vec<Column>, start_row: RowKey, timestamp: Option<u64>) -> u64 {
        let id = random_scanner_id();
        let cursor = ScannerCursor {
            region,
            columns,
            timestamp,
            next_row: Some(start_row),
            expires_at: Instant::now() + self.default_ttl,
            ttl: self.default_ttl,
        };
        self.scanners.lock().insert(id, cursor);
        id
    }

    /// Returns up to `batch_size` rows starting at the cursor's current
    /// position, renewing the lease. `None` for the row key marks the scan
    /// as exhausted; the caller should then call `close`.
    pub fn next(&self, scanner_id: u64, batch_size: usize) -> Result<Vec<(RowKey, std::collections::BTreeMap<Column, Vec<u8>>)>> {
        let mut scanners = self.scanners.lock();
        let cursor = scanners.get_mut(&scanner_id).ok_or(Error::UnknownScanner(scanner_id))?;
        if cursor.expired() {
            scanners.remove(&scanner_id);
            return Err(Error::LeaseExpired(scanner_id));
        }
        cursor.renew();

        let mut out = Vec::new();
        let start = match &cursor.next_row {
            Some(row) => row.clone(),
            None => return Ok(out),
        };
        let rows = cursor.region.scan_rows(&cursor.columns, &start, cursor.timestamp)?;
        for row in rows.into_iter().take(batch_size) {
            let values = cursor.region.scan_row(&cursor.columns, &row, cursor.timestamp)?;
            out.push((row, values));
        }
        cursor.next_row = out.last().map(|(row, _)| next_row_after(row));
        Ok(out)
    }

    pub fn close(&self, scanner_id: u64) -> Result<()> {
        self.scanners
            .lock()
            .remove(&scanner_id)
            .map(|_| ())
            .ok_or(Error::UnknownScanner(scanner_id))
    }

    pub fn open_count(&self) -> usize {
        self.scanners.lock().len()
    }

    /// Removes and returns the ids of every scanner whose lease lapsed.
    fn sweep(&self) -> Vec<u64> {
        let mut scanners = self.scanners.lock();
        let expired: Vec<u64> = scanners
            .iter()
            .filter(|(_, cursor)| cursor.expired())
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            scanners.remove(id);
        }
        expired
    }
}

fn next_row_after(row: &RowKey) -> RowKey {
    let mut bytes = row.as_bytes().to_vec();
    bytes.push(0);
    RowKey::new(bytes)
}

/// Runs `LeaseManager::sweep` on its own thread at `interval` until told
/// to stop.
pub struct LeaseSweeper {
    stop_requested: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LeaseSweeper {
    pub fn spawn(manager: Arc<LeaseManager>, interval: Duration) -> LeaseSweeper {
        let stop_requested = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop_requested);
        let handle = thread::Builder::new()
            .name("lease-sweeper".to_owned())
            .spawn(move || {
                while !stop_thread.load(Ordering::SeqCst) {
                    let expired = manager.sweep();
                    if !expired.is_empty() {
                        SCANNER_LEASE_EXPIRED_COUNTER
                            .with_label_values(&["lease_timeout"])
                            .inc_by(expired.len() as u64);
                        for id in expired {
                            slog_global::info!("scanner lease expired"; "scanner_id" => id);
                        }
                    }
                    thread::sleep(interval);
                }
            })
            .expect("failed to spawn lease sweeper thread");
        LeaseSweeper {
            stop_requested,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
