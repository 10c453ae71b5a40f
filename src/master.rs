// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! Talks to the cluster coordinator: one startup call, then a heartbeat
//! every `msginterval`. The outbound report buffer is swapped atomically
//! so chores can append events (opens, closes, splits) between heartbeats
//! without blocking on the network call. Instructions that come back ride
//! a bounded channel drained by a single worker thread, so a burst of
//! instructions never piles up handler threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};

use crate::catalog::RegionInfo;
use crate::config::Config;
use crate::errors::{Error, Result};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One fact this server wants the coordinator to know about, collected
/// between heartbeats and flushed on the next one.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReportEvent {
    Opened(RegionInfo),
    Closed(String),
    Split { parent: String, left: RegionInfo, right: RegionInfo },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerReport {
    pub server_name: String,
    pub start_code: u64,
    pub events: Vec<ReportEvent>,
}

/// An instruction the coordinator sends back on a heartbeat reply.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Instruction {
    OpenRegion(RegionInfo),
    CloseRegion(String),
    /// Close without telling the coordinator: used when the coordinator
    /// already knows, e.g. it issued the close itself.
    CloseRegionWithoutReport(String),
    /// Stop this server's background threads, same as a local `stop` call.
    Stop,
    /// Re-run the startup handshake and fold in whatever overrides come
    /// back, without restarting the process.
    CallServerStartup,
}

/// The network boundary. A real implementation would carry an RPC client;
/// tests and the in-process wiring use an in-memory stand-in.
pub trait MasterClient: Send + Sync {
    fn startup(&self, server_name: &str, start_code: u64) -> Result<HashMap<String, String>>;
    fn heartbeat(&self, report: &ServerReport) -> Result<Vec<Instruction>>;
}

/// Applies instructions drained from the inbound queue. `RegionServer`
/// implements this; kept as a trait so the heartbeat machinery doesn't
/// need a concrete back-reference.
pub trait InstructionHandler: Send + Sync {
    fn apply(&self, instruction: Instruction) -> Result<()>;
}

struct Outbound {
    buffer: Mutex<Vec<ReportEvent>>,
}

impl Outbound {
    fn new() -> Outbound {
        Outbound {
            buffer: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, event: ReportEvent) {
        self.buffer.lock().push(event);
    }

    fn swap(&self) -> Vec<ReportEvent> {
        std::mem::take(&mut *self.buffer.lock())
    }
}

/// Shared handle chores use to record events destined for the next
/// heartbeat, without depending on the heartbeat loop itself.
pub struct MasterHandle {
    outbound: Outbound,
}

impl MasterHandle {
    pub fn new() -> MasterHandle {
        MasterHandle {
            outbound: Outbound::new(),
        }
    }

    pub fn report_split(&self, parent: &str, left: RegionInfo, right: RegionInfo) {
        self.outbound.push(ReportEvent::Split {
            parent: parent.to_owned(),
            left,
            right,
        });
    }

    pub fn report_opened(&self, info: RegionInfo) {
        self.outbound.push(ReportEvent::Opened(info));
    }

    pub fn report_closed(&self, name: &str) {
        self.outbound.push(ReportEvent::Closed(name.to_owned()));
    }
}

impl Default for MasterHandle {
    fn default() -> Self {
        MasterHandle::new()
    }
}

/// Calls the coordinator's startup RPC once, up front. The returned
/// override map is applied to the server's `Config` by the caller before
/// any chore or `HeartbeatService` starts, so the rest of the server sees
/// the coordinator's values from the first tick onward.
pub fn startup(client: &dyn MasterClient, server_name: &str, start_code: u64) -> Result<HashMap<String, String>> {
    client.startup(server_name, start_code)
}

/// Runs the heartbeat/instruction loop on two background threads until
/// `stop_requested` is set or the master lease expires, at which point the
/// server commits suicide (`abort_requested`). Expects `startup` to have
/// already run and its overrides to already be folded into `config`.
pub struct HeartbeatService {
    heartbeat_thread: Option<JoinHandle<()>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl HeartbeatService {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        client: Arc<dyn MasterClient>,
        handler: Arc<dyn InstructionHandler>,
        handle: Arc<MasterHandle>,
        config: Arc<Config>,
        server_name: String,
        start_code: u64,
        stop_requested: Arc<AtomicBool>,
        abort_requested: Arc<AtomicBool>,
    ) -> Result<HeartbeatService> {
        let config_mut = config;

        let (tx, rx): (Sender<(Instruction, u32)>, Receiver<(Instruction, u32)>) = bounded(1024);
        let last_success_ms = Arc::new(AtomicU64::new(now_ms()));

        let worker_thread = {
            let stop_requested = Arc::clone(&stop_requested);
            let retries_budget = config_mut.client_retries_number;
            let retry_tx = tx.clone();
            thread::Builder::new()
                .name("instruction-worker".to_owned())
                .spawn(move || {
                    while !stop_requested.load(Ordering::SeqCst) {
                        match rx.recv_timeout(Duration::from_millis(250)) {
                            Ok((instruction, attempt)) => {
                                if let Err(e) = handler.apply(instruction.clone()) {
                                    let is_io = matches!(e, Error::Io(_));
                                    if is_io && attempt < retries_budget {
                                        slog_global::warn!(
                                            "instruction failed with an io error, re-enqueuing";
                                            "attempt" => attempt, "err" => format!("{}", e)
                                        );
                                        if retry_tx.try_send((instruction, attempt + 1)).is_err() {
                                            slog_global::warn!("instruction queue full, dropping retried instruction");
                                        }
                                    } else {
                                        slog_global::warn!(
                                            "giving up on instruction";
                                            "attempt" => attempt, "err" => format!("{}", e)
                                        );
                                    }
                                }
                            }
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })
                .expect("failed to spawn instruction worker thread")
        };

        let heartbeat_thread = {
            let stop_requested = Arc::clone(&stop_requested);
            let last_success_ms = Arc::clone(&last_success_ms);
            let period = config_mut.msginterval();
            let lease = config_mut.master_lease_period();
            let retries_budget = config_mut.client_retries_number;
            thread::Builder::new()
                .name("heartbeat".to_owned())
                .spawn(move || {
                    let mut failures = 0u32;
                    while !stop_requested.load(Ordering::SeqCst) {
                        let report = ServerReport {
                            server_name: server_name.clone(),
                            start_code,
                            events: handle.outbound.swap(),
                        };
                        let hb_start = std::time::Instant::now();
                        let outcome = client.heartbeat(&report);
                        let label = if outcome.is_ok() { "ok" } else { "err" };
                        crate::metrics::HEARTBEAT_DURATION_HISTOGRAM
                            .with_label_values(&[label])
                            .observe(hb_start.elapsed().as_secs_f64());
                        match outcome {
                            Ok(instructions) => {
                                failures = 0;
                                last_success_ms.store(now_ms(), Ordering::SeqCst);
                                for instruction in instructions {
                                    if tx.try_send((instruction, 0)).is_err() {
                                        slog_global::warn!("instruction queue full, dropping instruction");
                                    }
                                }
                            }
                            Err(e) => {
                                failures += 1;
                                slog_global::warn!("heartbeat failed"; "failures" => failures, "err" => format!("{}", e));
                            }
                        }

                        let elapsed = now_ms().saturating_sub(last_success_ms.load(Ordering::SeqCst));
                        if elapsed > lease.as_millis() as u64 || failures > retries_budget {
                            slog_global::error!("master lease expired, committing suicide");
                            abort_requested.store(true, Ordering::SeqCst);
                            stop_requested.store(true, Ordering::SeqCst);
                            break;
                        }
                        thread::sleep(period);
                    }
                })
                .expect("failed to spawn heartbeat thread")
        };

        Ok(HeartbeatService {
            heartbeat_thread: Some(heartbeat_thread),
            worker_thread: Some(worker_thread),
        })
    }

    pub fn join(mut self) {
        if let Some(t) = self.heartbeat_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.worker_thread.take() {
            let _ = t.join();
        }
    }
}

/// An in-memory `MasterClient` for tests and single-process demos: always
/// succeeds startup with no overrides, and never sends instructions back.
pub struct NullMasterClient;

impl MasterClient for NullMasterClient {
    fn startup(&self, _server_name: &str, _start_code: u64) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    fn heartbeat(&self, _report: &ServerReport) -> Result<Vec<Instruction>> {
        Ok(Vec::new())
    }
}

/// Fails every heartbeat; used to exercise lease-expiry "commit suicide".
pub struct AlwaysFailMasterClient;

impl MasterClient for AlwaysFailMasterClient {
    fn startup(&self, _server_name: &str, _start_code: u64) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    fn heartbeat(&self, _report: &ServerReport) -> Result<Vec<Instruction>> {
        Err(Error::Remote("simulated master unavailability".to_owned()))
    }
}
