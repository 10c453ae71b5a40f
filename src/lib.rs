// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! A region server for a range-partitioned, log-structured table store:
//! each server hosts a set of non-overlapping key-range regions, each
//! backed by a memcache and an ordered run of on-disk store files, all
//! writes going through one shared write-ahead log first.

pub mod catalog;
pub mod chore;
pub mod config;
pub mod errors;
pub mod fs_probe;
pub mod keys;
pub mod lease;
pub mod master;
pub mod merge;
pub mod metrics;
pub mod region;
pub mod registry;
pub mod server;
pub mod store;
pub mod wal;

pub use catalog::RegionInfo;
pub use config::Config;
pub use errors::{Error, Result};
pub use region::Region;
pub use server::{RegionServer, RunningServer};

/// Sets up the process-wide `slog_global` logger: a term-formatted drain
/// wrapped in an async buffer, so logging calls on hot paths (WAL append,
/// commit) never block on stdout.
pub fn init_logger(level: slog::Level) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = slog::Logger::root(drain, slog::o!());
    slog_global::set_global(logger);
}
