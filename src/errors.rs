// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

use std::error;
use std::io;
use std::net;
use std::result;

use quick_error::quick_error;

quick_error! {
    #[derive(Debug)]
    pub enum Error {
        NotServingRegion(region: String) {
            description("region is not served by this server")
            display("NotServingRegion: {} is not online here", region)
        }
        UnknownScanner(scanner_id: u64) {
            description("scanner id is unknown or its lease has expired")
            display("UnknownScanner: {}", scanner_id)
        }
        UnknownLock(lock_id: u64) {
            description("row lock id is unknown")
            display("UnknownLock: {}", lock_id)
        }
        TableNotDisabled(table: String) {
            description("table must be disabled before an online merge")
            display("TableNotDisabled: {}", table)
        }
        RegionServerRunning {
            description("a region service is already running in this process")
            display("RegionServerRunning")
        }
        DroppedSnapshot(region: String) {
            description("a memcache snapshot was written but could not be promoted; WAL replay required")
            display("DroppedSnapshot: region {}, server must restart and replay the WAL", region)
        }
        LeaseExpired(lease_id: u64) {
            description("lease expired before renewal")
            display("LeaseExpired: {}", lease_id)
        }
        Remote(msg: String) {
            description("error reported by a remote peer")
            display("Remote: {}", msg)
        }
        Io(err: io::Error) {
            from()
            cause(err)
            description(err.description())
            display("Io: {}", err)
        }
        AddrParse(err: net::AddrParseError) {
            from()
            cause(err)
            description(err.description())
            display("AddrParse: {}", err)
        }
        Encode(err: Box<bincode::ErrorKind>) {
            from()
            cause(err)
            description("failed to encode a value")
            display("Encode: {}", err)
        }
        Config(msg: String) {
            description("invalid configuration")
            display("Config: {}", msg)
        }
        Other(err: Box<dyn error::Error + Sync + Send>) {
            from()
            cause(err.as_ref())
            description(err.description())
            display("{:?}", err)
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Translates any error into the "server not running" wire answer once the
/// filesystem probe has tripped `fsOk = false`. Chores and RPC handlers both
/// route through this before giving up on a retryable `Io`.
pub fn is_fatal(err: &Error) -> bool {
    matches!(err, Error::DroppedSnapshot(_))
}
