// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! A cheap filesystem health check: write and read back a small marker
//! file under the configured root directory. Any chore or RPC handler
//! that sees an `Io` error it cannot otherwise explain calls this before
//! deciding whether to keep retrying or to give up and abort.

use std::fs;
use std::path::PathBuf;

use crate::errors::Result;

pub struct FsProbe {
    path: PathBuf,
}

impl FsProbe {
    pub fn new(root: PathBuf) -> FsProbe {
        FsProbe {
            path: root.join(".fs_probe"),
        }
    }

    /// Writes and reads back a marker file. An `Err` here means the
    /// filesystem backing this server is no longer usable.
    pub fn check(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, b"ok")?;
        let data = fs::read(&self.path)?;
        if data != b"ok" {
            return Err(crate::errors::Error::Config("filesystem probe read back unexpected contents".to_owned()));
        }
        Ok(())
    }
}
