// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

//! The set of online regions, keyed by name, plus the retiring set for
//! in-flight closes.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::{Error, Result};
use crate::region::Region;

/// Guarded by a single readers-writer lock per map. A name is in at most
/// one of the two maps.
pub struct RegionRegistry {
    online: RwLock<BTreeMap<String, Arc<Region>>>,
    retiring: RwLock<BTreeMap<String, Arc<Region>>>,
}

impl RegionRegistry {
    pub fn new() -> RegionRegistry {
        RegionRegistry {
            online: RwLock::new(BTreeMap::new()),
            retiring: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn lookup(&self, name: &str, include_retiring: bool) -> Result<Arc<Region>> {
        if let Some(region) = self.online.read().get(name) {
            return Ok(Arc::clone(region));
        }
        if include_retiring {
            if let Some(region) = self.retiring.read().get(name) {
                return Ok(Arc::clone(region));
            }
        }
        Err(Error::NotServingRegion(name.to_owned()))
    }

    pub fn open(&self, region: Arc<Region>) -> Result<()> {
        let name = region.name();
        let mut online = self.online.write();
        if online.contains_key(&name) || self.retiring.read().contains_key(&name) {
            return Err(Error::Config(format!("region {} is already registered", name)));
        }
        online.insert(name, region);
        Ok(())
    }

    /// Moves a region from online to retiring; it answers reads only until
    /// `end_close` evicts it once pending RPCs drain.
    pub fn begin_close(&self, name: &str) -> Result<Arc<Region>> {
        let region = self
            .online
            .write()
            .remove(name)
            .ok_or_else(|| Error::NotServingRegion(name.to_owned()))?;
        self.retiring.write().insert(name.to_owned(), Arc::clone(&region));
        Ok(region)
    }

    pub fn end_close(&self, name: &str) {
        self.retiring.write().remove(name);
    }

    /// Snapshots the online regions under the read lock, then releases it.
    /// Chores must not hold the registry lock across I/O.
    pub fn snapshot_online(&self) -> Vec<Arc<Region>> {
        self.online.read().values().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.online.read().len()
    }

    pub fn retiring_count(&self) -> usize {
        self.retiring.read().len()
    }
}

impl Default for RegionRegistry {
    fn default() -> Self {
        RegionRegistry::new()
    }
}
