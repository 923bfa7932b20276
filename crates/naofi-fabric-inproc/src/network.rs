//! Process-local wire: every enabled endpoint of one provider, keyed by raw
//! address, plus the registered memory of every access domain.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use naofi_fabric::{FabricError, FabricResult, MemAccess};
use parking_lot::Mutex;

use crate::endpoint::EndpointCore;

const EPHEMERAL_PORT_BASE: u16 = 49152;

pub(crate) struct Network {
    endpoints: DashMap<Vec<u8>, Arc<EndpointCore>>,
    next_port: AtomicU16,
}

impl Network {
    pub(crate) fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
            next_port: AtomicU16::new(EPHEMERAL_PORT_BASE),
        }
    }

    pub(crate) fn ephemeral_port(&self) -> u16 {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        if port == u16::MAX {
            self.next_port.store(EPHEMERAL_PORT_BASE, Ordering::Relaxed);
        }
        port
    }

    pub(crate) fn is_bound(&self, raw: &[u8]) -> bool {
        self.endpoints.contains_key(raw)
    }

    pub(crate) fn bind(&self, core: Arc<EndpointCore>) -> FabricResult<()> {
        match self.endpoints.entry(core.addr.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(FabricError::Other(format!(
                "address {} already in use",
                crate::addr::render(&core.addr)
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(core);
                Ok(())
            }
        }
    }

    pub(crate) fn unbind(&self, raw: &[u8]) {
        self.endpoints.remove(raw);
    }

    pub(crate) fn peer(&self, raw: &[u8]) -> FabricResult<Arc<EndpointCore>> {
        self.endpoints
            .get(raw)
            .map(|e| e.value().clone())
            .ok_or_else(|| FabricError::Unreachable(crate::addr::render(raw)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Region {
    id: u64,
    key: u64,
    base: u64,
    len: u64,
    access: MemAccess,
}

/// Memory registered on one access domain.
#[derive(Debug, Default)]
pub(crate) struct RegionTable {
    regions: Mutex<Vec<Region>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl RegionTable {
    pub(crate) fn add(&self, key: u64, base: u64, len: u64, access: MemAccess) -> FabricResult<u64> {
        let mut regions = self.regions.lock();
        if regions.iter().any(|r| r.key == key) {
            return Err(FabricError::InvalidArg(format!("key {key:#x} already registered")));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        regions.push(Region {
            id,
            key,
            base,
            len,
            access,
        });
        Ok(id)
    }

    pub(crate) fn remove(&self, id: u64) {
        self.regions.lock().retain(|r| r.id != id);
    }

    /// Check that `[addr, addr + len)` lies in a region registered under
    /// `key` with `access`.
    pub(crate) fn check(&self, key: u64, addr: u64, len: usize, access: MemAccess) -> FabricResult<()> {
        let end = addr
            .checked_add(len as u64)
            .ok_or_else(|| FabricError::Access(format!("range {addr:#x}+{len} overflows")))?;
        let regions = self.regions.lock();
        let region = regions
            .iter()
            .find(|r| r.key == key)
            .ok_or_else(|| FabricError::Access(format!("no region for key {key:#x}")))?;
        if !region.access.contains(access) {
            return Err(FabricError::Access(format!(
                "key {key:#x} does not grant {access:?}"
            )));
        }
        if addr < region.base || end > region.base.saturating_add(region.len) {
            return Err(FabricError::Access(format!(
                "range {addr:#x}..{end:#x} outside key {key:#x}"
            )));
        }
        Ok(())
    }
}
