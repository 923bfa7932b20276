use std::sync::Arc;

use naofi_fabric::{
    AccessDomain, AddressVector, AvType, CompletionQueue, CqFormat, Endpoint, Fabric,
    FabricError, FabricResult, MemAccess, MemoryRegion, ProviderInfo,
};

use crate::av::InprocAv;
use crate::cq::InprocCq;
use crate::endpoint::InprocEndpoint;
use crate::faults::{FaultPoint, Faults, OpenHandle, Stats};
use crate::network::{Network, RegionTable};
use crate::addr;

/// Shared plumbing every handle of one provider carries.
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) network: Arc<Network>,
    pub(crate) faults: Arc<Faults>,
    pub(crate) stats: Arc<Stats>,
}

pub(crate) struct InprocFabric {
    shared: Shared,
    name: String,
    _handle: OpenHandle,
}

impl InprocFabric {
    pub(crate) fn new(shared: Shared, name: String) -> Self {
        let _handle = OpenHandle::new(&shared.stats);
        Self {
            shared,
            name,
            _handle,
        }
    }
}

impl Fabric for InprocFabric {
    fn open_domain(&self, info: &ProviderInfo) -> FabricResult<Box<dyn AccessDomain>> {
        self.shared.faults.check(FaultPoint::OpenDomain)?;
        tracing::debug!(fabric = %self.name, domain = %info.domain_name, "open domain");
        Ok(Box::new(InprocDomain {
            shared: self.shared.clone(),
            regions: Arc::default(),
            _handle: OpenHandle::new(&self.shared.stats),
        }))
    }
}

pub(crate) struct InprocDomain {
    shared: Shared,
    regions: Arc<RegionTable>,
    _handle: OpenHandle,
}

impl AccessDomain for InprocDomain {
    fn register_memory(
        &self,
        base: u64,
        len: u64,
        access: MemAccess,
        key: u64,
    ) -> FabricResult<Box<dyn MemoryRegion>> {
        self.shared.faults.check(FaultPoint::RegisterMemory)?;
        let id = self.regions.add(key, base, len, access)?;
        Ok(Box::new(InprocMr {
            id,
            key,
            regions: self.regions.clone(),
            _handle: OpenHandle::new(&self.shared.stats),
        }))
    }

    fn open_av(&self, av_type: AvType) -> FabricResult<Arc<dyn AddressVector>> {
        self.shared.faults.check(FaultPoint::OpenAv)?;
        if av_type != AvType::Map {
            return Err(FabricError::InvalidArg(format!("unsupported av type {av_type:?}")));
        }
        Ok(Arc::new(InprocAv::new(&self.shared.stats)))
    }

    fn open_cq(&self, format: CqFormat) -> FabricResult<Arc<dyn CompletionQueue>> {
        self.shared.faults.check(FaultPoint::OpenCq)?;
        if format != CqFormat::Tagged {
            return Err(FabricError::InvalidArg(format!("unsupported cq format {format:?}")));
        }
        Ok(Arc::new(InprocCq::new(&self.shared.stats)))
    }

    fn open_endpoint(&self, info: &ProviderInfo) -> FabricResult<Box<dyn Endpoint>> {
        self.shared.faults.check(FaultPoint::OpenEndpoint)?;
        let src = info
            .src_addr
            .as_deref()
            .and_then(addr::decode)
            .ok_or_else(|| FabricError::InvalidArg("endpoint info has no source address".into()))?;
        let src = if src.port() == 0 {
            std::net::SocketAddrV4::new(*src.ip(), self.shared.network.ephemeral_port())
        } else {
            src
        };
        let raw = addr::encode(src);
        if self.shared.network.is_bound(&raw) {
            return Err(FabricError::Other(format!("address {src} already in use")));
        }
        Ok(Box::new(InprocEndpoint::new(
            self.shared.clone(),
            raw,
            self.regions.clone(),
        )))
    }
}

struct InprocMr {
    id: u64,
    key: u64,
    regions: Arc<RegionTable>,
    _handle: OpenHandle,
}

impl MemoryRegion for InprocMr {
    fn key(&self) -> u64 {
        self.key
    }
}

impl Drop for InprocMr {
    fn drop(&mut self) {
        self.regions.remove(self.id);
    }
}
