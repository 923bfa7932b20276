//! Opened provider resources shared by every endpoint on one
//! (provider, interface) pair.

use std::fmt;
use std::sync::Arc;

use naofi_fabric::{
    AccessDomain, AddressVector, AvType, Fabric, FabricProvider, MemAccess, MemoryRegion,
    ProviderInfo, ResolveRequest,
};
use naofi_types::{make_error_msg, NaCode, Result};

use crate::config::NodeEntry;
use crate::error::FabricContext;
use crate::RMA_KEY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    Sockets,
    Verbs,
    Psm2,
}

impl ProviderType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sockets" => Some(ProviderType::Sockets),
            "verbs" => Some(ProviderType::Verbs),
            "psm2" => Some(ProviderType::Psm2),
            _ => None,
        }
    }

    /// psm2 domains serve any interface.
    pub fn is_interface_agnostic(self) -> bool {
        self == ProviderType::Psm2
    }
}

/// Open fabric, access domain, all-memory region and address vector for
/// one provider descriptor.
pub struct Domain {
    // Fields drop in declaration order: memory region and address vector
    // first, then the access domain, then the fabric.
    mr: Box<dyn MemoryRegion>,
    av: Arc<dyn AddressVector>,
    access: Box<dyn AccessDomain>,
    _fabric: Box<dyn Fabric>,
    prov_type: ProviderType,
    info: ProviderInfo,
}

impl Domain {
    /// Open every handle for `info`. A failure closes whatever was already
    /// opened before returning.
    pub(crate) fn open(
        provider: &dyn FabricProvider,
        info: &ProviderInfo,
        node_list: &[NodeEntry],
    ) -> Result<Domain> {
        let Some(prov_type) = ProviderType::from_name(&info.prov_name) else {
            tracing::error!(provider = %info.prov_name, "unsupported provider");
            return make_error_msg(
                NaCode::PROTOCOL_ERROR,
                format!("unsupported provider {}", info.prov_name),
            );
        };

        let fabric = provider.open_fabric(info).fabric_context("open fabric")?;
        let access = fabric.open_domain(info).fabric_context("open access domain")?;
        let mr = access
            .register_memory(
                0,
                u64::MAX,
                MemAccess::REMOTE_READ | MemAccess::REMOTE_WRITE,
                RMA_KEY,
            )
            .fabric_context("register memory region")?;
        let av = access.open_av(AvType::Map).fabric_context("open address vector")?;

        if !prov_type.is_interface_agnostic() {
            for node in node_list {
                let resolved = provider
                    .resolve(&ResolveRequest {
                        node: Some(&node.host),
                        service: Some(&node.service),
                        source: false,
                        base: Some(info),
                    })
                    .fabric_context("resolve node list entry")?;
                let Some(raw) = resolved.dest_addr else {
                    return make_error_msg(
                        NaCode::PROTOCOL_ERROR,
                        format!("no address for {}:{}", node.host, node.service),
                    );
                };
                av.insert(&raw).fabric_context("insert node list entry")?;
            }
        }

        tracing::debug!(
            provider = %info.prov_name,
            domain = %info.domain_name,
            nodes = node_list.len(),
            "domain opened"
        );
        Ok(Domain {
            mr,
            av,
            access,
            _fabric: fabric,
            prov_type,
            info: info.clone(),
        })
    }

    pub fn prov_type(&self) -> ProviderType {
        self.prov_type
    }

    pub fn prov_name(&self) -> &str {
        &self.info.prov_name
    }

    pub fn domain_name(&self) -> &str {
        &self.info.domain_name
    }

    pub fn info(&self) -> &ProviderInfo {
        &self.info
    }

    pub fn rma_key(&self) -> u64 {
        self.mr.key()
    }

    pub fn av(&self) -> &Arc<dyn AddressVector> {
        &self.av
    }

    pub(crate) fn access(&self) -> &dyn AccessDomain {
        self.access.as_ref()
    }

    /// Whether an endpoint asking for `prov_name` on `interface` can share
    /// this domain.
    pub(crate) fn serves(&self, prov_name: &str, interface: &str) -> bool {
        self.info.prov_name == prov_name
            && (self.prov_type.is_interface_agnostic() || self.info.domain_name == interface)
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        tracing::debug!(
            provider = %self.info.prov_name,
            domain = %self.info.domain_name,
            "domain closed"
        );
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("provider", &self.info.prov_name)
            .field("domain", &self.info.domain_name)
            .field("type", &self.prov_type)
            .finish()
    }
}
