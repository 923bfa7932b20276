use std::fmt;
use std::sync::Arc;

use naofi_fabric::{BindFlags, CompletionQueue, CqFormat, Endpoint as FabricEndpoint, ResolveRequest};
use naofi_types::{make_error_msg, NaCode, Result};

use crate::addr::Addr;
use crate::domain::ProviderType;
use crate::error::FabricContext;
use crate::registry::{DomainRef, FabricRegistry};
use crate::MAX_URI_LEN;

/// One communication endpoint with its completion queue, bound to a shared
/// domain.
pub(crate) struct Endpoint {
    // Drop order: endpoint, completion queue, then the domain reference.
    pub(crate) ep: Box<dyn FabricEndpoint>,
    pub(crate) cq: Arc<dyn CompletionQueue>,
    pub(crate) self_addr: Addr,
    pub(crate) uri: String,
    pub(crate) domain: DomainRef,
}

impl Endpoint {
    pub(crate) fn open(registry: &Arc<FabricRegistry>, protocol: &str, listen: bool) -> Result<Self> {
        let domain = registry.acquire_domain(protocol)?;

        let port = registry.ports().next(listen);
        let service = port.map(|p| p.to_string());
        let ip = registry.config().ip.as_str();
        let info = registry
            .provider()
            .resolve(&ResolveRequest {
                node: Some(ip),
                service: service.as_deref(),
                source: true,
                base: Some(domain.info()),
            })
            .fabric_context("resolve endpoint info")?;

        let ep = domain
            .access()
            .open_endpoint(&info)
            .fabric_context("open endpoint")?;
        let cq = domain
            .access()
            .open_cq(CqFormat::Tagged)
            .fabric_context("open completion queue")?;
        ep.bind_cq(&cq, BindFlags::TRANSMIT | BindFlags::RECV)
            .fabric_context("bind completion queue")?;
        ep.bind_av(domain.av()).fabric_context("bind address vector")?;
        ep.enable().fabric_context("enable endpoint")?;

        let name = ep.name().fabric_context("get endpoint name")?;
        let uri = match (domain.prov_type(), service) {
            (ProviderType::Psm2, Some(service)) => format!("{protocol}://{ip}:{service}"),
            _ => format!("{protocol}://{}", domain.av().straddr(&name)),
        };
        if uri.len() >= MAX_URI_LEN {
            tracing::error!(%uri, "endpoint URI too long");
            return make_error_msg(
                NaCode::PROTOCOL_ERROR,
                format!("URI of {} bytes exceeds {}", uri.len(), MAX_URI_LEN - 1),
            );
        }

        // Inserting our own name lets the self address be used as a target.
        let self_fi_addr = domain.av().insert(&name).fabric_context("insert self address")?;
        let self_addr = Addr::local(self_fi_addr, uri.clone());

        tracing::debug!(%uri, listen, provider = protocol, "endpoint opened");
        Ok(Endpoint {
            ep,
            cq,
            self_addr,
            uri,
            domain,
        })
    }

    /// Render a source address reported by the provider as a URI.
    pub(crate) fn uri_of(&self, fi_addr: naofi_fabric::FiAddr) -> Option<String> {
        let av = self.domain.av();
        match av.lookup(fi_addr) {
            Ok(raw) => Some(format!("{}://{}", self.domain.prov_name(), av.straddr(&raw))),
            Err(err) => {
                tracing::warn!(fi_addr, error = %err, "cannot render source address");
                None
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        tracing::debug!(uri = %self.uri, "endpoint closed");
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("uri", &self.uri)
            .field("domain", &*self.domain)
            .finish()
    }
}
