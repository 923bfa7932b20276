//! Process-scoped fabric state: the discovered provider list and the set of
//! open domains.
//!
//! Lifecycle:
//! - The first `discover` queries the provider; concurrent callers block on
//!   a condition variable until the result is published. A failed query
//!   leaves the registry undiscovered and fails every waiter.
//! - Each open domain holds one registry reference. When the last domain
//!   closes the cached provider list is dropped, so the next discovery
//!   queries again.
//! - `shutdown` drops the cached list explicitly and refuses while domains
//!   are open.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::Arc;

use naofi_fabric::{
    AvType, Capabilities, EndpointType, FabricProvider, InfoHints, MrMode, MsgOrder,
    ProgressMode, ProviderInfo,
};
use parking_lot::{Condvar, Mutex};

use naofi_types::{make_error_msg, NaCode, Result, Status};

use crate::config::{load_node_list, OfiConfig, PortAllocator};
use crate::domain::{Domain, ProviderType};
use crate::error::FabricContext;

/// Requirements every usable provider must meet.
pub fn discovery_hints() -> InfoHints {
    InfoHints {
        caps: Capabilities::TAGGED | Capabilities::RMA | Capabilities::SOURCE,
        ep_type: EndpointType::Rdm,
        msg_order: MsgOrder::SAS,
        control_progress: ProgressMode::Manual,
        data_progress: ProgressMode::Manual,
        av_type: AvType::Map,
        mr_mode: MrMode::Scalable,
    }
}

enum Discovery {
    Idle,
    Running,
    Ready(Arc<Vec<ProviderInfo>>),
}

struct DomainSlot {
    domain: Arc<Domain>,
    refs: usize,
}

struct RegistryState {
    discovery: Discovery,
    /// Finished discovery attempts, successful or not.
    attempts: u64,
    /// One per open domain.
    refcount: usize,
    domains: Vec<DomainSlot>,
}

pub struct FabricRegistry {
    provider: Arc<dyn FabricProvider>,
    config: OfiConfig,
    ports: PortAllocator,
    state: Mutex<RegistryState>,
    discovered: Condvar,
}

impl FabricRegistry {
    pub fn new(provider: Arc<dyn FabricProvider>, config: OfiConfig) -> Arc<Self> {
        let ports = PortAllocator::new(&config);
        Arc::new(Self {
            provider,
            config,
            ports,
            state: Mutex::new(RegistryState {
                discovery: Discovery::Idle,
                attempts: 0,
                refcount: 0,
                domains: Vec::new(),
            }),
            discovered: Condvar::new(),
        })
    }

    pub fn config(&self) -> &OfiConfig {
        &self.config
    }

    pub(crate) fn provider(&self) -> &dyn FabricProvider {
        self.provider.as_ref()
    }

    pub(crate) fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Providers meeting [`discovery_hints`], queried at most once per
    /// registry lifetime.
    pub fn discover(&self) -> Result<Arc<Vec<ProviderInfo>>> {
        let mut state = self.state.lock();
        loop {
            if let Discovery::Ready(list) = &state.discovery {
                return Ok(list.clone());
            }
            if matches!(state.discovery, Discovery::Idle) {
                break;
            }
            let attempt = state.attempts;
            while matches!(state.discovery, Discovery::Running) {
                self.discovered.wait(&mut state);
            }
            if matches!(state.discovery, Discovery::Idle) && state.attempts != attempt {
                return make_error_msg(NaCode::PROTOCOL_ERROR, "provider discovery failed");
            }
        }
        state.discovery = Discovery::Running;
        drop(state);

        let result = self
            .provider
            .get_info(&discovery_hints())
            .fabric_context("provider discovery");

        let mut state = self.state.lock();
        state.attempts += 1;
        let out = match result {
            Ok(list) => {
                tracing::debug!(providers = list.len(), "providers discovered");
                let list = Arc::new(list);
                state.discovery = Discovery::Ready(list.clone());
                Ok(list)
            }
            Err(status) => {
                state.discovery = Discovery::Idle;
                Err(status)
            }
        };
        drop(state);
        self.discovered.notify_all();
        out
    }

    /// Whether some discovered provider is named `protocol`.
    pub fn check_protocol(&self, protocol: &str) -> bool {
        let found = match self.discover() {
            Ok(list) => list.iter().any(|info| info.prov_name == protocol),
            Err(status) => {
                tracing::warn!(%status, "cannot probe protocol {protocol}");
                false
            }
        };
        self.release_if_unused();
        found
    }

    /// Find or open the domain for `prov_name` on the configured interface.
    pub fn acquire_domain(self: &Arc<Self>, prov_name: &str) -> Result<DomainRef> {
        let interface = self.config.interface.as_str();
        loop {
            let providers = self.discover()?;
            let mut state = self.state.lock();
            if !matches!(state.discovery, Discovery::Ready(_)) {
                // Torn down between discovery and locking; discover again.
                continue;
            }

            if let Some(slot) = state
                .domains
                .iter_mut()
                .find(|slot| slot.domain.serves(prov_name, interface))
            {
                slot.refs += 1;
                return Ok(DomainRef::new(self.clone(), slot.domain.clone()));
            }

            let opened = self.open_domain(&providers, prov_name, interface);
            let domain = match opened {
                Ok(domain) => Arc::new(domain),
                Err(status) => {
                    // Nothing else holds the provider list; do not keep it.
                    if state.refcount == 0 {
                        state.discovery = Discovery::Idle;
                    }
                    return Err(status);
                }
            };
            state.domains.push(DomainSlot {
                domain: domain.clone(),
                refs: 1,
            });
            state.refcount += 1;
            return Ok(DomainRef::new(self.clone(), domain));
        }
    }

    /// Open a new domain for `prov_name`. Called with the registry lock held
    /// so a concurrent caller finds this domain instead of opening another.
    fn open_domain(&self, providers: &[ProviderInfo], prov_name: &str, interface: &str) -> Result<Domain> {
        let agnostic = ProviderType::from_name(prov_name).is_some_and(ProviderType::is_interface_agnostic);
        let Some(info) = providers
            .iter()
            .find(|info| info.prov_name == prov_name && (agnostic || info.domain_name == interface))
        else {
            tracing::error!(provider = prov_name, interface, "no matching provider");
            return make_error_msg(
                NaCode::PROTOCOL_ERROR,
                format!("no provider {prov_name} on interface {interface}"),
            );
        };
        let node_list = match &self.config.node_list_file {
            Some(path) => load_node_list(path).map_err(Status::from)?,
            None => Vec::new(),
        };
        Domain::open(self.provider(), info, &node_list)
    }

    fn release_domain(&self, domain: Arc<Domain>) {
        let mut state = self.state.lock();
        let Some(i) = state
            .domains
            .iter()
            .position(|slot| Arc::ptr_eq(&slot.domain, &domain))
        else {
            tracing::error!(?domain, "releasing a domain the registry does not hold");
            return;
        };
        state.domains[i].refs -= 1;
        if state.domains[i].refs > 0 {
            return;
        }
        let slot = state.domains.remove(i);
        // Last references: the domain closes here, under the lock.
        drop(slot);
        drop(domain);
        state.refcount -= 1;
        if state.refcount == 0 {
            state.discovery = Discovery::Idle;
            tracing::debug!("last domain closed, provider list released");
        }
    }

    fn release_if_unused(&self) {
        let mut state = self.state.lock();
        if state.refcount == 0 && matches!(state.discovery, Discovery::Ready(_)) {
            state.discovery = Discovery::Idle;
        }
    }

    /// Drop the cached provider list. Fails while any domain is open.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.domains.is_empty() {
            return make_error_msg(
                NaCode::PROTOCOL_ERROR,
                format!("{} domain(s) still open", state.domains.len()),
            );
        }
        if matches!(state.discovery, Discovery::Ready(_)) {
            state.discovery = Discovery::Idle;
        }
        Ok(())
    }

    pub fn is_discovered(&self) -> bool {
        matches!(self.state.lock().discovery, Discovery::Ready(_))
    }

    pub fn refcount(&self) -> usize {
        self.state.lock().refcount
    }

    pub fn domain_count(&self) -> usize {
        self.state.lock().domains.len()
    }

    fn domain_refs(&self, domain: &Arc<Domain>) -> usize {
        self.state
            .lock()
            .domains
            .iter()
            .find(|slot| Arc::ptr_eq(&slot.domain, domain))
            .map_or(0, |slot| slot.refs)
    }
}

/// A counted reference to a shared domain. Dropping it releases the
/// reference; the last release closes the domain.
pub struct DomainRef {
    registry: Arc<FabricRegistry>,
    domain: ManuallyDrop<Arc<Domain>>,
}

impl DomainRef {
    fn new(registry: Arc<FabricRegistry>, domain: Arc<Domain>) -> Self {
        Self {
            registry,
            domain: ManuallyDrop::new(domain),
        }
    }

    /// Endpoints currently sharing this domain.
    pub fn refcount(&self) -> usize {
        self.registry.domain_refs(&self.domain)
    }

    pub fn ptr_eq(a: &DomainRef, b: &DomainRef) -> bool {
        Arc::ptr_eq(&a.domain, &b.domain)
    }

    pub fn registry(&self) -> &Arc<FabricRegistry> {
        &self.registry
    }
}

impl Deref for DomainRef {
    type Target = Domain;

    fn deref(&self) -> &Domain {
        &self.domain
    }
}

impl fmt::Debug for DomainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainRef").field("domain", &*self.domain).finish()
    }
}

impl Drop for DomainRef {
    fn drop(&mut self) {
        // SAFETY: `domain` is never touched again after this take.
        let domain = unsafe { ManuallyDrop::take(&mut self.domain) };
        self.registry.release_domain(domain);
    }
}
