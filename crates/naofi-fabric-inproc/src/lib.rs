//! In-process fabric provider.
//!
//! Implements the `naofi-fabric` traits without hardware: endpoints of one
//! provider instance exchange tagged messages and RMA transfers through a
//! process-local network keyed by raw address. It advertises `sockets`,
//! `verbs` and `psm2` descriptors with the tagged + RMA + source
//! capabilities, plus a `tcp` descriptor without RMA that capability
//! filtering is expected to reject.
//!
//! Behaviour worth knowing when testing against it:
//! - Sends complete eagerly once the payload is copied out, so a send can
//!   never be canceled at the provider.
//! - Receives report the full sent length even when the posted buffer was
//!   shorter; only the fitting prefix is copied.
//! - Receives from a sender absent from the receiver's address vector
//!   complete with an `AddrNotAvail` error entry carrying the raw source.
//! - [`InprocProvider::faults`] arms one-shot failures and `Again` results.

mod addr;
mod av;
mod cq;
mod domain;
mod endpoint;
mod faults;
mod network;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use naofi_fabric::{
    AvType, Capabilities, EndpointType, Fabric, FabricError, FabricProvider, FabricResult,
    InfoHints, MrMode, MsgOrder, ProviderInfo, ResolveRequest,
};

pub use addr::{decode as decode_addr, encode as encode_addr, RAW_ADDR_LEN};
pub use av::InprocAv;
pub use cq::InprocCq;
pub use faults::{FaultPoint, Faults, Stats};

use crate::domain::{InprocFabric, Shared};
use crate::network::Network;

pub const FABRIC_NAME: &str = "inproc";

/// Domain name advertised by the interface-agnostic `psm2` descriptor.
pub const PSM2_DOMAIN: &str = "hfi1_0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub ip: Ipv4Addr,
}

pub struct InprocProviderBuilder {
    interfaces: Vec<Interface>,
}

impl InprocProviderBuilder {
    pub fn interface(mut self, name: impl Into<String>, ip: Ipv4Addr) -> Self {
        self.interfaces.push(Interface {
            name: name.into(),
            ip,
        });
        self
    }

    pub fn build(self) -> InprocProvider {
        let interfaces = if self.interfaces.is_empty() {
            vec![Interface {
                name: "lo".into(),
                ip: Ipv4Addr::LOCALHOST,
            }]
        } else {
            self.interfaces
        };
        let descriptors = describe(&interfaces);
        InprocProvider {
            interfaces,
            descriptors,
            shared: Shared {
                network: Arc::new(Network::new()),
                faults: Arc::default(),
                stats: Arc::default(),
            },
        }
    }
}

pub struct InprocProvider {
    interfaces: Vec<Interface>,
    descriptors: Vec<ProviderInfo>,
    shared: Shared,
}

impl Default for InprocProvider {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn descriptor(prov_name: &str, domain_name: &str, caps: Capabilities) -> ProviderInfo {
    ProviderInfo {
        prov_name: prov_name.into(),
        fabric_name: FABRIC_NAME.into(),
        domain_name: domain_name.into(),
        caps,
        ep_type: EndpointType::Rdm,
        msg_order: MsgOrder::SAS,
        av_type: AvType::Map,
        mr_mode: MrMode::Scalable,
        src_addr: None,
        dest_addr: None,
    }
}

fn describe(interfaces: &[Interface]) -> Vec<ProviderInfo> {
    let full = Capabilities::TAGGED
        | Capabilities::MSG
        | Capabilities::RMA
        | Capabilities::READ
        | Capabilities::WRITE
        | Capabilities::REMOTE_READ
        | Capabilities::REMOTE_WRITE
        | Capabilities::SOURCE
        | Capabilities::SOURCE_ERR;
    let mut out = Vec::new();
    for iface in interfaces {
        out.push(descriptor("sockets", &iface.name, full));
        out.push(descriptor("verbs", &iface.name, full));
        out.push(descriptor(
            "tcp",
            &iface.name,
            Capabilities::MSG | Capabilities::TAGGED | Capabilities::SOURCE,
        ));
    }
    out.push(descriptor("psm2", PSM2_DOMAIN, full));
    out
}

impl InprocProvider {
    pub fn builder() -> InprocProviderBuilder {
        InprocProviderBuilder {
            interfaces: Vec::new(),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.shared.faults
    }

    pub fn stats(&self) -> &Stats {
        &self.shared.stats
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// IP used for source resolution when no node is given.
    fn default_ip(&self, base: Option<&ProviderInfo>) -> Ipv4Addr {
        base.and_then(|b| self.interfaces.iter().find(|i| i.name == b.domain_name))
            .or_else(|| self.interfaces.first())
            .map_or(Ipv4Addr::LOCALHOST, |i| i.ip)
    }
}

impl FabricProvider for InprocProvider {
    fn get_info(&self, hints: &InfoHints) -> FabricResult<Vec<ProviderInfo>> {
        self.shared.stats.get_info_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.faults.check(FaultPoint::GetInfo)?;
        let found: Vec<_> = self
            .descriptors
            .iter()
            .filter(|d| d.satisfies(hints))
            .cloned()
            .collect();
        if found.is_empty() {
            return Err(FabricError::NotFound("no provider satisfies hints".into()));
        }
        Ok(found)
    }

    fn resolve(&self, req: &ResolveRequest<'_>) -> FabricResult<ProviderInfo> {
        let ip = match req.node {
            Some(node) => node
                .parse::<Ipv4Addr>()
                .map_err(|_| FabricError::NotFound(format!("cannot resolve node {node:?}")))?,
            None if req.source => self.default_ip(req.base),
            None => return Err(FabricError::InvalidArg("destination needs a node".into())),
        };
        let port = match req.service {
            Some(service) => service
                .parse::<u16>()
                .map_err(|_| FabricError::InvalidArg(format!("bad service {service:?}")))?,
            None if req.source => 0,
            None => return Err(FabricError::InvalidArg("destination needs a service".into())),
        };
        let mut info = match req.base {
            Some(base) => base.clone(),
            None => self
                .descriptors
                .first()
                .cloned()
                .ok_or_else(|| FabricError::NotFound("no descriptors".into()))?,
        };
        let raw = addr::encode(SocketAddrV4::new(ip, port));
        if req.source {
            info.src_addr = Some(raw);
        } else {
            info.dest_addr = Some(raw);
        }
        Ok(info)
    }

    fn open_fabric(&self, info: &ProviderInfo) -> FabricResult<Box<dyn Fabric>> {
        self.shared.stats.fabric_opens.fetch_add(1, Ordering::SeqCst);
        self.shared.faults.check(FaultPoint::OpenFabric)?;
        tracing::debug!(provider = %info.prov_name, fabric = %info.fabric_name, "open fabric");
        Ok(Box::new(InprocFabric::new(
            self.shared.clone(),
            info.fabric_name.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use naofi_fabric::{
        AddressVector, BindFlags, CompletionFlags, CompletionQueue, CqFormat, Endpoint,
        IoVec, IoVecMut, MemAccess, ProgressMode, FI_ADDR_UNSPEC,
    };

    fn hints() -> InfoHints {
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

    struct Node {
        ep: Box<dyn Endpoint>,
        cq: Arc<dyn CompletionQueue>,
        av: Arc<dyn AddressVector>,
        _domain: Box<dyn naofi_fabric::AccessDomain>,
        _mr: Box<dyn naofi_fabric::MemoryRegion>,
    }

    fn open_node(provider: &InprocProvider, port: &str) -> Node {
        let infos = provider.get_info(&hints()).unwrap();
        let base = infos.iter().find(|i| i.prov_name == "sockets").unwrap();
        let fabric = provider.open_fabric(base).unwrap();
        let domain = fabric.open_domain(base).unwrap();
        let mr = domain
            .register_memory(
                0,
                u64::MAX,
                MemAccess::REMOTE_READ | MemAccess::REMOTE_WRITE,
                0x0F1B_0F1B,
            )
            .unwrap();
        let av = domain.open_av(AvType::Map).unwrap();
        let cq = domain.open_cq(CqFormat::Tagged).unwrap();
        let info = provider
            .resolve(&ResolveRequest {
                node: Some("127.0.0.1"),
                service: Some(port),
                source: true,
                base: Some(base),
            })
            .unwrap();
        let ep = domain.open_endpoint(&info).unwrap();
        ep.bind_cq(&cq, BindFlags::TRANSMIT | BindFlags::RECV).unwrap();
        ep.bind_av(&av).unwrap();
        ep.enable().unwrap();
        Node {
            ep,
            cq,
            av,
            _domain: domain,
            _mr: mr,
        }
    }

    #[test]
    fn test_get_info_filters_by_capability() {
        let provider = InprocProvider::default();
        let infos = provider.get_info(&hints()).unwrap();
        let names: Vec<_> = infos.iter().map(|i| i.prov_name.as_str()).collect();
        assert_eq!(names, vec!["sockets", "verbs", "psm2"]);
        assert_eq!(provider.stats().get_info_calls(), 1);
    }

    #[test]
    fn test_resolve_destination() {
        let provider = InprocProvider::default();
        let info = provider
            .resolve(&ResolveRequest {
                node: Some("10.1.2.3"),
                service: Some("4000"),
                source: false,
                base: None,
            })
            .unwrap();
        assert_eq!(info.dest_addr, Some(vec![10, 1, 2, 3, 0x0f, 0xa0]));
        assert!(provider
            .resolve(&ResolveRequest {
                node: Some("not-an-ip"),
                service: Some("1"),
                source: false,
                base: None,
            })
            .is_err());
    }

    #[test]
    fn test_tagged_send_recv_with_ignore_mask() {
        let provider = InprocProvider::default();
        let a = open_node(&provider, "5000");
        let b = open_node(&provider, "5001");
        let b_on_a = a.av.insert(&b.ep.name().unwrap()).unwrap();
        let a_on_b = b.av.insert(&a.ep.name().unwrap()).unwrap();

        let mut buf = vec![0u8; 16];
        unsafe {
            b.ep.trecv(IoVecMut::from_slice(&mut buf), FI_ADDR_UNSPEC, 1, 0xFFFF_FFFF, 11)
                .unwrap();
            a.ep.tsend(IoVec::from_slice(b"hello"), b_on_a, 7, 21).unwrap();
        }

        let (send, _) = a.cq.read_from().unwrap();
        assert_eq!(send.context, 21);
        assert!(send.flags.contains(CompletionFlags::SEND));

        let (recv, src) = b.cq.read_from().unwrap();
        assert_eq!(recv.context, 11);
        assert_eq!(recv.len, 5);
        assert_eq!(recv.tag, 7);
        assert_eq!(src, a_on_b);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_send_completion_fault_queues_error_entry() {
        let provider = InprocProvider::default();
        let a = open_node(&provider, "5050");
        let b = open_node(&provider, "5051");
        let b_on_a = a.av.insert(&b.ep.name().unwrap()).unwrap();

        provider.faults().arm(FaultPoint::SendCompletion);
        unsafe {
            a.ep.tsend(IoVec::from_slice(b"one"), b_on_a, 1, 31).unwrap();
            a.ep.tsend(IoVec::from_slice(b"two"), b_on_a, 1, 32).unwrap();
        }
        assert_eq!(a.cq.read_from(), Err(FabricError::Avail));
        let err = a.cq.read_err().unwrap();
        assert_eq!(err.context, 31);
        assert!(matches!(err.err, FabricError::Other(_)));
        let (send, _) = a.cq.read_from().unwrap();
        assert_eq!(send.context, 32);
    }

    #[test]
    fn test_unknown_sender_reports_addr_not_avail() {
        let provider = InprocProvider::default();
        let a = open_node(&provider, "5100");
        let b = open_node(&provider, "5101");
        let b_on_a = a.av.insert(&b.ep.name().unwrap()).unwrap();

        let mut buf = vec![0u8; 4];
        unsafe {
            a.ep.tsend(IoVec::from_slice(b"abcdef"), b_on_a, 3, 1).unwrap();
            b.ep.trecv(IoVecMut::from_slice(&mut buf), FI_ADDR_UNSPEC, 0, u64::MAX, 2)
                .unwrap();
        }
        assert_eq!(b.cq.read_from(), Err(FabricError::Avail));
        let err = b.cq.read_err().unwrap();
        assert_eq!(err.err, FabricError::AddrNotAvail);
        assert_eq!(err.err_data, a.ep.name().unwrap());
        assert_eq!(err.len, 6);
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_cancel_posted_recv() {
        let provider = InprocProvider::default();
        let a = open_node(&provider, "5200");
        let mut buf = vec![0u8; 4];
        unsafe {
            a.ep.trecv(IoVecMut::from_slice(&mut buf), FI_ADDR_UNSPEC, 0, 0, 9)
                .unwrap();
        }
        a.ep.cancel(9).unwrap();
        assert!(matches!(a.ep.cancel(9), Err(FabricError::NotFound(_))));
        let err = a.cq.read_err().unwrap();
        assert_eq!(err.context, 9);
        assert_eq!(err.err, FabricError::Canceled);
    }

    #[test]
    fn test_rma_write_and_read() {
        let provider = InprocProvider::default();
        let a = open_node(&provider, "5300");
        let b = open_node(&provider, "5301");
        let b_on_a = a.av.insert(&b.ep.name().unwrap()).unwrap();

        let mut target = vec![0u8; 8];
        let mut back = vec![0u8; 8];
        unsafe {
            a.ep.write(
                IoVec::from_slice(b"rma-data"),
                b_on_a,
                target.as_mut_ptr() as u64,
                0x0F1B_0F1B,
                1,
            )
            .unwrap();
            a.ep.read(
                IoVecMut::from_slice(&mut back),
                b_on_a,
                target.as_ptr() as u64,
                0x0F1B_0F1B,
                2,
            )
            .unwrap();
        }
        assert_eq!(&target, b"rma-data");
        assert_eq!(&back, b"rma-data");

        let bad = unsafe {
            a.ep.write(IoVec::from_slice(b"x"), b_on_a, target.as_mut_ptr() as u64, 1, 3)
        };
        assert!(matches!(bad, Err(FabricError::Access(_))));
    }

    #[test]
    fn test_again_injection_and_handle_accounting() {
        let provider = InprocProvider::default();
        {
            let a = open_node(&provider, "5400");
            provider.faults().inject_again(1);
            let mut buf = [0u8; 1];
            let first = unsafe {
                a.ep.trecv(IoVecMut::from_slice(&mut buf), FI_ADDR_UNSPEC, 0, 0, 1)
            };
            assert_eq!(first, Err(FabricError::Again));
            assert!(provider.stats().open_handles() > 0);
        }
        assert_eq!(provider.stats().open_handles(), 0);
    }

    #[test]
    fn test_duplicate_bind_rejected() {
        let provider = InprocProvider::default();
        let _a = open_node(&provider, "5500");
        let infos = provider.get_info(&hints()).unwrap();
        let fabric = provider.open_fabric(&infos[0]).unwrap();
        let domain = fabric.open_domain(&infos[0]).unwrap();
        let info = provider
            .resolve(&ResolveRequest {
                node: Some("127.0.0.1"),
                service: Some("5500"),
                source: true,
                base: Some(&infos[0]),
            })
            .unwrap();
        assert!(domain.open_endpoint(&info).is_err());
    }
}
