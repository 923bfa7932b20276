use crate::flags::{Capabilities, MsgOrder};

/// Endpoint types. Only reliable datagram endpoints are used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Msg,
    Rdm,
    Dgram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvType {
    Map,
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrMode {
    Basic,
    Scalable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqFormat {
    Context,
    Msg,
    Data,
    Tagged,
}

/// Requirements passed to provider discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoHints {
    pub caps: Capabilities,
    pub ep_type: EndpointType,
    pub msg_order: MsgOrder,
    pub control_progress: ProgressMode,
    pub data_progress: ProgressMode,
    pub av_type: AvType,
    pub mr_mode: MrMode,
}

/// Description of one provider/domain combination, as returned by
/// discovery or address resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub prov_name: String,
    pub fabric_name: String,
    /// Domain name; for NIC-bound providers this is the interface name.
    pub domain_name: String,
    pub caps: Capabilities,
    pub ep_type: EndpointType,
    pub msg_order: MsgOrder,
    pub av_type: AvType,
    pub mr_mode: MrMode,
    pub src_addr: Option<Vec<u8>>,
    pub dest_addr: Option<Vec<u8>>,
}

impl ProviderInfo {
    pub fn src_addrlen(&self) -> usize {
        self.src_addr.as_ref().map_or(0, Vec::len)
    }

    pub fn dest_addrlen(&self) -> usize {
        self.dest_addr.as_ref().map_or(0, Vec::len)
    }

    /// Whether this descriptor satisfies every requirement in `hints`.
    pub fn satisfies(&self, hints: &InfoHints) -> bool {
        self.caps.contains(hints.caps)
            && self.ep_type == hints.ep_type
            && self.msg_order.contains(hints.msg_order)
            && self.av_type == hints.av_type
            && self.mr_mode == hints.mr_mode
    }
}

/// Address resolution request, the `fi_getinfo(node, service, flags, hints)`
/// form used once a provider has been picked.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub node: Option<&'a str>,
    pub service: Option<&'a str>,
    /// Resolve a local source address instead of a destination.
    pub source: bool,
    /// Narrow the result to this provider and domain.
    pub base: Option<&'a ProviderInfo>,
}
