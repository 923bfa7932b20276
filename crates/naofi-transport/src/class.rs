//! The plugin instance and its operation set.

use std::fmt;
use std::sync::Arc;

use naofi_fabric::ResolveRequest;
use naofi_types::{make_error_msg, NaCode, Result, Status};

use crate::addr::Addr;
use crate::completion::{Callback, CompletionSink};
use crate::endpoint::Endpoint;
use crate::error::{FabricContext, FinalizeError};
use crate::op::{OpId, OpTable, Payload};
use crate::progress::Outcome;
use crate::registry::{DomainRef, FabricRegistry};
use crate::{MAX_EXPECTED_SIZE, MAX_TAG, MAX_UNEXPECTED_SIZE};

/// One transport instance over one fabric endpoint.
pub struct NaOfiClass {
    // The provider endpoint must close before `ops` releases the buffers it
    // may still reference.
    pub(crate) endpoint: Endpoint,
    pub(crate) ops: OpTable,
    pub(crate) protocol: String,
    pub(crate) retry_limit: Option<u32>,
    listening: bool,
}

impl NaOfiClass {
    /// Whether `protocol` names a usable provider.
    pub fn check_protocol(registry: &FabricRegistry, protocol: &str) -> bool {
        registry.check_protocol(protocol)
    }

    pub fn initialize(registry: &Arc<FabricRegistry>, protocol: &str, listen: bool) -> Result<Self> {
        let endpoint = Endpoint::open(registry, protocol, listen)?;
        Ok(Self {
            endpoint,
            ops: OpTable::new(),
            protocol: protocol.to_string(),
            retry_limit: registry.config().post_retry_limit,
            listening: listen,
        })
    }

    /// Close the endpoint and release the domain. Refused while unexpected
    /// receives are still posted; the class is handed back in that case.
    pub fn finalize(self) -> std::result::Result<(), FinalizeError> {
        let pending = self.ops.unexpected_len();
        if pending > 0 {
            tracing::error!(pending, uri = %self.endpoint.uri, "unexpected receives still posted");
            return Err(FinalizeError {
                status: Status::with_message(
                    NaCode::PROTOCOL_ERROR,
                    format!("{pending} unexpected receive(s) still posted"),
                ),
                class: self,
            });
        }
        let inflight = self.ops.inflight_len();
        if inflight > 0 {
            tracing::warn!(inflight, "finalizing with operations in flight");
        }
        drop(self);
        Ok(())
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn uri(&self) -> &str {
        &self.endpoint.uri
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn domain(&self) -> &DomainRef {
        &self.endpoint.domain
    }

    /// Unexpected receives posted and not yet completed or canceled.
    pub fn unexpected_pending(&self) -> usize {
        self.ops.unexpected_len()
    }

    pub fn is_unexpected_queued(&self, op: &OpId) -> bool {
        self.ops.unexpected_contains(op)
    }

    pub fn op_create(&self) -> OpId {
        OpId::new()
    }

    /// Release a caller handle. Destroying an operation that is still in
    /// flight is refused.
    pub fn op_destroy(&self, op: OpId) -> Result<()> {
        if !op.is_completed() {
            tracing::error!(?op, "destroying an operation still in flight");
            return make_error_msg(NaCode::PROTOCOL_ERROR, "operation still in flight");
        }
        drop(op);
        Ok(())
    }

    /// Resolve `name` (`"<protocol>://<node>:<service>"`) and complete the
    /// lookup immediately through `sink`.
    pub fn addr_lookup(
        &self,
        sink: &Arc<dyn CompletionSink>,
        callback: Callback,
        name: &str,
        op: Option<&OpId>,
    ) -> Result<OpId> {
        let (node, service) = parse_name(name)?;
        let op = self.ops.prepare(op)?;

        let domain = &self.endpoint.domain;
        let info = self
            .endpoint
            .domain
            .registry()
            .provider()
            .resolve(&ResolveRequest {
                node: Some(node),
                service: Some(service),
                source: false,
                base: Some(domain.info()),
            })
            .fabric_context("resolve peer address")?;
        let Some(raw) = info.dest_addr else {
            return make_error_msg(NaCode::PROTOCOL_ERROR, format!("no address for {name}"));
        };
        let fi_addr = domain.av().insert(&raw).fabric_context("insert peer address")?;
        let addr = Addr::new(fi_addr, Some(name.to_string()));

        let token = self.ops.next_token();
        op.arm(
            token,
            Payload::Lookup { addr: addr.clone() },
            callback,
            sink.clone(),
            Some(addr),
        );
        self.complete(op.clone(), Status::ok(), Outcome::default())?;
        Ok(op)
    }

    pub fn addr_self(&self) -> Result<Addr> {
        Ok(self.endpoint.self_addr.clone())
    }

    pub fn addr_dup(&self, addr: &Addr) -> Addr {
        addr.clone()
    }

    pub fn addr_free(&self, addr: Addr) {
        drop(addr);
    }

    pub fn addr_is_self(&self, addr: &Addr) -> bool {
        addr.is_self()
    }

    pub fn addr_to_string(
        &self,
        buf: Option<&mut [u8]>,
        required: &mut usize,
        addr: &Addr,
    ) -> Result<()> {
        addr.to_string(buf, required)
    }

    pub fn msg_get_max_expected_size(&self) -> usize {
        MAX_EXPECTED_SIZE
    }

    pub fn msg_get_max_unexpected_size(&self) -> usize {
        MAX_UNEXPECTED_SIZE
    }

    pub fn msg_get_max_tag(&self) -> u64 {
        MAX_TAG
    }
}

impl fmt::Debug for NaOfiClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NaOfiClass")
            .field("protocol", &self.protocol)
            .field("endpoint", &self.endpoint)
            .field("listening", &self.listening)
            .finish()
    }
}

/// Split `"<protocol>://<node>:<service>"` into node and service. The
/// protocol prefix is optional.
fn parse_name(name: &str) -> Result<(&str, &str)> {
    let hostport = name.split_once("://").map_or(name, |(_, rest)| rest);
    match hostport.rsplit_once(':') {
        Some((node, service)) if !node.is_empty() && !service.is_empty() => Ok((node, service)),
        _ => make_error_msg(
            NaCode::INVALID_PARAM,
            format!("malformed address {name:?}, expected <protocol>://<node>:<service>"),
        ),
    }
}
