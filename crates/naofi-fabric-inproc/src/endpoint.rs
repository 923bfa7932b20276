use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use naofi_fabric::{
    AddressVector, BindFlags, CompletionFlags, CompletionQueue, CqEntry, CqErrEntry, Endpoint,
    FabricError, FabricResult, FiAddr, IoVec, IoVecMut, MemAccess, FI_ADDR_UNSPEC,
};
use parking_lot::Mutex;

use crate::addr;
use crate::av::InprocAv;
use crate::cq::InprocCq;
use crate::domain::Shared;
use crate::faults::{FaultPoint, OpenHandle};
use crate::network::RegionTable;

struct PostedRecv {
    context: u64,
    iov: IoVecMut,
    /// Raw address the receive is restricted to, `None` for any source.
    src: Option<Vec<u8>>,
    tag: u64,
    ignore: u64,
}

impl PostedRecv {
    fn matches(&self, msg: &InboundMsg) -> bool {
        let src_ok = self.src.as_deref().map_or(true, |src| src == msg.src.as_slice());
        src_ok && (self.tag & !self.ignore) == (msg.tag & !self.ignore)
    }
}

struct InboundMsg {
    src: Vec<u8>,
    tag: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct Matching {
    posted: VecDeque<PostedRecv>,
    /// Messages that arrived before a matching receive was posted.
    unmatched: VecDeque<InboundMsg>,
}

/// The part of an endpoint reachable from peers through the network.
pub(crate) struct EndpointCore {
    pub(crate) addr: Vec<u8>,
    regions: Arc<RegionTable>,
    cq: Mutex<Option<InprocCq>>,
    av: Mutex<Option<InprocAv>>,
    matching: Mutex<Matching>,
}

impl EndpointCore {
    fn cq(&self) -> FabricResult<InprocCq> {
        self.cq
            .lock()
            .clone()
            .ok_or_else(|| FabricError::InvalidArg("no completion queue bound".into()))
    }

    fn av(&self) -> FabricResult<InprocAv> {
        self.av
            .lock()
            .clone()
            .ok_or_else(|| FabricError::InvalidArg("no address vector bound".into()))
    }

    /// Hand an arriving message to the first matching posted receive, or
    /// park it until one is posted.
    fn deliver(&self, msg: InboundMsg) -> FabricResult<()> {
        let mut matching = self.matching.lock();
        match matching.posted.iter().position(|r| r.matches(&msg)) {
            Some(i) => {
                let recv = matching.posted.remove(i).ok_or_else(|| {
                    FabricError::Other("posted receive vanished while matching".into())
                })?;
                drop(matching);
                self.complete_recv(recv, msg)
            }
            None => {
                matching.unmatched.push_back(msg);
                Ok(())
            }
        }
    }

    /// Copy as much of `msg` as fits and queue the completion. The reported
    /// length is always the full message length so the owner can detect
    /// truncation.
    fn complete_recv(&self, recv: PostedRecv, msg: InboundMsg) -> FabricResult<()> {
        let n = msg.data.len().min(recv.iov.len);
        // SAFETY: the poster guaranteed `recv.iov` is valid for writes until
        // this completion is queued.
        unsafe {
            std::ptr::copy_nonoverlapping(msg.data.as_ptr(), recv.iov.base, n);
        }
        let flags = CompletionFlags::RECV | CompletionFlags::TAGGED;
        let cq = self.cq()?;
        match self.av()?.find(&msg.src) {
            Some(src) => cq.push(
                CqEntry {
                    context: recv.context,
                    flags,
                    len: msg.data.len(),
                    tag: msg.tag,
                },
                src,
            ),
            None => cq.push_err(CqErrEntry {
                context: recv.context,
                flags,
                len: msg.data.len(),
                tag: msg.tag,
                err: FabricError::AddrNotAvail,
                err_data: msg.src,
            }),
        }
        Ok(())
    }
}

pub(crate) struct InprocEndpoint {
    core: Arc<EndpointCore>,
    shared: Shared,
    enabled: AtomicBool,
    _handle: OpenHandle,
}

impl InprocEndpoint {
    pub(crate) fn new(shared: Shared, addr: Vec<u8>, regions: Arc<RegionTable>) -> Self {
        let _handle = OpenHandle::new(&shared.stats);
        Self {
            core: Arc::new(EndpointCore {
                addr,
                regions,
                cq: Mutex::new(None),
                av: Mutex::new(None),
                matching: Mutex::default(),
            }),
            shared,
            enabled: AtomicBool::new(false),
            _handle,
        }
    }

    fn check_enabled(&self) -> FabricResult<()> {
        if !self.enabled.load(Ordering::Acquire) {
            return Err(FabricError::InvalidArg("endpoint not enabled".into()));
        }
        Ok(())
    }

    fn check_post(&self) -> FabricResult<()> {
        self.check_enabled()?;
        self.shared.faults.check_again()
    }

    fn peer_raw(&self, fi_addr: FiAddr) -> FabricResult<Vec<u8>> {
        self.core.av()?.lookup(fi_addr)
    }

    fn complete_rma(&self, context: u64, flags: CompletionFlags, len: usize) -> FabricResult<()> {
        self.core.cq()?.push(
            CqEntry {
                context,
                flags,
                len,
                tag: 0,
            },
            FI_ADDR_UNSPEC,
        );
        Ok(())
    }
}

impl Drop for InprocEndpoint {
    fn drop(&mut self) {
        if self.enabled.load(Ordering::Acquire) {
            self.shared.network.unbind(&self.core.addr);
        }
        tracing::trace!(addr = %addr::render(&self.core.addr), "endpoint closed");
    }
}

impl Endpoint for InprocEndpoint {
    fn bind_cq(&self, cq: &Arc<dyn CompletionQueue>, flags: BindFlags) -> FabricResult<()> {
        if !flags.contains(BindFlags::TRANSMIT | BindFlags::RECV) {
            return Err(FabricError::InvalidArg(
                "completion queue must take both transmit and receive events".into(),
            ));
        }
        let cq = cq
            .as_any()
            .downcast_ref::<InprocCq>()
            .ok_or_else(|| FabricError::InvalidArg("foreign completion queue".into()))?;
        *self.core.cq.lock() = Some(cq.clone());
        Ok(())
    }

    fn bind_av(&self, av: &Arc<dyn AddressVector>) -> FabricResult<()> {
        let av = av
            .as_any()
            .downcast_ref::<InprocAv>()
            .ok_or_else(|| FabricError::InvalidArg("foreign address vector".into()))?;
        *self.core.av.lock() = Some(av.clone());
        Ok(())
    }

    fn enable(&self) -> FabricResult<()> {
        self.shared.faults.check(FaultPoint::Enable)?;
        self.core.cq()?;
        self.core.av()?;
        if self.enabled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.shared.network.bind(self.core.clone()) {
            self.enabled.store(false, Ordering::Release);
            return Err(e);
        }
        tracing::debug!(addr = %addr::render(&self.core.addr), "endpoint enabled");
        Ok(())
    }

    fn name(&self) -> FabricResult<Vec<u8>> {
        Ok(self.core.addr.clone())
    }

    unsafe fn tsend(&self, iov: IoVec, dest: FiAddr, tag: u64, context: u64) -> FabricResult<()> {
        self.check_post()?;
        let peer = self.shared.network.peer(&self.peer_raw(dest)?)?;
        // SAFETY: caller guarantees `iov` is readable for its length.
        let data = unsafe { std::slice::from_raw_parts(iov.base, iov.len) }.to_vec();
        let len = data.len();
        peer.deliver(InboundMsg {
            src: self.core.addr.clone(),
            tag,
            data,
        })?;
        // The payload has been copied out, so the send completes eagerly.
        let flags = CompletionFlags::SEND | CompletionFlags::TAGGED;
        let cq = self.core.cq()?;
        match self.shared.faults.check(FaultPoint::SendCompletion) {
            Ok(()) => cq.push(
                CqEntry {
                    context,
                    flags,
                    len,
                    tag: 0,
                },
                FI_ADDR_UNSPEC,
            ),
            Err(err) => cq.push_err(CqErrEntry {
                context,
                flags,
                len,
                tag: 0,
                err,
                err_data: Vec::new(),
            }),
        }
        Ok(())
    }

    unsafe fn trecv(
        &self,
        iov: IoVecMut,
        src: FiAddr,
        tag: u64,
        ignore: u64,
        context: u64,
    ) -> FabricResult<()> {
        self.check_post()?;
        let src = if src == FI_ADDR_UNSPEC {
            None
        } else {
            Some(self.peer_raw(src)?)
        };
        let recv = PostedRecv {
            context,
            iov,
            src,
            tag,
            ignore,
        };
        let mut matching = self.core.matching.lock();
        match matching.unmatched.iter().position(|m| recv.matches(m)) {
            Some(i) => {
                let msg = matching.unmatched.remove(i).ok_or_else(|| {
                    FabricError::Other("parked message vanished while matching".into())
                })?;
                drop(matching);
                self.core.complete_recv(recv, msg)
            }
            None => {
                matching.posted.push_back(recv);
                Ok(())
            }
        }
    }

    unsafe fn write(
        &self,
        iov: IoVec,
        dest: FiAddr,
        remote_addr: u64,
        key: u64,
        context: u64,
    ) -> FabricResult<()> {
        self.check_post()?;
        let peer = self.shared.network.peer(&self.peer_raw(dest)?)?;
        peer.regions
            .check(key, remote_addr, iov.len, MemAccess::REMOTE_WRITE)?;
        // SAFETY: the local range is valid per the caller's contract and the
        // remote range lies in memory the peer registered for remote writes.
        unsafe {
            std::ptr::copy(iov.base, remote_addr as *mut u8, iov.len);
        }
        self.complete_rma(context, CompletionFlags::RMA | CompletionFlags::WRITE, iov.len)
    }

    unsafe fn read(
        &self,
        iov: IoVecMut,
        src: FiAddr,
        remote_addr: u64,
        key: u64,
        context: u64,
    ) -> FabricResult<()> {
        self.check_post()?;
        let peer = self.shared.network.peer(&self.peer_raw(src)?)?;
        peer.regions
            .check(key, remote_addr, iov.len, MemAccess::REMOTE_READ)?;
        // SAFETY: as for `write`, with the copy direction reversed.
        unsafe {
            std::ptr::copy(remote_addr as *const u8, iov.base, iov.len);
        }
        self.complete_rma(context, CompletionFlags::RMA | CompletionFlags::READ, iov.len)
    }

    fn cancel(&self, context: u64) -> FabricResult<()> {
        let mut matching = self.core.matching.lock();
        let i = matching
            .posted
            .iter()
            .position(|r| r.context == context)
            .ok_or_else(|| FabricError::NotFound(format!("no pending operation {context}")))?;
        let recv = matching.posted.remove(i);
        drop(matching);
        let tag = recv.map_or(0, |r| r.tag);
        self.core.cq()?.push_err(CqErrEntry {
            context,
            flags: CompletionFlags::RECV | CompletionFlags::TAGGED,
            len: 0,
            tag,
            err: FabricError::Canceled,
            err_data: Vec::new(),
        });
        Ok(())
    }
}
