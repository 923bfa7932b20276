//! Provider-facing traits.
//!
//! Every handle closes when dropped. Owners that need a specific close order
//! (memory region and address vector before the access domain, access
//! domain before the fabric) arrange it through field order.

use std::any::Any;
use std::sync::Arc;

use crate::error::FabricError;
use crate::flags::{BindFlags, CompletionFlags, MemAccess};
use crate::info::{AvType, CqFormat, InfoHints, ProviderInfo, ResolveRequest};

pub type FabricResult<T> = std::result::Result<T, FabricError>;

/// Provider-level peer address handle, as returned by an address vector.
pub type FiAddr = u64;

/// Wildcard source address for receives.
pub const FI_ADDR_UNSPEC: FiAddr = u64::MAX;

/// A single contiguous buffer handed to the provider for transmission.
#[derive(Debug, Clone, Copy)]
pub struct IoVec {
    pub base: *const u8,
    pub len: usize,
}

/// A single contiguous buffer the provider writes into.
#[derive(Debug, Clone, Copy)]
pub struct IoVecMut {
    pub base: *mut u8,
    pub len: usize,
}

// SAFETY: IoVec and IoVecMut are plain descriptors. Whoever posts them
// guarantees the memory stays valid until the matching completion is read
// or the post is canceled, which is the contract of every unsafe post
// method below.
unsafe impl Send for IoVec {}
unsafe impl Sync for IoVec {}
unsafe impl Send for IoVecMut {}
unsafe impl Sync for IoVecMut {}

impl IoVec {
    pub fn from_slice(buf: &[u8]) -> Self {
        Self {
            base: buf.as_ptr(),
            len: buf.len(),
        }
    }
}

impl IoVecMut {
    pub fn from_slice(buf: &mut [u8]) -> Self {
        Self {
            base: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }
}

/// A successful tagged completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqEntry {
    /// The opaque context supplied when the operation was posted.
    pub context: u64,
    pub flags: CompletionFlags,
    /// Bytes transferred. For receives this is the length of the sent
    /// message, which may exceed the posted buffer.
    pub len: usize,
    pub tag: u64,
}

/// An error completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqErrEntry {
    pub context: u64,
    pub flags: CompletionFlags,
    pub len: usize,
    pub tag: u64,
    pub err: FabricError,
    /// Provider-specific detail. For `AddrNotAvail` this holds the raw
    /// source address of the sender.
    pub err_data: Vec<u8>,
}

/// Entry point of a provider library.
pub trait FabricProvider: Send + Sync {
    /// List every provider/domain combination satisfying `hints`.
    fn get_info(&self, hints: &InfoHints) -> FabricResult<Vec<ProviderInfo>>;

    /// Resolve a node/service pair into a descriptor carrying a source or
    /// destination address.
    fn resolve(&self, req: &ResolveRequest<'_>) -> FabricResult<ProviderInfo>;

    fn open_fabric(&self, info: &ProviderInfo) -> FabricResult<Box<dyn Fabric>>;
}

pub trait Fabric: Send + Sync {
    fn open_domain(&self, info: &ProviderInfo) -> FabricResult<Box<dyn AccessDomain>>;
}

pub trait AccessDomain: Send + Sync {
    /// Register `[base, base + len)` for the given access under `key`.
    fn register_memory(
        &self,
        base: u64,
        len: u64,
        access: MemAccess,
        key: u64,
    ) -> FabricResult<Box<dyn MemoryRegion>>;

    fn open_av(&self, av_type: AvType) -> FabricResult<Arc<dyn AddressVector>>;

    fn open_cq(&self, format: CqFormat) -> FabricResult<Arc<dyn CompletionQueue>>;

    fn open_endpoint(&self, info: &ProviderInfo) -> FabricResult<Box<dyn Endpoint>>;
}

pub trait MemoryRegion: Send + Sync {
    fn key(&self) -> u64;
}

/// Translation table from raw peer addresses to `FiAddr` handles.
pub trait AddressVector: Send + Sync {
    fn insert(&self, raw: &[u8]) -> FabricResult<FiAddr>;

    fn lookup(&self, addr: FiAddr) -> FabricResult<Vec<u8>>;

    /// Render a raw address for display.
    fn straddr(&self, raw: &[u8]) -> String;

    fn as_any(&self) -> &dyn Any;
}

pub trait CompletionQueue: Send + Sync {
    /// Read one completion and the `FiAddr` of its source.
    ///
    /// Returns `Again` when empty and `Avail` when the head of the queue is
    /// an error entry.
    fn read_from(&self) -> FabricResult<(CqEntry, FiAddr)>;

    /// Pop the error entry at the head of the queue.
    fn read_err(&self) -> FabricResult<CqErrEntry>;

    fn as_any(&self) -> &dyn Any;
}

pub trait Endpoint: Send + Sync {
    fn bind_cq(&self, cq: &Arc<dyn CompletionQueue>, flags: BindFlags) -> FabricResult<()>;

    fn bind_av(&self, av: &Arc<dyn AddressVector>) -> FabricResult<()>;

    fn enable(&self) -> FabricResult<()>;

    /// Raw local address of this endpoint.
    fn name(&self) -> FabricResult<Vec<u8>>;

    /// Post a tagged send.
    ///
    /// # Safety
    ///
    /// `iov` must stay valid for reads until the completion carrying
    /// `context` is read from the bound queue or the post is canceled.
    unsafe fn tsend(&self, iov: IoVec, dest: FiAddr, tag: u64, context: u64) -> FabricResult<()>;

    /// Post a tagged receive matching `(tag & !ignore)` from `src`.
    ///
    /// # Safety
    ///
    /// `iov` must stay valid for writes until the completion carrying
    /// `context` is read from the bound queue or the post is canceled.
    unsafe fn trecv(
        &self,
        iov: IoVecMut,
        src: FiAddr,
        tag: u64,
        ignore: u64,
        context: u64,
    ) -> FabricResult<()>;

    /// Post an RMA write of `iov` into `remote_addr` at `dest`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Endpoint::tsend`]. The remote range must be
    /// registered under `key` at the peer.
    unsafe fn write(
        &self,
        iov: IoVec,
        dest: FiAddr,
        remote_addr: u64,
        key: u64,
        context: u64,
    ) -> FabricResult<()>;

    /// Post an RMA read from `remote_addr` at `src` into `iov`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Endpoint::trecv`].
    unsafe fn read(
        &self,
        iov: IoVecMut,
        src: FiAddr,
        remote_addr: u64,
        key: u64,
        context: u64,
    ) -> FabricResult<()>;

    /// Cancel the pending operation posted with `context`.
    ///
    /// Returns `NotFound` when nothing cancelable is pending.
    fn cancel(&self, context: u64) -> FabricResult<()>;
}
