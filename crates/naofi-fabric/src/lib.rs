//! Fabric provider abstraction.
//!
//! The transport engine drives providers through these traits: discovery,
//! fabric, access domain, memory region, address vector, completion queue
//! and endpoint handles, with errno-style errors in [`FabricError`].

pub mod error;
pub mod flags;
pub mod info;
pub mod provider;

pub use error::FabricError;
pub use flags::{BindFlags, Capabilities, CompletionFlags, MemAccess, MsgOrder};
pub use info::{
    AvType, CqFormat, EndpointType, InfoHints, MrMode, ProgressMode, ProviderInfo, ResolveRequest,
};
pub use provider::{
    AccessDomain, AddressVector, CompletionQueue, CqEntry, CqErrEntry, Endpoint, Fabric,
    FabricProvider, FabricResult, FiAddr, IoVec, IoVecMut, MemoryRegion, FI_ADDR_UNSPEC,
};
