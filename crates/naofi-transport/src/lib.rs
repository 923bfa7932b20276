//! Asynchronous tagged-message and RMA transport over pluggable fabric
//! providers.
//!
//! A [`FabricRegistry`] discovers providers once and shares one domain per
//! provider and interface. Each [`NaOfiClass`] owns an endpoint on such a
//! domain and exposes the plugin operation set: address lookup, expected
//! and unexpected messaging, put/get, progress and cancel. Finished
//! operations are handed to a [`CompletionSink`] whose owner runs their
//! callbacks, for example a [`Context`].

mod addr;
mod class;
mod completion;
mod config;
mod domain;
mod endpoint;
mod error;
mod msg;
mod op;
mod progress;
mod registry;
mod rma;
#[cfg(test)]
mod test_utils;

pub use addr::Addr;
pub use class::NaOfiClass;
pub use completion::{Callback, CallbackInfo, Completion, CompletionInfo, CompletionSink, Context};
pub use config::{load_node_list, parse_node_list, ConfigError, NodeEntry, OfiConfig, PortAllocator};
pub use domain::{Domain, ProviderType};
pub use error::FinalizeError;
pub use op::{OpId, OpKind};
pub use registry::{discovery_hints, DomainRef, FabricRegistry};
pub use rma::{MemAttr, MemHandle, RmaRequest};

/// Largest tag accepted by the messaging calls.
pub const MAX_TAG: u64 = (1 << 30) - 1;

pub const MAX_EXPECTED_SIZE: usize = 4096;
pub const MAX_UNEXPECTED_SIZE: usize = 4096;

/// Set on every expected message tag; never set on unexpected ones.
pub const EXPECTED_TAG_FLAG: u64 = 0x1_0000_0000;

/// Tag posted by unexpected receives.
pub const UNEXPECTED_BASE_TAG: u64 = 1;

/// Ignore mask of unexpected receives: any tag with the expected flag clear.
pub const UNEXPECTED_TAG_IGNORE: u64 = 0xFFFF_FFFF;

/// Key the bulk memory registration of every domain is made under.
pub const RMA_KEY: u64 = 0x0F1B_0F1B;

/// URIs must be strictly shorter than this.
pub const MAX_URI_LEN: usize = 128;
