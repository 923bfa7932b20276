use naofi_types::{NaCode, Status};
use thiserror::Error;

/// Errors reported by a fabric provider.
///
/// Variants follow the errno-style results of a libfabric provider. `Again`
/// and `Avail` are flow-control signals rather than failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FabricError {
    /// Resources temporarily exhausted, or nothing to read. Retry later.
    #[error("resource temporarily unavailable")]
    Again,

    /// The completion queue holds an error entry; read it with `read_err`.
    #[error("error completion available")]
    Avail,

    #[error("operation canceled")]
    Canceled,

    /// Completion from a peer that is not in the address vector yet.
    #[error("source address not available")]
    AddrNotAvail,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("out of memory")]
    NoMem,

    #[error("access denied: {0}")]
    Access(String),

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("provider error: {0}")]
    Other(String),
}

impl From<FabricError> for Status {
    fn from(err: FabricError) -> Self {
        match err {
            FabricError::NoMem => Status::with_message(NaCode::NOMEM_ERROR, err.to_string()),
            FabricError::Canceled => Status::new(NaCode::CANCELED),
            other => Status::with_message(NaCode::PROTOCOL_ERROR, other.to_string()),
        }
    }
}
