use std::fmt;

use naofi_fabric::FabricResult;
use naofi_types::{Result, Status};

use crate::class::NaOfiClass;

/// Attach what was being attempted to a provider failure, logging it.
pub(crate) trait FabricContext<T> {
    fn fabric_context(self, what: &str) -> Result<T>;
}

impl<T> FabricContext<T> for FabricResult<T> {
    fn fabric_context(self, what: &str) -> Result<T> {
        self.map_err(|err| {
            tracing::error!(error = %err, "{what} failed");
            let code = Status::from(err.clone()).code();
            Status::with_message(code, format!("{what}: {err}"))
        })
    }
}

/// A refused `finalize`, handing the still-open class back.
pub struct FinalizeError {
    pub status: Status,
    pub class: NaOfiClass,
}

impl fmt::Debug for FinalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizeError")
            .field("status", &self.status)
            .field("class", &self.class)
            .finish()
    }
}

impl fmt::Display for FinalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "finalize refused: {}", self.status)
    }
}

impl std::error::Error for FinalizeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use naofi_fabric::FabricError;
    use naofi_types::NaCode;

    #[test]
    fn test_fabric_context_maps_codes() {
        let r: FabricResult<()> = Err(FabricError::Unreachable("10.0.0.9:1".into()));
        let status = r.fabric_context("post send").unwrap_err();
        assert_eq!(status.code(), NaCode::PROTOCOL_ERROR);
        assert_eq!(
            status.message(),
            Some("post send: peer unreachable: 10.0.0.9:1")
        );

        let r: FabricResult<()> = Err(FabricError::NoMem);
        assert_eq!(r.fabric_context("open cq").unwrap_err().code(), NaCode::NOMEM_ERROR);
    }
}
