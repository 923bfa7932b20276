use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use naofi_fabric::{FabricError, FabricResult};

/// Provider calls that can be armed to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    GetInfo,
    OpenFabric,
    OpenDomain,
    RegisterMemory,
    OpenAv,
    OpenCq,
    OpenEndpoint,
    Enable,
    /// The next send completion is queued as a provider error entry.
    SendCompletion,
}

const FAULT_POINTS: usize = 9;

impl FaultPoint {
    fn index(self) -> usize {
        self as usize
    }
}

/// One-shot failures and `Again` injection shared by every handle of a
/// provider.
#[derive(Debug, Default)]
pub struct Faults {
    armed: [AtomicBool; FAULT_POINTS],
    again: AtomicUsize,
}

impl Faults {
    pub fn arm(&self, point: FaultPoint) {
        self.armed[point.index()].store(true, Ordering::SeqCst);
    }

    pub fn check(&self, point: FaultPoint) -> FabricResult<()> {
        if self.armed[point.index()].swap(false, Ordering::SeqCst) {
            return Err(FabricError::Other(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    /// Make the next `n` data-path posts return `Again`.
    pub fn inject_again(&self, n: usize) {
        self.again.store(n, Ordering::SeqCst);
    }

    pub fn check_again(&self) -> FabricResult<()> {
        let taken = self
            .again
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(FabricError::Again),
            Err(_) => Ok(()),
        }
    }
}

/// Counters observed by tests.
#[derive(Debug, Default)]
pub struct Stats {
    pub get_info_calls: AtomicUsize,
    pub fabric_opens: AtomicUsize,
    /// Handles currently open across fabrics, domains, memory regions,
    /// address vectors, completion queues and endpoints.
    pub open_handles: AtomicUsize,
}

impl Stats {
    pub fn get_info_calls(&self) -> usize {
        self.get_info_calls.load(Ordering::SeqCst)
    }

    pub fn fabric_opens(&self) -> usize {
        self.fabric_opens.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

}

/// Counts one open handle for as long as it lives.
#[derive(Debug)]
pub(crate) struct OpenHandle(Arc<Stats>);

impl OpenHandle {
    pub(crate) fn new(stats: &Arc<Stats>) -> Self {
        stats.open_handles.fetch_add(1, Ordering::SeqCst);
        Self(stats.clone())
    }
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        self.0.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_is_one_shot() {
        let faults = Faults::default();
        faults.arm(FaultPoint::OpenAv);
        assert!(faults.check(FaultPoint::OpenCq).is_ok());
        assert!(faults.check(FaultPoint::OpenAv).is_err());
        assert!(faults.check(FaultPoint::OpenAv).is_ok());
    }

    #[test]
    fn test_inject_again_counts_down() {
        let faults = Faults::default();
        faults.inject_again(2);
        assert_eq!(faults.check_again(), Err(FabricError::Again));
        assert_eq!(faults.check_again(), Err(FabricError::Again));
        assert_eq!(faults.check_again(), Ok(()));
    }

    #[test]
    fn test_open_handle_counts() {
        let stats = Arc::new(Stats::default());
        let a = OpenHandle::new(&stats);
        let b = OpenHandle::new(&stats);
        assert_eq!(stats.open_handles(), 2);
        drop(a);
        drop(b);
        assert_eq!(stats.open_handles(), 0);
    }
}
