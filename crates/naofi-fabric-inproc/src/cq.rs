use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use naofi_fabric::{
    CompletionQueue, CqEntry, CqErrEntry, FabricError, FabricResult, FiAddr,
};
use parking_lot::Mutex;

use crate::faults::{OpenHandle, Stats};

#[derive(Debug)]
enum Slot {
    Entry(CqEntry, FiAddr),
    Error(CqErrEntry),
}

#[derive(Debug)]
struct CqInner {
    slots: Mutex<VecDeque<Slot>>,
    _handle: OpenHandle,
}

/// Completion queue shared between an endpoint and its owner.
#[derive(Clone)]
pub struct InprocCq {
    inner: Arc<CqInner>,
}

impl InprocCq {
    pub(crate) fn new(stats: &Arc<Stats>) -> Self {
        Self {
            inner: Arc::new(CqInner {
                slots: Mutex::default(),
                _handle: OpenHandle::new(stats),
            }),
        }
    }

    pub(crate) fn push(&self, entry: CqEntry, src: FiAddr) {
        self.inner.slots.lock().push_back(Slot::Entry(entry, src));
    }

    pub(crate) fn push_err(&self, entry: CqErrEntry) {
        self.inner.slots.lock().push_back(Slot::Error(entry));
    }

    pub fn pending(&self) -> usize {
        self.inner.slots.lock().len()
    }
}

impl CompletionQueue for InprocCq {
    fn read_from(&self) -> FabricResult<(CqEntry, FiAddr)> {
        let mut slots = self.inner.slots.lock();
        match slots.front() {
            None => Err(FabricError::Again),
            Some(Slot::Error(_)) => Err(FabricError::Avail),
            Some(Slot::Entry(..)) => match slots.pop_front() {
                Some(Slot::Entry(entry, src)) => Ok((entry, src)),
                _ => Err(FabricError::Again),
            },
        }
    }

    fn read_err(&self) -> FabricResult<CqErrEntry> {
        let mut slots = self.inner.slots.lock();
        match slots.front() {
            Some(Slot::Error(_)) => match slots.pop_front() {
                Some(Slot::Error(entry)) => Ok(entry),
                _ => Err(FabricError::Again),
            },
            _ => Err(FabricError::Again),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use naofi_fabric::CompletionFlags;

    fn entry(context: u64) -> CqEntry {
        CqEntry {
            context,
            flags: CompletionFlags::SEND | CompletionFlags::TAGGED,
            len: 8,
            tag: 0,
        }
    }

    #[test]
    fn test_empty_is_again() {
        let cq = InprocCq::new(&Arc::default());
        assert_eq!(cq.read_from(), Err(FabricError::Again));
        assert_eq!(cq.read_err(), Err(FabricError::Again));
    }

    #[test]
    fn test_error_entry_blocks_reads_until_drained() {
        let cq = InprocCq::new(&Arc::default());
        cq.push_err(CqErrEntry {
            context: 1,
            flags: CompletionFlags::RECV | CompletionFlags::TAGGED,
            len: 0,
            tag: 0,
            err: FabricError::Canceled,
            err_data: Vec::new(),
        });
        cq.push(entry(2), 0);

        assert_eq!(cq.read_from(), Err(FabricError::Avail));
        let err = cq.read_err().unwrap();
        assert_eq!(err.context, 1);
        assert_eq!(err.err, FabricError::Canceled);

        let (e, src) = cq.read_from().unwrap();
        assert_eq!(e.context, 2);
        assert_eq!(src, 0);
        assert_eq!(cq.pending(), 0);
    }
}
