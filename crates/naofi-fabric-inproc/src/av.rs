use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use naofi_fabric::{AddressVector, FabricError, FabricResult, FiAddr};
use parking_lot::RwLock;

use crate::addr;
use crate::faults::{OpenHandle, Stats};

#[derive(Debug, Default)]
struct AvTable {
    entries: Vec<Vec<u8>>,
    index: HashMap<Vec<u8>, FiAddr>,
}

#[derive(Debug)]
struct AvInner {
    table: RwLock<AvTable>,
    _handle: OpenHandle,
}

/// Map-style address vector. Inserting an address twice returns the same
/// handle; entries are never removed.
#[derive(Clone)]
pub struct InprocAv {
    inner: Arc<AvInner>,
}

impl InprocAv {
    pub(crate) fn new(stats: &Arc<Stats>) -> Self {
        Self {
            inner: Arc::new(AvInner {
                table: RwLock::default(),
                _handle: OpenHandle::new(stats),
            }),
        }
    }

    /// Reverse lookup of a raw address.
    pub fn find(&self, raw: &[u8]) -> Option<FiAddr> {
        self.inner.table.read().index.get(raw).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.table.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AddressVector for InprocAv {
    fn insert(&self, raw: &[u8]) -> FabricResult<FiAddr> {
        if addr::decode(raw).is_none() {
            return Err(FabricError::InvalidArg(format!(
                "malformed address of {} bytes",
                raw.len()
            )));
        }
        let mut table = self.inner.table.write();
        if let Some(&fi_addr) = table.index.get(raw) {
            return Ok(fi_addr);
        }
        let fi_addr = table.entries.len() as FiAddr;
        table.entries.push(raw.to_vec());
        table.index.insert(raw.to_vec(), fi_addr);
        tracing::trace!(addr = %addr::render(raw), fi_addr, "av insert");
        Ok(fi_addr)
    }

    fn lookup(&self, fi_addr: FiAddr) -> FabricResult<Vec<u8>> {
        let table = self.inner.table.read();
        usize::try_from(fi_addr)
            .ok()
            .and_then(|i| table.entries.get(i))
            .cloned()
            .ok_or_else(|| FabricError::NotFound(format!("fi_addr {fi_addr}")))
    }

    fn straddr(&self, raw: &[u8]) -> String {
        addr::render(raw)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_dedupes() {
        let av = InprocAv::new(&Arc::default());
        let a = av.insert(&[127, 0, 0, 1, 0, 1]).unwrap();
        let b = av.insert(&[127, 0, 0, 1, 0, 2]).unwrap();
        let again = av.insert(&[127, 0, 0, 1, 0, 1]).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, again);
        assert_eq!(av.len(), 2);
        assert_eq!(av.find(&[127, 0, 0, 1, 0, 2]), Some(b));
    }

    #[test]
    fn test_lookup_unknown() {
        let av = InprocAv::new(&Arc::default());
        assert!(matches!(av.lookup(3), Err(FabricError::NotFound(_))));
        assert!(matches!(av.insert(&[1, 2, 3]), Err(FabricError::InvalidArg(_))));
    }

    #[test]
    fn test_handle_accounting() {
        let stats = Arc::new(Stats::default());
        let av = InprocAv::new(&stats);
        let clone = av.clone();
        assert_eq!(stats.open_handles(), 1);
        drop(av);
        assert_eq!(stats.open_handles(), 1);
        drop(clone);
        assert_eq!(stats.open_handles(), 0);
    }
}
