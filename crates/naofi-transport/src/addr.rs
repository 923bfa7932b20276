use std::fmt;
use std::sync::Arc;

use naofi_fabric::FiAddr;
use naofi_types::{make_error_msg, NaCode, Result};

struct AddrInner {
    fi_addr: FiAddr,
    uri: Option<String>,
    is_self: bool,
    unexpected: bool,
}

/// Shared handle to a peer address.
///
/// Cloning takes a reference and dropping releases it. The address-vector
/// entry behind `fi_addr` is never removed, even after the last handle
/// goes away.
#[derive(Clone)]
pub struct Addr(Arc<AddrInner>);

impl Addr {
    pub(crate) fn new(fi_addr: FiAddr, uri: Option<String>) -> Self {
        Self(Arc::new(AddrInner {
            fi_addr,
            uri,
            is_self: false,
            unexpected: false,
        }))
    }

    pub(crate) fn local(fi_addr: FiAddr, uri: String) -> Self {
        Self(Arc::new(AddrInner {
            fi_addr,
            uri: Some(uri),
            is_self: true,
            unexpected: false,
        }))
    }

    /// An address learned from the source of an unexpected message.
    pub(crate) fn from_unexpected(fi_addr: FiAddr, uri: Option<String>) -> Self {
        Self(Arc::new(AddrInner {
            fi_addr,
            uri,
            is_self: false,
            unexpected: true,
        }))
    }

    pub fn fi_addr(&self) -> FiAddr {
        self.0.fi_addr
    }

    pub fn uri(&self) -> Option<&str> {
        self.0.uri.as_deref()
    }

    pub fn is_self(&self) -> bool {
        self.0.is_self
    }

    pub fn is_unexpected(&self) -> bool {
        self.0.unexpected
    }

    /// Number of live handles to this address.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(a: &Addr, b: &Addr) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Copy the NUL-terminated URI into `buf`.
    ///
    /// `required` always receives the size needed including the terminator.
    /// Passing no buffer only queries the size.
    pub fn to_string(&self, buf: Option<&mut [u8]>, required: &mut usize) -> Result<()> {
        let Some(uri) = self.uri() else {
            return make_error_msg(NaCode::PROTOCOL_ERROR, "address has no URI");
        };
        *required = uri.len() + 1;
        let Some(buf) = buf else {
            return Ok(());
        };
        if buf.len() < *required {
            return make_error_msg(
                NaCode::SIZE_ERROR,
                format!("buffer of {} bytes, need {}", buf.len(), *required),
            );
        }
        buf[..uri.len()].copy_from_slice(uri.as_bytes());
        buf[uri.len()] = 0;
        Ok(())
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("fi_addr", &self.0.fi_addr)
            .field("uri", &self.0.uri)
            .field("is_self", &self.0.is_self)
            .field("unexpected", &self.0.unexpected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_string_exact_fit() {
        let addr = Addr::new(3, Some("sockets://127.0.0.1:22223".into()));
        let mut required = 0;
        addr.to_string(None, &mut required).unwrap();
        assert_eq!(required, 26);

        let mut buf = vec![0xffu8; required];
        addr.to_string(Some(&mut buf), &mut required).unwrap();
        assert_eq!(&buf[..25], b"sockets://127.0.0.1:22223");
        assert_eq!(buf[25], 0);
    }

    #[test]
    fn test_to_string_size_error_reports_required() {
        let addr = Addr::new(0, Some("verbs://10.0.0.1:7".into()));
        let mut buf = [0u8; 8];
        let mut required = 0;
        let err = addr.to_string(Some(&mut buf), &mut required).unwrap_err();
        assert_eq!(err.code(), NaCode::SIZE_ERROR);
        assert_eq!(required, 19);
        assert_eq!(buf, [0u8; 8]);

        // Idempotent: a second call reports the same thing.
        let err = addr.to_string(Some(&mut buf), &mut required).unwrap_err();
        assert_eq!(err.code(), NaCode::SIZE_ERROR);
        assert_eq!(required, 19);
    }

    #[test]
    fn test_refcount_follows_clones() {
        let addr = Addr::local(1, "psm2://10.0.0.1:5000".into());
        assert!(addr.is_self());
        assert!(!addr.is_unexpected());
        let dup = addr.clone();
        assert!(Addr::ptr_eq(&addr, &dup));
        assert_eq!(addr.refcount(), 2);
        drop(dup);
        assert_eq!(addr.refcount(), 1);
    }

    #[test]
    fn test_missing_uri() {
        let addr = Addr::from_unexpected(4, None);
        assert!(addr.is_unexpected());
        let mut required = 0;
        let err = addr.to_string(None, &mut required).unwrap_err();
        assert_eq!(err.code(), NaCode::PROTOCOL_ERROR);
    }
}
