//! Remote memory access over the domain's bulk memory registration.
//!
//! Every domain registers the whole address space once under `RMA_KEY`, so
//! memory handles only describe a range; registering or deregistering one
//! does nothing at the provider.

use std::mem::size_of;
use std::sync::Arc;

use bytes::{Buf, BufMut};
use naofi_fabric::{IoVec, IoVecMut};
use naofi_types::{make_error_msg, NaCode, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::addr::Addr;
use crate::class::NaOfiClass;
use crate::completion::{Callback, CompletionSink};
use crate::op::{OpId, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MemAttr {
    ReadWrite = 0,
    ReadOnly = 1,
    WriteOnly = 2,
}

/// A local or remote memory range usable as an RMA target.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct MemHandle {
    base: u64,
    size: u64,
    attr: MemAttr,
}

const SERIALIZED_LEN: usize = size_of::<MemHandle>();
const PADDING: usize = SERIALIZED_LEN - 2 * size_of::<u64>() - size_of::<u8>();

impl MemHandle {
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn attr(&self) -> MemAttr {
        self.attr
    }

    /// Whether `[offset, offset + len)` lies inside the handle.
    fn contains(&self, offset: u64, len: u64) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.size)
    }
}

/// One put or get: `length` bytes between `local` at `local_offset` and
/// `remote` at `remote_offset` on the peer `remote_addr`.
#[derive(Debug, Clone)]
pub struct RmaRequest<'a> {
    pub local: &'a MemHandle,
    pub local_offset: u64,
    pub remote: &'a MemHandle,
    pub remote_offset: u64,
    pub length: u64,
    pub remote_addr: &'a Addr,
}

impl RmaRequest<'_> {
    fn check(&self) -> Result<()> {
        if !self.local.contains(self.local_offset, self.length) {
            return make_error_msg(
                NaCode::INVALID_PARAM,
                format!(
                    "local range {}+{} outside handle of {} bytes",
                    self.local_offset, self.length, self.local.size
                ),
            );
        }
        if !self.remote.contains(self.remote_offset, self.length) {
            return make_error_msg(
                NaCode::INVALID_PARAM,
                format!(
                    "remote range {}+{} outside handle of {} bytes",
                    self.remote_offset, self.length, self.remote.size
                ),
            );
        }
        Ok(())
    }

    fn local_base(&self) -> u64 {
        self.local.base.wrapping_add(self.local_offset)
    }

    fn remote_target(&self) -> u64 {
        self.remote.base.wrapping_add(self.remote_offset)
    }
}

impl NaOfiClass {
    /// Describe `size` bytes at `base`. The memory is not touched until it
    /// takes part in a put or get.
    pub fn mem_handle_create(&self, base: *const u8, size: usize, attr: MemAttr) -> Result<MemHandle> {
        if base.is_null() && size > 0 {
            return make_error_msg(NaCode::INVALID_PARAM, "null base for a non-empty handle");
        }
        Ok(MemHandle {
            base: base as u64,
            size: size as u64,
            attr,
        })
    }

    /// Release a handle. Nothing is held at the provider, so this only
    /// consumes it.
    pub fn mem_handle_free(&self, _handle: MemHandle) {}

    pub fn mem_register(&self, _handle: &MemHandle) -> Result<()> {
        Ok(())
    }

    pub fn mem_deregister(&self, _handle: &MemHandle) -> Result<()> {
        Ok(())
    }

    pub fn mem_handle_get_serialize_size(&self, _handle: &MemHandle) -> usize {
        SERIALIZED_LEN
    }

    /// Write the handle as base, size and attribute, little endian, with
    /// zeroed padding.
    pub fn mem_handle_serialize(&self, buf: &mut [u8], handle: &MemHandle) -> Result<()> {
        if buf.len() < SERIALIZED_LEN {
            return make_error_msg(
                NaCode::SIZE_ERROR,
                format!("buffer of {} bytes, need {SERIALIZED_LEN}", buf.len()),
            );
        }
        let mut out = &mut buf[..SERIALIZED_LEN];
        out.put_u64_le(handle.base);
        out.put_u64_le(handle.size);
        out.put_u8(handle.attr.into());
        out.put_bytes(0, PADDING);
        Ok(())
    }

    pub fn mem_handle_deserialize(&self, buf: &[u8]) -> Result<MemHandle> {
        if buf.len() < SERIALIZED_LEN {
            return make_error_msg(
                NaCode::SIZE_ERROR,
                format!("buffer of {} bytes, need {SERIALIZED_LEN}", buf.len()),
            );
        }
        let mut input = &buf[..SERIALIZED_LEN];
        let base = input.get_u64_le();
        let size = input.get_u64_le();
        let raw = input.get_u8();
        let attr = MemAttr::try_from(raw).map_err(|_| {
            naofi_types::Status::with_message(
                NaCode::INVALID_PARAM,
                format!("unknown memory attribute {raw}"),
            )
        })?;
        Ok(MemHandle { base, size, attr })
    }

    /// Write `req.length` bytes from the local handle into the remote one.
    ///
    /// # Safety
    ///
    /// Both handles must describe memory valid for the transfer until the
    /// operation completes: readable locally, writable at the peer.
    pub unsafe fn put(
        &self,
        sink: &Arc<dyn CompletionSink>,
        callback: Callback,
        req: &RmaRequest<'_>,
        op: Option<&OpId>,
    ) -> Result<OpId> {
        req.check()?;
        let op = self.ops.prepare(op)?;
        op.arm(
            self.ops.next_token(),
            Payload::Put,
            callback,
            sink.clone(),
            Some(req.remote_addr.clone()),
        );
        let iov = IoVec {
            base: req.local_base() as *const u8,
            len: req.length as usize,
        };
        let dest = req.remote_addr.fi_addr();
        let target = req.remote_target();
        let key = self.endpoint.domain.rma_key();
        self.submit(&op, false, "post RMA write", |token| {
            // SAFETY: forwarded from this function's contract.
            unsafe { self.endpoint.ep.write(iov, dest, target, key, token) }
        })?;
        Ok(op)
    }

    /// Read `req.length` bytes from the remote handle into the local one.
    ///
    /// # Safety
    ///
    /// As for [`NaOfiClass::put`], with the local range writable and the
    /// remote range readable.
    pub unsafe fn get(
        &self,
        sink: &Arc<dyn CompletionSink>,
        callback: Callback,
        req: &RmaRequest<'_>,
        op: Option<&OpId>,
    ) -> Result<OpId> {
        req.check()?;
        let op = self.ops.prepare(op)?;
        op.arm(
            self.ops.next_token(),
            Payload::Get,
            callback,
            sink.clone(),
            Some(req.remote_addr.clone()),
        );
        let iov = IoVecMut {
            base: req.local_base() as *mut u8,
            len: req.length as usize,
        };
        let src = req.remote_addr.fi_addr();
        let target = req.remote_target();
        let key = self.endpoint.domain.rma_key();
        self.submit(&op, false, "post RMA read", |token| {
            // SAFETY: forwarded from this function's contract.
            unsafe { self.endpoint.ep.read(iov, src, target, key, token) }
        })?;
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::completion::CompletionInfo;
    use crate::config::OfiConfig;
    use crate::op::OpKind;
    use crate::test_utils::{drain, lookup, recorder, setup, sink};

    #[test]
    fn test_serialize_size_is_struct_size() {
        assert_eq!(SERIALIZED_LEN, 24);
        assert_eq!(PADDING, 7);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let (_provider, registry) = setup(OfiConfig::default());
        let class = NaOfiClass::initialize(&registry, "sockets", false).unwrap();
        let data = vec![0u8; 300];
        let handle = class
            .mem_handle_create(data.as_ptr(), data.len(), MemAttr::ReadOnly)
            .unwrap();
        class.mem_register(&handle).unwrap();

        let mut buf = vec![0xffu8; class.mem_handle_get_serialize_size(&handle)];
        class.mem_handle_serialize(&mut buf, &handle).unwrap();
        assert_eq!(&buf[8..16], &300u64.to_le_bytes());
        assert_eq!(buf[16], 1);
        assert!(buf[17..].iter().all(|b| *b == 0));

        let back = class.mem_handle_deserialize(&buf).unwrap();
        assert_eq!(back, handle);
        assert_eq!(back.base(), data.as_ptr() as u64);
        class.mem_deregister(&handle).unwrap();
        class.mem_handle_free(handle);
    }

    #[test]
    fn test_free_leaves_other_handles_usable() {
        let (_provider, registry) = setup(OfiConfig::default());
        let class = NaOfiClass::initialize(&registry, "sockets", false).unwrap();
        let data = [0u8; 16];
        let handle = class
            .mem_handle_create(data.as_ptr(), data.len(), MemAttr::ReadWrite)
            .unwrap();
        let kept = handle.clone();
        class.mem_handle_free(handle);

        let mut buf = [0u8; SERIALIZED_LEN];
        class.mem_handle_serialize(&mut buf, &kept).unwrap();
        assert_eq!(class.mem_handle_deserialize(&buf).unwrap(), kept);
        class.mem_handle_free(kept);
    }

    #[test]
    fn test_serialize_errors() {
        let (_provider, registry) = setup(OfiConfig::default());
        let class = NaOfiClass::initialize(&registry, "sockets", false).unwrap();
        let data = [0u8; 4];
        let handle = class
            .mem_handle_create(data.as_ptr(), data.len(), MemAttr::ReadWrite)
            .unwrap();

        let mut short = [0u8; 23];
        let err = class.mem_handle_serialize(&mut short, &handle).unwrap_err();
        assert_eq!(err.code(), NaCode::SIZE_ERROR);
        assert_eq!(
            class.mem_handle_deserialize(&short).unwrap_err().code(),
            NaCode::SIZE_ERROR
        );

        let mut buf = [0u8; SERIALIZED_LEN];
        class.mem_handle_serialize(&mut buf, &handle).unwrap();
        buf[16] = 9;
        assert_eq!(
            class.mem_handle_deserialize(&buf).unwrap_err().code(),
            NaCode::INVALID_PARAM
        );

        let err = class
            .mem_handle_create(std::ptr::null(), 8, MemAttr::ReadWrite)
            .unwrap_err();
        assert_eq!(err.code(), NaCode::INVALID_PARAM);
    }

    #[test]
    fn test_put_then_get() {
        let (_provider, registry) = setup(OfiConfig::default());
        let server = NaOfiClass::initialize(&registry, "verbs", true).unwrap();
        let client = NaOfiClass::initialize(&registry, "verbs", false).unwrap();
        let (ctx, sink) = sink();
        let peer = lookup(&client, server.uri());

        let mut remote_buf = vec![0u8; 64];
        let remote = server
            .mem_handle_create(remote_buf.as_mut_ptr(), remote_buf.len(), MemAttr::ReadWrite)
            .unwrap();
        let mut wire = vec![0u8; SERIALIZED_LEN];
        server.mem_handle_serialize(&mut wire, &remote).unwrap();
        let remote = client.mem_handle_deserialize(&wire).unwrap();

        let local_buf: Vec<u8> = (0..32).collect();
        let local = client
            .mem_handle_create(local_buf.as_ptr(), local_buf.len(), MemAttr::ReadOnly)
            .unwrap();
        let (put_cb, puts) = recorder();
        let req = RmaRequest {
            local: &local,
            local_offset: 8,
            remote: &remote,
            remote_offset: 16,
            length: 16,
            remote_addr: &peer,
        };
        // SAFETY: both buffers outlive the drain below.
        unsafe { client.put(&sink, put_cb, &req, None) }.unwrap();
        drain(&[&client], &ctx, 1);
        assert!(puts.lock()[0].ret.is_ok());
        assert_eq!(&remote_buf[16..32], &local_buf[8..24]);

        let mut back_buf = vec![0u8; 16];
        let back = client
            .mem_handle_create(back_buf.as_mut_ptr(), back_buf.len(), MemAttr::WriteOnly)
            .unwrap();
        let (get_cb, gets) = recorder();
        let req = RmaRequest {
            local: &back,
            local_offset: 0,
            remote: &remote,
            remote_offset: 16,
            length: 16,
            remote_addr: &peer,
        };
        // SAFETY: as above.
        unsafe { client.get(&sink, get_cb, &req, None) }.unwrap();
        drain(&[&client], &ctx, 1);
        let gets = gets.lock();
        assert_eq!(gets[0].kind, OpKind::Get);
        assert!(matches!(gets[0].info, CompletionInfo::Get));
        assert_eq!(back_buf, local_buf[8..24]);
    }

    #[test]
    fn test_out_of_range_request_rejected() {
        let (_provider, registry) = setup(OfiConfig::default());
        let class = NaOfiClass::initialize(&registry, "sockets", true).unwrap();
        let (_ctx, sink) = sink();
        let me = class.addr_self().unwrap();
        let buf = vec![0u8; 16];
        let handle = class
            .mem_handle_create(buf.as_ptr(), buf.len(), MemAttr::ReadWrite)
            .unwrap();
        let req = RmaRequest {
            local: &handle,
            local_offset: 8,
            remote: &handle,
            remote_offset: 0,
            length: 9,
            remote_addr: &me,
        };
        // SAFETY: rejected before anything is posted.
        let err = unsafe { class.put(&sink, Box::new(|_| {}), &req, None) }.unwrap_err();
        assert_eq!(err.code(), NaCode::INVALID_PARAM);
        let req = RmaRequest {
            remote_offset: u64::MAX,
            length: 1,
            local_offset: 0,
            ..req
        };
        // SAFETY: as above.
        let err = unsafe { class.get(&sink, Box::new(|_| {}), &req, None) }.unwrap_err();
        assert_eq!(err.code(), NaCode::INVALID_PARAM);
    }
}
