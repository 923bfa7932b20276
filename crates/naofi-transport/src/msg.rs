//! Tagged messaging.
//!
//! Expected and unexpected messages share the provider's 64-bit tag space:
//! - expected traffic carries `EXPECTED_TAG_FLAG | tag`, matched exactly
//!   against one peer;
//! - unexpected sends carry the bare tag (flag clear) and every unexpected
//!   receive is posted from any source with `UNEXPECTED_TAG_IGNORE` masking
//!   the low 32 bits, so it matches any tag with the flag clear.
//!
//! User tags are at most `MAX_TAG`, below the flag bit, so the two classes
//! never match each other.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use naofi_fabric::{FabricError, FI_ADDR_UNSPEC};
use naofi_types::{make_error_msg, NaCode, Result};

use crate::addr::Addr;
use crate::class::NaOfiClass;
use crate::completion::{Callback, CompletionSink};
use crate::error::FabricContext;
use crate::op::{OpId, Payload};
use crate::{
    EXPECTED_TAG_FLAG, MAX_TAG, UNEXPECTED_BASE_TAG, UNEXPECTED_TAG_IGNORE,
};

/// Wire tag of an expected message.
pub(crate) fn expected_tag(tag: u64) -> u64 {
    EXPECTED_TAG_FLAG | tag
}

/// Whether a received wire tag belongs to the expected class.
pub(crate) fn is_expected_tag(raw: u64) -> bool {
    raw & !UNEXPECTED_TAG_IGNORE != 0
}

/// Caller tag carried by a wire tag of either class.
pub(crate) fn user_tag(raw: u64) -> u64 {
    raw & !EXPECTED_TAG_FLAG
}

fn check_tag(tag: u64) -> Result<()> {
    if tag > MAX_TAG {
        return make_error_msg(
            NaCode::INVALID_PARAM,
            format!("tag {tag} above maximum {MAX_TAG}"),
        );
    }
    Ok(())
}

/// Log retry pressure every this many `Again` results.
const RETRY_LOG_INTERVAL: u32 = 1024;

impl NaOfiClass {
    /// Register `op` as in flight under its token and post it, retrying on
    /// `Again` after a zero-timeout progress pass.
    ///
    /// Retries are unbounded unless `post_retry_limit` is configured. On
    /// failure the operation is untracked and disarmed.
    pub(crate) fn submit<F>(&self, op: &OpId, unexpected: bool, what: &str, mut post: F) -> Result<()>
    where
        F: FnMut(u64) -> naofi_fabric::FabricResult<()>,
    {
        let token = op.token();
        self.ops.track(token, op, unexpected);
        let mut attempts: u32 = 0;
        let result = loop {
            match post(token) {
                Ok(()) => break Ok(()),
                Err(FabricError::Again) => {
                    attempts = attempts.saturating_add(1);
                    if let Some(limit) = self.retry_limit {
                        if attempts > limit {
                            tracing::error!(attempts, "{what}: retry limit reached");
                            break make_error_msg(
                                NaCode::PROTOCOL_ERROR,
                                format!("{what}: provider busy after {limit} retries"),
                            );
                        }
                    }
                    if attempts % RETRY_LOG_INTERVAL == 0 {
                        tracing::warn!(attempts, "{what}: provider still busy");
                    }
                    if let Err(status) = self.progress(Duration::ZERO) {
                        if status.code() != NaCode::TIMEOUT {
                            tracing::warn!(%status, "{what}: progress during retry failed");
                        }
                    }
                }
                Err(err) => break Err(err).fabric_context(what),
            }
        };
        if result.is_err() {
            self.ops.untrack(token);
            op.disarm();
        }
        result
    }

    pub fn msg_send_unexpected(
        &self,
        sink: &Arc<dyn CompletionSink>,
        callback: Callback,
        data: Bytes,
        dest: &Addr,
        tag: u64,
        op: Option<&OpId>,
    ) -> Result<OpId> {
        check_tag(tag)?;
        let op = self.ops.prepare(op)?;
        op.arm(
            self.ops.next_token(),
            Payload::SendUnexpected { data },
            callback,
            sink.clone(),
            Some(dest.clone()),
        );
        let iov = self.payload_iov(&op, OpId::send_iov)?;
        let fi_addr = dest.fi_addr();
        self.submit(&op, false, "post unexpected send", |token| {
            // SAFETY: `iov` points into the payload `op` owns until it
            // completes, and the in-flight table holds `op` until then.
            unsafe { self.endpoint.ep.tsend(iov, fi_addr, tag, token) }
        })?;
        Ok(op)
    }

    /// Post a receive for any unexpected message. `buf` comes back in the
    /// completion.
    pub fn msg_recv_unexpected(
        &self,
        sink: &Arc<dyn CompletionSink>,
        callback: Callback,
        buf: Vec<u8>,
        op: Option<&OpId>,
    ) -> Result<OpId> {
        let op = self.ops.prepare(op)?;
        op.arm(
            self.ops.next_token(),
            Payload::RecvUnexpected { buf },
            callback,
            sink.clone(),
            None,
        );
        let iov = self.payload_iov(&op, OpId::recv_iov)?;
        self.submit(&op, true, "post unexpected receive", |token| {
            // SAFETY: as for sends; the buffer is owned by `op`.
            unsafe {
                self.endpoint.ep.trecv(
                    iov,
                    FI_ADDR_UNSPEC,
                    UNEXPECTED_BASE_TAG,
                    UNEXPECTED_TAG_IGNORE,
                    token,
                )
            }
        })?;
        Ok(op)
    }

    pub fn msg_send_expected(
        &self,
        sink: &Arc<dyn CompletionSink>,
        callback: Callback,
        data: Bytes,
        dest: &Addr,
        tag: u64,
        op: Option<&OpId>,
    ) -> Result<OpId> {
        check_tag(tag)?;
        let op = self.ops.prepare(op)?;
        op.arm(
            self.ops.next_token(),
            Payload::SendExpected { data },
            callback,
            sink.clone(),
            Some(dest.clone()),
        );
        let iov = self.payload_iov(&op, OpId::send_iov)?;
        let fi_addr = dest.fi_addr();
        self.submit(&op, false, "post expected send", |token| {
            // SAFETY: see `msg_send_unexpected`.
            unsafe {
                self.endpoint
                    .ep
                    .tsend(iov, fi_addr, expected_tag(tag), token)
            }
        })?;
        Ok(op)
    }

    /// Post a receive for the expected message tagged `tag` from `source`.
    pub fn msg_recv_expected(
        &self,
        sink: &Arc<dyn CompletionSink>,
        callback: Callback,
        buf: Vec<u8>,
        source: &Addr,
        tag: u64,
        op: Option<&OpId>,
    ) -> Result<OpId> {
        check_tag(tag)?;
        let op = self.ops.prepare(op)?;
        op.arm(
            self.ops.next_token(),
            Payload::RecvExpected { buf, tag },
            callback,
            sink.clone(),
            Some(source.clone()),
        );
        let iov = self.payload_iov(&op, OpId::recv_iov)?;
        let fi_addr = source.fi_addr();
        self.submit(&op, false, "post expected receive", |token| {
            // SAFETY: see `msg_recv_unexpected`.
            unsafe {
                self.endpoint
                    .ep
                    .trecv(iov, fi_addr, expected_tag(tag), 0, token)
            }
        })?;
        Ok(op)
    }

    fn payload_iov<T>(&self, op: &OpId, get: impl FnOnce(&OpId) -> Option<T>) -> Result<T> {
        match get(op) {
            Some(iov) => Ok(iov),
            None => {
                op.disarm();
                make_error_msg(NaCode::PROTOCOL_ERROR, "operation payload has no buffer")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use naofi_fabric_inproc::FaultPoint;

    use crate::completion::CompletionInfo;
    use crate::config::OfiConfig;
    use crate::op::OpKind;
    use crate::test_utils::{drain, lookup, recorder, setup, sink};

    #[test]
    fn test_tag_classes_never_collide() {
        for tag in [0, 1, 7, 42, 0xFFFF, MAX_TAG] {
            let wire = expected_tag(tag);
            assert!(is_expected_tag(wire));
            assert_eq!(user_tag(wire), tag);
            // An unexpected receive matches iff the masked tags agree.
            assert_ne!(
                wire & !UNEXPECTED_TAG_IGNORE,
                UNEXPECTED_BASE_TAG & !UNEXPECTED_TAG_IGNORE
            );
            assert!(!is_expected_tag(tag));
            assert_eq!(
                tag & !UNEXPECTED_TAG_IGNORE,
                UNEXPECTED_BASE_TAG & !UNEXPECTED_TAG_IGNORE
            );
        }
    }

    #[test]
    fn test_tag_above_max_rejected() {
        let (_provider, registry) = setup(OfiConfig::default());
        let class = NaOfiClass::initialize(&registry, "sockets", true).unwrap();
        let (_ctx, sink) = sink();
        let me = class.addr_self().unwrap();
        let err = class
            .msg_send_expected(&sink, Box::new(|_| {}), Bytes::new(), &me, MAX_TAG + 1, None)
            .unwrap_err();
        assert_eq!(err.code(), NaCode::INVALID_PARAM);
        assert_eq!(me.refcount(), 2);
    }

    #[test]
    fn test_unexpected_roundtrip_to_self() {
        let (_provider, registry) = setup(OfiConfig::default());
        let class = NaOfiClass::initialize(&registry, "sockets", true).unwrap();
        let (ctx, sink) = sink();
        let (recv_cb, recvs) = recorder();
        let (send_cb, sends) = recorder();
        let me = class.addr_self().unwrap();

        let recv = class
            .msg_recv_unexpected(&sink, recv_cb, vec![0; 64], None)
            .unwrap();
        assert!(class.is_unexpected_queued(&recv));
        class
            .msg_send_unexpected(&sink, send_cb, Bytes::from_static(b"ping"), &me, 3, None)
            .unwrap();

        drain(&[&class], &ctx, 2);
        assert_eq!(sends.lock()[0].kind, OpKind::SendUnexpected);
        let recvs = recvs.lock();
        match &recvs[0].info {
            CompletionInfo::RecvUnexpected {
                buf,
                actual_size,
                source,
                tag,
            } => {
                assert_eq!(&buf[..*actual_size], b"ping");
                assert_eq!(*tag, 3);
                let source = source.as_ref().unwrap();
                assert!(source.is_unexpected());
                assert_eq!(source.uri(), Some(class.uri()));
            }
            other => panic!("unexpected completion {other:?}"),
        }
        assert_eq!(class.unexpected_pending(), 0);
        assert!(recv.is_completed());
    }

    #[test]
    fn test_retry_on_again_drives_progress() {
        let (provider, registry) = setup(OfiConfig::default());
        let class = NaOfiClass::initialize(&registry, "sockets", true).unwrap();
        let (ctx, sink) = sink();
        let (callback, seen) = recorder();
        let me = class.addr_self().unwrap();

        provider.faults().inject_again(5);
        let recv = class
            .msg_recv_expected(&sink, callback, vec![0; 8], &me, 9, None)
            .unwrap();
        assert!(!recv.is_completed());
        class
            .msg_send_expected(&sink, Box::new(|_| {}), Bytes::from_static(b"ok"), &me, 9, None)
            .unwrap();
        drain(&[&class], &ctx, 2);
        assert!(seen.lock()[0].ret.is_ok());
    }

    #[test]
    fn test_retry_limit_fails_post_and_rolls_back() {
        let config = OfiConfig {
            post_retry_limit: Some(3),
            ..Default::default()
        };
        let (provider, registry) = setup(config);
        let class = NaOfiClass::initialize(&registry, "sockets", true).unwrap();
        let (_ctx, sink) = sink();
        let me = class.addr_self().unwrap();
        let op = class.op_create();

        provider.faults().inject_again(100);
        let err = class
            .msg_recv_unexpected(&sink, Box::new(|_| {}), vec![0; 8], Some(&op))
            .unwrap_err();
        assert_eq!(err.code(), NaCode::PROTOCOL_ERROR);
        assert!(op.is_completed());
        assert_eq!(op.refcount(), 1);
        assert_eq!(class.unexpected_pending(), 0);
        assert_eq!(me.refcount(), 2);
        provider.faults().inject_again(0);
    }

    #[test]
    fn test_post_failure_releases_addr() {
        let (_provider, registry) = setup(OfiConfig::default());
        let a = NaOfiClass::initialize(&registry, "sockets", true).unwrap();
        let b = NaOfiClass::initialize(&registry, "sockets", false).unwrap();
        let (_ctx, sink) = sink();
        let peer = lookup(&b, a.uri());
        let before = peer.refcount();
        a.finalize().unwrap();

        let err = b
            .msg_send_unexpected(&sink, Box::new(|_| {}), Bytes::from_static(b"x"), &peer, 0, None)
            .unwrap_err();
        assert_eq!(err.code(), NaCode::PROTOCOL_ERROR);
        assert_eq!(peer.refcount(), before);
    }

    #[test]
    fn test_reusing_inflight_op_is_invalid() {
        let (_provider, registry) = setup(OfiConfig::default());
        let class = NaOfiClass::initialize(&registry, "sockets", true).unwrap();
        let (_ctx, sink) = sink();
        let op = class
            .msg_recv_unexpected(&sink, Box::new(|_| {}), vec![0; 8], None)
            .unwrap();
        let err = class
            .msg_recv_unexpected(&sink, Box::new(|_| {}), vec![0; 8], Some(&op))
            .unwrap_err();
        assert_eq!(err.code(), NaCode::INVALID_PARAM);
        let err = class.op_destroy(op.clone()).unwrap_err();
        assert_eq!(err.code(), NaCode::PROTOCOL_ERROR);
        class.cancel(&op).unwrap();
    }

    #[test]
    fn test_open_failure_reported_before_post() {
        let (provider, registry) = setup(OfiConfig::default());
        provider.faults().arm(FaultPoint::OpenEndpoint);
        assert!(NaOfiClass::initialize(&registry, "sockets", true).is_err());
    }
}
