//! Operation handles and the engine-side tables tracking them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use naofi_fabric::{IoVec, IoVecMut};
use parking_lot::Mutex;

use naofi_types::{make_error_msg, NaCode, Result};

use crate::addr::Addr;
use crate::completion::{Callback, CompletionSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Lookup,
    SendUnexpected,
    RecvUnexpected,
    SendExpected,
    RecvExpected,
    Put,
    Get,
}

/// Operation-specific data. Buffers live here while the provider may still
/// touch them.
pub(crate) enum Payload {
    Idle,
    Lookup { addr: Addr },
    SendUnexpected { data: Bytes },
    RecvUnexpected { buf: Vec<u8> },
    SendExpected { data: Bytes },
    RecvExpected { buf: Vec<u8>, tag: u64 },
    Put,
    Get,
}

impl Payload {
    fn kind(&self) -> Option<OpKind> {
        match self {
            Payload::Idle => None,
            Payload::Lookup { .. } => Some(OpKind::Lookup),
            Payload::SendUnexpected { .. } => Some(OpKind::SendUnexpected),
            Payload::RecvUnexpected { .. } => Some(OpKind::RecvUnexpected),
            Payload::SendExpected { .. } => Some(OpKind::SendExpected),
            Payload::RecvExpected { .. } => Some(OpKind::RecvExpected),
            Payload::Put => Some(OpKind::Put),
            Payload::Get => Some(OpKind::Get),
        }
    }
}

struct OpState {
    token: u64,
    kind: Option<OpKind>,
    callback: Option<Callback>,
    sink: Option<Arc<dyn CompletionSink>>,
    addr: Option<Addr>,
    payload: Payload,
}

struct OpInner {
    completed: AtomicBool,
    canceled: AtomicBool,
    state: Mutex<OpState>,
}

/// Handle to one asynchronous operation.
///
/// A fresh handle reads as completed so destroying it without posting is
/// always safe. Clones share the operation; the engine keeps its own clone
/// from post until the completion callback has run.
#[derive(Clone)]
pub struct OpId(Arc<OpInner>);

/// Everything a completion needs, taken out of the operation at once.
pub(crate) struct Finished {
    pub(crate) kind: OpKind,
    pub(crate) callback: Callback,
    pub(crate) sink: Arc<dyn CompletionSink>,
    pub(crate) addr: Option<Addr>,
    pub(crate) payload: Payload,
}

impl OpId {
    pub(crate) fn new() -> Self {
        Self(Arc::new(OpInner {
            completed: AtomicBool::new(true),
            canceled: AtomicBool::new(false),
            state: Mutex::new(OpState {
                token: 0,
                kind: None,
                callback: None,
                sink: None,
                addr: None,
                payload: Payload::Idle,
            }),
        }))
    }

    pub fn is_completed(&self) -> bool {
        self.0.completed.load(Ordering::Acquire)
    }

    pub fn is_canceled(&self) -> bool {
        self.0.canceled.load(Ordering::Acquire)
    }

    /// Kind of the last post, `None` if never posted.
    pub fn kind(&self) -> Option<OpKind> {
        self.0.state.lock().kind
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(a: &OpId, b: &OpId) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn token(&self) -> u64 {
        self.0.state.lock().token
    }

    /// Prepare for a new post. The operation reads as in flight from here
    /// until it is finished or disarmed.
    pub(crate) fn arm(
        &self,
        token: u64,
        payload: Payload,
        callback: Callback,
        sink: Arc<dyn CompletionSink>,
        addr: Option<Addr>,
    ) {
        let mut state = self.0.state.lock();
        state.token = token;
        state.kind = payload.kind();
        state.payload = payload;
        state.callback = Some(callback);
        state.sink = Some(sink);
        state.addr = addr;
        self.0.canceled.store(false, Ordering::Release);
        self.0.completed.store(false, Ordering::Release);
    }

    /// Undo `arm` after a failed post, releasing the references it took.
    pub(crate) fn disarm(&self) {
        let mut state = self.0.state.lock();
        state.callback = None;
        state.sink = None;
        state.addr = None;
        state.payload = Payload::Idle;
        self.0.completed.store(true, Ordering::Release);
    }

    pub(crate) fn set_canceled(&self) {
        self.0.canceled.store(true, Ordering::Release);
    }

    /// Mark the operation completed and take its completion data.
    pub(crate) fn finish(&self) -> Result<Finished> {
        let mut state = self.0.state.lock();
        let kind = state.kind;
        let callback = state.callback.take();
        let sink = state.sink.take();
        let addr = state.addr.take();
        let payload = std::mem::replace(&mut state.payload, Payload::Idle);
        self.0.completed.store(true, Ordering::Release);
        match (kind, callback, sink) {
            (Some(kind), Some(callback), Some(sink)) => Ok(Finished {
                kind,
                callback,
                sink,
                addr,
                payload,
            }),
            _ => make_error_msg(
                NaCode::PROTOCOL_ERROR,
                "completing an operation that was never posted",
            ),
        }
    }

    /// Descriptor over the payload being sent.
    pub(crate) fn send_iov(&self) -> Option<IoVec> {
        match &self.0.state.lock().payload {
            Payload::SendUnexpected { data } | Payload::SendExpected { data } => {
                Some(IoVec::from_slice(data))
            }
            _ => None,
        }
    }

    /// Descriptor over the receive buffer. The heap allocation does not
    /// move while the payload stays in place.
    pub(crate) fn recv_iov(&self) -> Option<IoVecMut> {
        match &mut self.0.state.lock().payload {
            Payload::RecvUnexpected { buf } | Payload::RecvExpected { buf, .. } => {
                Some(IoVecMut::from_slice(buf))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpId")
            .field("kind", &self.kind())
            .field("completed", &self.is_completed())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Posted operations of one class.
///
/// `inflight` maps the context token handed to the provider back to the
/// operation. Removing a token is the right to complete it, so a
/// completion racing a local cancel is delivered exactly once.
pub(crate) struct OpTable {
    inflight: DashMap<u64, OpId>,
    /// Posted unexpected receives; token order is posting order.
    unexpected: Mutex<BTreeMap<u64, OpId>>,
    next_token: AtomicU64,
}

impl OpTable {
    pub(crate) fn new() -> Self {
        Self {
            inflight: DashMap::new(),
            unexpected: Mutex::new(BTreeMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Reuse a caller-supplied handle or create one.
    pub(crate) fn prepare(&self, op: Option<&OpId>) -> Result<OpId> {
        match op {
            Some(op) if !op.is_completed() => make_error_msg(
                NaCode::INVALID_PARAM,
                "operation is still in flight",
            ),
            Some(op) => Ok(op.clone()),
            None => Ok(OpId::new()),
        }
    }

    pub(crate) fn track(&self, token: u64, op: &OpId, unexpected: bool) {
        if unexpected {
            self.unexpected.lock().insert(token, op.clone());
        }
        self.inflight.insert(token, op.clone());
    }

    pub(crate) fn untrack(&self, token: u64) -> Option<OpId> {
        self.unexpected.lock().remove(&token);
        self.inflight.remove(&token).map(|(_, op)| op)
    }

    /// Claim the right to complete `token`.
    pub(crate) fn claim(&self, token: u64) -> Option<OpId> {
        self.inflight.remove(&token).map(|(_, op)| op)
    }

    pub(crate) fn remove_unexpected(&self, token: u64) -> Option<OpId> {
        self.unexpected.lock().remove(&token)
    }

    pub(crate) fn unexpected_len(&self) -> usize {
        self.unexpected.lock().len()
    }

    pub(crate) fn unexpected_contains(&self, op: &OpId) -> bool {
        self.unexpected
            .lock()
            .values()
            .any(|queued| OpId::ptr_eq(queued, op))
    }

    pub(crate) fn inflight_len(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Context;

    fn armed(table: &OpTable, payload: Payload) -> (OpId, u64) {
        let op = table.prepare(None).unwrap();
        let token = table.next_token();
        op.arm(
            token,
            payload,
            Box::new(|_| {}),
            Arc::new(Context::new()),
            None,
        );
        (op, token)
    }

    #[test]
    fn test_fresh_op_reads_completed() {
        let op = OpId::new();
        assert!(op.is_completed());
        assert!(!op.is_canceled());
        assert_eq!(op.kind(), None);
        assert_eq!(op.refcount(), 1);
    }

    #[test]
    fn test_prepare_rejects_inflight_reuse() {
        let table = OpTable::new();
        let (op, _) = armed(&table, Payload::Put);
        assert!(!op.is_completed());
        let err = table.prepare(Some(&op)).unwrap_err();
        assert_eq!(err.code(), NaCode::INVALID_PARAM);

        op.disarm();
        let again = table.prepare(Some(&op)).unwrap();
        assert!(OpId::ptr_eq(&op, &again));
    }

    #[test]
    fn test_finish_takes_state_once() {
        let table = OpTable::new();
        let (op, _) = armed(&table, Payload::SendExpected { data: Bytes::from_static(b"x") });
        let finished = op.finish().unwrap();
        assert_eq!(finished.kind, OpKind::SendExpected);
        assert!(op.is_completed());
        assert!(op.finish().is_err());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let table = OpTable::new();
        let (op, token) = armed(&table, Payload::RecvUnexpected { buf: vec![0; 8] });
        table.track(token, &op, true);
        assert_eq!(table.unexpected_len(), 1);
        assert!(table.unexpected_contains(&op));

        assert!(table.claim(token).is_some());
        assert!(table.claim(token).is_none());
        assert_eq!(table.inflight_len(), 0);
        assert!(table.remove_unexpected(token).is_some());
        assert_eq!(table.unexpected_len(), 0);
    }

    #[test]
    fn test_iov_points_into_payload() {
        let table = OpTable::new();
        let (op, _) = armed(&table, Payload::RecvExpected { buf: vec![0; 32], tag: 5 });
        let iov = op.recv_iov().unwrap();
        assert_eq!(iov.len, 32);
        assert!(op.send_iov().is_none());
        assert_eq!(op.recv_iov().unwrap().base, iov.base);
    }
}
