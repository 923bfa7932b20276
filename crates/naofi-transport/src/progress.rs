//! Completion-queue progress, completion delivery and cancellation.

use std::time::{Duration, Instant};

use naofi_fabric::{CompletionFlags, CqEntry, FabricError, FiAddr, FI_ADDR_UNSPEC};
use naofi_types::{make_error, make_error_msg, NaCode, Result, Status};

use crate::addr::Addr;
use crate::class::NaOfiClass;
use crate::completion::{CallbackInfo, Completion, CompletionInfo};
use crate::error::FabricContext;
use crate::msg::{is_expected_tag, user_tag};
use crate::op::{Finished, OpId, OpKind, Payload};

/// What the provider reported for a finished operation.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub(crate) len: usize,
    pub(crate) tag: u64,
    pub(crate) source: Option<Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventClass {
    Send,
    Recv,
    Rma,
}

fn classify(flags: CompletionFlags) -> Option<EventClass> {
    if flags.contains(CompletionFlags::SEND) {
        Some(EventClass::Send)
    } else if flags.contains(CompletionFlags::RECV) {
        Some(EventClass::Recv)
    } else if flags.intersects(CompletionFlags::READ | CompletionFlags::WRITE) {
        Some(EventClass::Rma)
    } else {
        None
    }
}

/// Bytes of a `len`-byte message that landed in a `cap`-byte buffer,
/// downgrading `ret` to SIZE_ERROR when it did not fit.
fn fit(ret: &mut Status, len: usize, cap: usize) -> usize {
    if len > cap && ret.is_ok() {
        *ret = Status::with_message(
            NaCode::SIZE_ERROR,
            format!("message of {len} bytes exceeds buffer of {cap}"),
        );
    }
    len.min(cap)
}

impl NaOfiClass {
    /// Poll the completion queue until one event has been delivered or
    /// `timeout` has elapsed (TIMEOUT). Entries whose operation was already
    /// completed locally are skipped. A timeout too large to represent as a
    /// deadline waits without bound.
    pub fn progress(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let event = match self.endpoint.cq.read_from() {
                Ok(event) => Some(event),
                Err(FabricError::Again) => None,
                Err(FabricError::Avail) => Some(self.read_error_event()?),
                Err(err) => return Err(err).fabric_context("read completion queue"),
            };
            match event {
                Some((entry, src)) => {
                    if self.dispatch(entry, src)? {
                        return Ok(());
                    }
                }
                None => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return make_error(NaCode::TIMEOUT);
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Turn the error entry at the head of the queue into a regular event,
    /// for the two error kinds that are not failures.
    fn read_error_event(&self) -> Result<(CqEntry, FiAddr)> {
        let err = self
            .endpoint
            .cq
            .read_err()
            .fabric_context("read completion error")?;
        match err.err {
            FabricError::Canceled => Ok((
                CqEntry {
                    context: err.context,
                    flags: err.flags,
                    len: 0,
                    tag: err.tag,
                },
                FI_ADDR_UNSPEC,
            )),
            FabricError::AddrNotAvail => {
                let src = self
                    .endpoint
                    .domain
                    .av()
                    .insert(&err.err_data)
                    .fabric_context("insert source address")?;
                tracing::debug!(src, context = err.context, "resolved unknown sender");
                Ok((
                    CqEntry {
                        context: err.context,
                        flags: err.flags,
                        len: err.len,
                        tag: err.tag,
                    },
                    src,
                ))
            }
            other => {
                tracing::error!(error = %other, context = err.context, "completion queue error");
                make_error_msg(
                    NaCode::PROTOCOL_ERROR,
                    format!("completion error on context {}: {other}", err.context),
                )
            }
        }
    }

    /// Route one event to its operation. `Ok(false)` when the entry was
    /// stale and nothing was delivered.
    fn dispatch(&self, entry: CqEntry, src: FiAddr) -> Result<bool> {
        let Some(class) = classify(entry.flags) else {
            tracing::error!(flags = ?entry.flags, context = entry.context, "unclassifiable completion");
            return make_error_msg(
                NaCode::PROTOCOL_ERROR,
                format!("completion with unsupported flags {:?}", entry.flags),
            );
        };
        let Some(op) = self.ops.claim(entry.context) else {
            tracing::warn!(context = entry.context, ?class, "completion for an operation no longer in flight");
            return Ok(false);
        };
        tracing::trace!(context = entry.context, ?class, len = entry.len, "completion event");
        match class {
            EventClass::Send => self.handle_send(op)?,
            EventClass::Recv => self.handle_recv(op, &entry, src)?,
            EventClass::Rma => self.handle_rma(op)?,
        }
        Ok(true)
    }

    fn result_for(op: &OpId) -> Status {
        if op.is_canceled() {
            Status::new(NaCode::CANCELED)
        } else {
            Status::ok()
        }
    }

    fn handle_send(&self, op: OpId) -> Result<()> {
        match op.kind() {
            Some(OpKind::SendUnexpected | OpKind::SendExpected) => {
                let ret = Self::result_for(&op);
                self.complete(op, ret, Outcome::default())
            }
            _ => self.mismatch(op, "send"),
        }
    }

    fn handle_recv(&self, op: OpId, entry: &CqEntry, src: FiAddr) -> Result<()> {
        let ret = Self::result_for(&op);
        let canceled = op.is_canceled();
        match op.kind() {
            Some(OpKind::RecvUnexpected) => {
                self.ops.remove_unexpected(entry.context);
                if canceled {
                    return self.complete(op, ret, Outcome::default());
                }
                if is_expected_tag(entry.tag) {
                    return self.mismatch(op, "expected-tagged receive");
                }
                let source = Addr::from_unexpected(src, self.endpoint.uri_of(src));
                let outcome = Outcome {
                    len: entry.len,
                    tag: user_tag(entry.tag),
                    source: Some(source),
                };
                self.complete(op, ret, outcome)
            }
            Some(OpKind::RecvExpected) => {
                if !canceled && !is_expected_tag(entry.tag) {
                    return self.mismatch(op, "unexpected-tagged receive");
                }
                let outcome = Outcome {
                    len: entry.len,
                    tag: user_tag(entry.tag),
                    source: None,
                };
                self.complete(op, ret, outcome)
            }
            _ => self.mismatch(op, "receive"),
        }
    }

    fn handle_rma(&self, op: OpId) -> Result<()> {
        match op.kind() {
            Some(OpKind::Put | OpKind::Get) => {
                let ret = Self::result_for(&op);
                self.complete(op, ret, Outcome::default())
            }
            _ => self.mismatch(op, "RMA"),
        }
    }

    /// An event whose class does not fit the operation it names. The
    /// operation completes with PROTOCOL_ERROR and progress reports it.
    fn mismatch(&self, op: OpId, event: &str) -> Result<()> {
        let kind = op.kind();
        tracing::error!(?kind, event, "completion does not match operation");
        let status = Status::with_message(
            NaCode::PROTOCOL_ERROR,
            format!("{event} completion for a {kind:?} operation"),
        );
        self.complete(op, status.clone(), Outcome::default())?;
        Err(status)
    }

    /// Mark `op` completed and hand its callback to the sink it was posted
    /// with. Receive buffers travel back to the caller in the result.
    pub(crate) fn complete(&self, op: OpId, mut ret: Status, outcome: Outcome) -> Result<()> {
        let Finished {
            kind,
            callback,
            sink,
            addr,
            payload,
        } = op.finish()?;
        let info = match payload {
            Payload::Idle => {
                return make_error_msg(NaCode::PROTOCOL_ERROR, "completed operation has no payload")
            }
            Payload::Lookup { addr } => CompletionInfo::Lookup { addr },
            Payload::SendUnexpected { .. } => CompletionInfo::SendUnexpected,
            Payload::RecvUnexpected { buf } => {
                let actual_size = fit(&mut ret, outcome.len, buf.len());
                CompletionInfo::RecvUnexpected {
                    buf,
                    actual_size,
                    source: outcome.source,
                    tag: outcome.tag,
                }
            }
            Payload::SendExpected { .. } => CompletionInfo::SendExpected,
            Payload::RecvExpected { buf, tag } => {
                let actual_size = fit(&mut ret, outcome.len, buf.len());
                CompletionInfo::RecvExpected {
                    buf,
                    actual_size,
                    tag,
                }
            }
            Payload::Put => CompletionInfo::Put,
            Payload::Get => CompletionInfo::Get,
        };
        drop(addr);
        tracing::trace!(?kind, ret = %ret, "operation completed");
        sink.add(Completion::new(callback, CallbackInfo { ret, kind, info }, op))
    }

    /// Request cancellation of `op`. A no-op once it has completed.
    ///
    /// Receives complete as CANCELED on a later progress call. A send or
    /// RMA operation the provider can no longer cancel completes as
    /// CANCELED immediately, and its provider completion is then skipped.
    pub fn cancel(&self, op: &OpId) -> Result<()> {
        if op.is_completed() {
            return Ok(());
        }
        op.set_canceled();
        let token = op.token();
        match op.kind() {
            None | Some(OpKind::Lookup) => Ok(()),
            Some(OpKind::RecvUnexpected) => {
                self.cancel_at_provider(token, "cancel unexpected receive")?;
                if self.ops.remove_unexpected(token).is_none() {
                    tracing::debug!(token, "unexpected receive already dequeued");
                }
                Ok(())
            }
            Some(OpKind::RecvExpected) => self.cancel_at_provider(token, "cancel expected receive"),
            Some(kind @ (OpKind::SendUnexpected | OpKind::SendExpected | OpKind::Put | OpKind::Get)) => {
                match self.endpoint.ep.cancel(token) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        tracing::debug!(?kind, token, error = %err, "provider refused cancel");
                        match self.ops.claim(token) {
                            Some(op) => self.complete(op, Status::new(NaCode::CANCELED), Outcome::default()),
                            None => Ok(()),
                        }
                    }
                }
            }
        }
    }

    /// Provider cancel where `NotFound` means the completion is already
    /// queued and will be delivered by progress.
    fn cancel_at_provider(&self, token: u64, what: &str) -> Result<()> {
        match self.endpoint.ep.cancel(token) {
            Ok(()) | Err(FabricError::NotFound(_)) => Ok(()),
            Err(err) => Err(err).fabric_context(what),
        }
    }
}
