//! Completion delivery: the typed result handed to callbacks, the sink
//! trait progress hands results to, and [`Context`], a queue-backed sink.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use naofi_types::{make_error, NaCode, Result, Status};

use crate::addr::Addr;
use crate::op::{OpId, OpKind};

/// Kind-specific result of a finished operation. Receive buffers are handed
/// back to the caller here.
#[derive(Debug)]
pub enum CompletionInfo {
    Lookup {
        addr: Addr,
    },
    SendUnexpected,
    RecvUnexpected {
        buf: Vec<u8>,
        actual_size: usize,
        /// `None` when the receive was canceled.
        source: Option<Addr>,
        tag: u64,
    },
    SendExpected,
    RecvExpected {
        buf: Vec<u8>,
        actual_size: usize,
        tag: u64,
    },
    Put,
    Get,
}

#[derive(Debug)]
pub struct CallbackInfo {
    /// SUCCESS, CANCELED, or SIZE_ERROR for a receive that did not fit.
    pub ret: Status,
    pub kind: OpKind,
    pub info: CompletionInfo,
}

pub type Callback = Box<dyn FnOnce(CallbackInfo) + Send + 'static>;

/// A finished operation waiting for its callback to run.
pub struct Completion {
    callback: Callback,
    info: CallbackInfo,
    op: OpId,
}

impl Completion {
    pub(crate) fn new(callback: Callback, info: CallbackInfo, op: OpId) -> Self {
        Self { callback, info, op }
    }

    pub fn info(&self) -> &CallbackInfo {
        &self.info
    }

    pub fn op(&self) -> &OpId {
        &self.op
    }

    /// Run the callback, then release the engine's reference to the
    /// operation.
    pub fn invoke(self) {
        let Completion { callback, info, op } = self;
        callback(info);
        drop(op);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("info", &self.info)
            .field("op", &self.op)
            .finish()
    }
}

/// Receives finished operations from progress for later invocation.
pub trait CompletionSink: Send + Sync {
    fn add(&self, completion: Completion) -> Result<()>;
}

/// FIFO completion queue with a blocking trigger.
#[derive(Default)]
pub struct Context {
    queue: Mutex<VecDeque<Completion>>,
    ready: Condvar,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Wait up to `timeout` for completions and invoke at most `max_count`
    /// of them, returning how many ran. TIMEOUT when none arrived.
    ///
    /// Callbacks run without the queue lock held, so they may post new
    /// operations against the same context.
    pub fn trigger(&self, timeout: Duration, max_count: usize) -> Result<usize> {
        let deadline = Instant::now().checked_add(timeout);
        let mut count = 0;
        while count < max_count {
            let next = {
                let mut queue = self.queue.lock();
                while queue.is_empty() && count == 0 {
                    match deadline {
                        Some(deadline) => {
                            if self.ready.wait_until(&mut queue, deadline).timed_out() {
                                break;
                            }
                        }
                        None => self.ready.wait(&mut queue),
                    }
                }
                queue.pop_front()
            };
            match next {
                Some(completion) => {
                    completion.invoke();
                    count += 1;
                }
                None => break,
            }
        }
        if count == 0 {
            return make_error(NaCode::TIMEOUT);
        }
        Ok(count)
    }
}

impl CompletionSink for Context {
    fn add(&self, completion: Completion) -> Result<()> {
        self.queue.lock().push_back(completion);
        self.ready.notify_one();
        Ok(())
    }
}
