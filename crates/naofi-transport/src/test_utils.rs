//! Fixtures shared by the engine tests, built over the in-process fabric.

use std::sync::Arc;
use std::time::{Duration, Instant};

use naofi_fabric_inproc::InprocProvider;
use parking_lot::Mutex;

use crate::addr::Addr;
use crate::class::NaOfiClass;
use crate::completion::{Callback, CallbackInfo, CompletionInfo, CompletionSink, Context};
use crate::config::OfiConfig;
use crate::registry::FabricRegistry;

pub(crate) fn setup(config: OfiConfig) -> (Arc<InprocProvider>, Arc<FabricRegistry>) {
    let provider = Arc::new(InprocProvider::default());
    let registry = FabricRegistry::new(provider.clone(), config);
    (provider, registry)
}

pub(crate) fn sink() -> (Arc<Context>, Arc<dyn CompletionSink>) {
    let ctx = Arc::new(Context::new());
    let sink: Arc<dyn CompletionSink> = ctx.clone();
    (ctx, sink)
}

/// A callback recording every result it is invoked with.
pub(crate) fn recorder() -> (Callback, Arc<Mutex<Vec<CallbackInfo>>>) {
    let seen: Arc<Mutex<Vec<CallbackInfo>>> = Arc::default();
    let out = seen.clone();
    (Box::new(move |info| out.lock().push(info)), seen)
}

/// Resolve `uri` from `class` and return the looked-up address.
pub(crate) fn lookup(class: &NaOfiClass, uri: &str) -> Addr {
    let (ctx, sink) = sink();
    let (callback, seen) = recorder();
    class.addr_lookup(&sink, callback, uri, None).unwrap();
    ctx.trigger(Duration::ZERO, 1).unwrap();
    let info = seen.lock().pop().unwrap();
    assert!(info.ret.is_ok(), "lookup of {uri} failed: {}", info.ret);
    match info.info {
        CompletionInfo::Lookup { addr } => addr,
        other => panic!("unexpected completion {other:?}"),
    }
}

/// Drive progress on every class and run callbacks until `n` completions
/// have been invoked.
pub(crate) fn drain(classes: &[&NaOfiClass], ctx: &Context, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut done = 0;
    while done < n {
        assert!(Instant::now() < deadline, "only {done} of {n} completions arrived");
        for class in classes {
            let _ = class.progress(Duration::ZERO);
        }
        if let Ok(count) = ctx.trigger(Duration::ZERO, n - done) {
            done += count;
        }
    }
}
