use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context as _};
use bytes::Bytes;
use clap::Parser;
use naofi_fabric_inproc::InprocProvider;
use naofi_logging::LogConfig;
use naofi_transport::{
    Addr, Callback, CallbackInfo, CompletionInfo, CompletionSink, Context, FabricRegistry, MemAttr,
    NaOfiClass, OfiConfig, RmaRequest, MAX_UNEXPECTED_SIZE,
};
use serde::{Deserialize, Serialize};

/// Ping-pong latency demo over the in-process fabric.
///
/// Opens a listening and a client instance, exchanges unexpected pings and
/// expected pongs, then runs one RMA put/get round.
#[derive(Parser, Debug)]
#[command(name = "naofi-pingpong", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Provider to run over (sockets, verbs, psm2)
    #[arg(short, long, default_value = "sockets")]
    protocol: String,

    #[arg(short = 'n', long, default_value_t = 1000)]
    iterations: u32,

    /// Message size in bytes
    #[arg(short, long, default_value_t = 64)]
    size: usize,

    /// Dump default configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PingpongConfig {
    #[serde(default)]
    ofi: OfiConfig,
    #[serde(default)]
    log: LogConfig,
}

impl PingpongConfig {
    fn load(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.ofi.validate()?;
        Ok(config)
    }
}

/// Completion callback forwarding the result to `tx`.
fn forward(tx: &Sender<CallbackInfo>) -> Callback {
    let tx = tx.clone();
    Box::new(move |info| {
        let _ = tx.send(info);
    })
}

/// Callback for sends: only failures are interesting.
fn check_send() -> Callback {
    Box::new(|info: CallbackInfo| {
        if !info.ret.is_ok() {
            tracing::error!(kind = ?info.kind, ret = %info.ret, "send failed");
        }
    })
}

struct Driver<'a> {
    classes: [&'a NaOfiClass; 2],
    ctx: &'a Context,
}

impl Driver<'_> {
    /// Progress both instances until `rx` yields a result.
    fn wait(&self, rx: &Receiver<CallbackInfo>) -> anyhow::Result<CallbackInfo> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(info) = rx.try_recv() {
                if !info.ret.is_ok() {
                    bail!("{:?} completed with {}", info.kind, info.ret);
                }
                return Ok(info);
            }
            if Instant::now() >= deadline {
                bail!("no completion within 5s");
            }
            for class in self.classes {
                if let Err(status) = class.progress(Duration::ZERO) {
                    if status.code() != naofi_types::NaCode::TIMEOUT {
                        return Err(status.into());
                    }
                }
            }
            let _ = self.ctx.trigger(Duration::ZERO, usize::MAX);
        }
    }
}

fn lookup(class: &NaOfiClass, driver: &Driver<'_>, sink: &Arc<dyn CompletionSink>, uri: &str) -> anyhow::Result<Addr> {
    let (tx, rx) = mpsc::channel();
    class.addr_lookup(sink, forward(&tx), uri, None)?;
    match driver.wait(&rx)?.info {
        CompletionInfo::Lookup { addr } => Ok(addr),
        other => bail!("lookup returned {other:?}"),
    }
}

struct Latency {
    min: Duration,
    max: Duration,
    total: Duration,
    count: u32,
}

impl Latency {
    fn new() -> Self {
        Self {
            min: Duration::MAX,
            max: Duration::ZERO,
            total: Duration::ZERO,
            count: 0,
        }
    }

    fn record(&mut self, d: Duration) {
        self.min = self.min.min(d);
        self.max = self.max.max(d);
        self.total += d;
        self.count += 1;
    }

    fn mean(&self) -> Duration {
        self.total.checked_div(self.count).unwrap_or_default()
    }
}

fn ping_pong(
    server: &NaOfiClass,
    client: &NaOfiClass,
    driver: &Driver<'_>,
    sink: &Arc<dyn CompletionSink>,
    iterations: u32,
    size: usize,
) -> anyhow::Result<Latency> {
    let to_server = lookup(client, driver, sink, server.uri())?;
    let (server_tx, server_rx) = mpsc::channel();
    let (client_tx, client_rx) = mpsc::channel();
    let ping = Bytes::from(vec![0x5a; size]);
    let mut latency = Latency::new();

    for round in 0..iterations {
        let tag = u64::from(round) % (client.msg_get_max_tag() + 1);
        let start = Instant::now();

        server.msg_recv_unexpected(sink, forward(&server_tx), vec![0; MAX_UNEXPECTED_SIZE], None)?;
        client.msg_recv_expected(sink, forward(&client_tx), vec![0; size], &to_server, tag, None)?;
        client.msg_send_unexpected(sink, check_send(), ping.clone(), &to_server, tag, None)?;

        let CompletionInfo::RecvUnexpected {
            buf,
            actual_size,
            source,
            tag: got,
        } = driver.wait(&server_rx)?.info
        else {
            bail!("server expected an unexpected receive");
        };
        let source = source.ok_or_else(|| anyhow!("ping carried no source"))?;
        let pong = Bytes::copy_from_slice(&buf[..actual_size]);
        server.msg_send_expected(sink, check_send(), pong, &source, got, None)?;

        let CompletionInfo::RecvExpected { actual_size, .. } = driver.wait(&client_rx)?.info else {
            bail!("client expected an expected receive");
        };
        if actual_size != size {
            bail!("pong of {actual_size} bytes, sent {size}");
        }
        latency.record(start.elapsed());
    }
    Ok(latency)
}

fn rma_round(
    server: &NaOfiClass,
    client: &NaOfiClass,
    driver: &Driver<'_>,
    sink: &Arc<dyn CompletionSink>,
    size: usize,
) -> anyhow::Result<Duration> {
    let to_server = lookup(client, driver, sink, server.uri())?;
    let mut exposed = vec![0u8; size];
    let handle = server.mem_handle_create(exposed.as_mut_ptr(), size, MemAttr::ReadWrite)?;
    let mut wire = vec![0u8; server.mem_handle_get_serialize_size(&handle)];
    server.mem_handle_serialize(&mut wire, &handle)?;
    let remote = client.mem_handle_deserialize(&wire)?;

    let pattern: Vec<u8> = (0..size).map(|i| i as u8).collect();
    let mut readback = vec![0u8; size];
    let local = client.mem_handle_create(pattern.as_ptr(), size, MemAttr::ReadOnly)?;
    let back = client.mem_handle_create(readback.as_mut_ptr(), size, MemAttr::WriteOnly)?;
    let (tx, rx) = mpsc::channel();

    let start = Instant::now();
    let put = RmaRequest {
        local: &local,
        local_offset: 0,
        remote: &remote,
        remote_offset: 0,
        length: size as u64,
        remote_addr: &to_server,
    };
    // SAFETY: every buffer outlives the wait below.
    unsafe { client.put(sink, forward(&tx), &put, None)? };
    driver.wait(&rx)?;
    let get = RmaRequest { local: &back, ..put };
    // SAFETY: as above.
    unsafe { client.get(sink, forward(&tx), &get, None)? };
    driver.wait(&rx)?;
    let elapsed = start.elapsed();

    if exposed != pattern || readback != pattern {
        bail!("RMA data mismatch");
    }
    server.mem_handle_free(handle);
    Ok(elapsed)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = PingpongConfig::load(args.config.as_ref())?;

    if args.dump_default_config {
        print!("{}", toml::to_string_pretty(&PingpongConfig::default())?);
        return Ok(());
    }

    let _guard = naofi_logging::init_logging(&config.log)?;
    if args.size == 0 || args.size > MAX_UNEXPECTED_SIZE {
        bail!("size must be within 1..={MAX_UNEXPECTED_SIZE}");
    }

    let ip: Ipv4Addr = config
        .ofi
        .ip
        .parse()
        .with_context(|| format!("bad ip {}", config.ofi.ip))?;
    let provider = Arc::new(
        InprocProvider::builder()
            .interface(config.ofi.interface.clone(), ip)
            .build(),
    );
    let registry = FabricRegistry::new(provider, config.ofi);
    if !NaOfiClass::check_protocol(&registry, &args.protocol) {
        bail!("protocol {} is not available", args.protocol);
    }

    let server = NaOfiClass::initialize(&registry, &args.protocol, true)?;
    let client = NaOfiClass::initialize(&registry, &args.protocol, false)?;
    tracing::info!(server = server.uri(), client = client.uri(), "instances up");

    let ctx = Arc::new(Context::new());
    let sink: Arc<dyn CompletionSink> = ctx.clone();
    let driver = Driver {
        classes: [&server, &client],
        ctx: &ctx,
    };

    let latency = ping_pong(&server, &client, &driver, &sink, args.iterations, args.size)?;
    println!(
        "{} x {} bytes over {}: mean {:?}, min {:?}, max {:?}",
        latency.count,
        args.size,
        args.protocol,
        latency.mean(),
        latency.min,
        latency.max
    );
    let rma = rma_round(&server, &client, &driver, &sink, args.size)?;
    println!("put + get of {} bytes: {:?}", args.size, rma);

    client.finalize().map_err(|e| anyhow!(e.status))?;
    server.finalize().map_err(|e| anyhow!(e.status))?;
    registry.shutdown()?;
    tracing::info!("done");
    Ok(())
}
