use std::ffi::CString;
use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use devmem_nc::config::{self, Config, QueueRange, Role};
use devmem_nc::nic::{Netlink, NicControl};
use devmem_nc::provider::{page_size, DeviceBuffer, DmabufProvider, UdmabufProvider};
use devmem_nc::sender::{LineSource, MAX_IOV};
use devmem_nc::{receiver, selftest, sender};

/// Buffer size in pages, allocated once at startup.
const NUM_PAGES: usize = 16000;

const DEFAULT_WAITTIME_MS: u64 = 500;

/// Command line options.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Run as listener (RX side).
    #[clap(short = 'l')]
    listen: bool,

    /// Peer address (sender) or local bind address (listener).
    #[clap(short = 's')]
    server: Option<IpAddr>,

    /// Client-side address, used for the 5-tuple flow rule and the sender's
    /// local bind.
    #[clap(short = 'c')]
    client: Option<IpAddr>,

    /// TCP port.
    #[clap(short = 'p')]
    port: Option<u16>,

    /// Interface name.
    #[clap(short = 'f')]
    interface: String,

    /// Number of RX queues to bind.
    #[clap(short = 'q')]
    num_queues: Option<u32>,

    /// First RX queue index of the bound range.
    #[clap(short = 't')]
    start_queue: Option<u32>,

    /// Validate payload as the repeating byte sequence 0..M.
    #[clap(short = 'v')]
    validate: Option<u64>,

    /// TX max chunk size in bytes (0 = unchunked).
    #[clap(short = 'z', default_value_t = 0)]
    max_chunk: usize,

    /// Ignored; reported for compatibility with netcat-style invocations.
    extra: Vec<String>,
}

fn ifname_to_ifindex(ifname: &str) -> Result<u32> {
    let name = CString::new(ifname).context("interface name")?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        bail!("no such interface: {ifname}");
    }
    Ok(index)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    for extra in &args.extra {
        warn!("extra argument: {extra}");
    }

    let ifindex = ifname_to_ifindex(&args.interface)?;
    info!("using ifindex={ifindex}");

    let nic = Netlink;
    let selftest_role = args.server.is_none() && args.client.is_none();

    let queues = match (args.start_queue, args.num_queues) {
        (Some(start), Some(count)) => QueueRange { start, count },
        (None, None) => {
            let total = nic
                .rx_queue_count(ifindex)
                .context("couldn't detect number of queues")?;
            let range = config::default_queue_range(total, selftest_role)?;
            info!(
                "using queues {}..{}",
                range.start,
                range.start + range.count
            );
            range
        }
        _ => bail!("both -t and -q are required when either is given"),
    };

    let port = match args.port {
        Some(port) => port,
        None if selftest_role => 0,
        None => bail!("missing -p argument"),
    };
    if !selftest_role && args.server.is_none() {
        bail!("missing -s argument");
    }
    if args.validate == Some(0) {
        bail!("validation modulus must be non-zero");
    }

    let cfg = Config {
        ifname: args.interface.clone(),
        ifindex,
        listen: args.listen,
        server: args.server,
        client: args.client,
        port,
        queues,
        validation: args.validate,
        max_chunk: args.max_chunk,
        waittime_ms: DEFAULT_WAITTIME_MS,
    };

    let provider = UdmabufProvider::open().context("dma-buf provider")?;
    let mut mem = provider.allocate(page_size() * NUM_PAGES)?;

    match cfg.role() {
        Role::SelfTest => selftest::run(&cfg, &nic, &mem)?,
        Role::Listen => {
            receiver::serve(&cfg, &nic, &provider, &mem)?;
        }
        Role::Send => {
            let mut source = match cfg.validation {
                Some(modulus) => {
                    let line_size = if cfg.max_chunk > 0 {
                        (MAX_IOV * cfg.max_chunk).min(mem.len())
                    } else {
                        mem.len()
                    };
                    LineSource::pattern(modulus, line_size)
                }
                None => LineSource::stdin(),
            };
            sender::send(&cfg, &nic, &mut mem, &mut source)?;
        }
    }

    Ok(())
}
