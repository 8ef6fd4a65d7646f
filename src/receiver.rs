//! dmTCP receive engine.
//!
//! Sequences the NIC into devmem delivery (steering reset, header split,
//! RSS, flow rule, bind), then accepts one stream connection and drains
//! fragment descriptors from the control channel of each receive. Fragment
//! payloads are copied device-to-device into a staging buffer and their
//! tokens handed straight back so the kernel can recycle the pages.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::nic::{BindingHandle, FlowSpec, NicControl, QueueId};
use crate::provider::{page_size, DeviceBuffer, DmabufProvider};
use crate::sock;
use crate::uapi::{DmabufCmsg, DmabufToken, MSG_SOCK_DEVMEM, SCM_DEVMEM_DMABUF, SCM_DEVMEM_LINEAR, SO_DEVMEM_DONTNEED};
use crate::validate::Validator;

/// Linear data lands here; it only has to be big enough for the host-copy
/// slow path of one receive.
const IO_BUF_BYTES: usize = 819200;

/// Sized to hold the fragment descriptors of one receive call with a lot of
/// headroom; the exact value is not load-bearing.
const CTRL_BUF_BYTES: usize = 80000;

/// The NIC needs a moment of quiet after RSS and steering changes before the
/// bind is reliable.
const SETTLE_AFTER_STEERING: Duration = Duration::from_secs(1);

const PAGE_SHIFT: u32 = 12;

#[derive(Debug, Default)]
pub struct ServeStats {
    pub total_received: usize,
    pub page_aligned_frags: u64,
    pub non_page_aligned_frags: u64,
    pub linear_frags: u64,
    pub validation_errors: usize,
}

/// Tracks whether each fragment starts where its predecessor ended.
/// Diagnostic only.
#[derive(Debug, Default)]
struct FragAccounting {
    endptr: Option<u64>,
    page_aligned: u64,
    non_page_aligned: u64,
}

impl FragAccounting {
    fn record(&mut self, frag_offset: u64, frag_size: u32) {
        match self.endptr {
            None => {}
            Some(end) if end == frag_offset => self.page_aligned += 1,
            Some(_) => self.non_page_aligned += 1,
        }
        self.endptr = Some(frag_offset + u64::from(frag_size));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frag {
    Devmem {
        dmabuf_id: u32,
        offset: u64,
        size: u32,
        token: u32,
    },
    Linear {
        size: u32,
    },
}

/// Walks the control-message sequence of one receive and extracts the devmem
/// descriptors. Non-devmem cmsgs are skipped.
fn collect_frags(msg: &libc::msghdr, out: &mut Vec<Frag>) {
    unsafe {
        let mut cm = libc::CMSG_FIRSTHDR(msg);
        while !cm.is_null() {
            let level = (*cm).cmsg_level;
            let ctype = (*cm).cmsg_type;
            if level == libc::SOL_SOCKET
                && (ctype == SCM_DEVMEM_DMABUF || ctype == SCM_DEVMEM_LINEAR)
            {
                let cmsg = (libc::CMSG_DATA(cm) as *const DmabufCmsg).read_unaligned();
                if ctype == SCM_DEVMEM_LINEAR {
                    out.push(Frag::Linear {
                        size: cmsg.frag_size,
                    });
                } else {
                    out.push(Frag::Devmem {
                        dmabuf_id: cmsg.dmabuf_id,
                        offset: cmsg.frag_offset,
                        size: cmsg.frag_size,
                        token: cmsg.frag_token,
                    });
                }
            } else {
                debug!("skipping non-devmem cmsg level={level} type={ctype}");
            }
            cm = libc::CMSG_NXTHDR(msg, cm);
        }
    }
}

fn recv_devmem(
    fd: RawFd,
    iobuf: &mut [u8],
    ctrl: &mut [u8],
    frags: &mut Vec<Frag>,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: iobuf.as_mut_ptr() as *mut libc::c_void,
        iov_len: iobuf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = ctrl.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = ctrl.len();

    let ret = unsafe { libc::recvmsg(fd, &mut msg, MSG_SOCK_DEVMEM) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    frags.clear();
    collect_frags(&msg, frags);
    Ok(ret as usize)
}

/// Hands one fragment token back to the kernel so the pages can be recycled.
fn release_token(fd: &OwnedFd, token: u32) -> Result<()> {
    let tok = DmabufToken {
        token_start: token,
        token_count: 1,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            SO_DEVMEM_DONTNEED,
            &tok as *const _ as *const libc::c_void,
            mem::size_of::<DmabufToken>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Runs the listener role to completion: one accepted connection, received
/// until the peer closes.
pub fn serve<N, P>(
    cfg: &Config,
    nic: &N,
    provider: &P,
    mem: &P::Buffer,
) -> Result<ServeStats>
where
    N: NicControl,
    P: DmabufProvider,
{
    let server_ip = cfg
        .server
        .ok_or_else(|| Error::Config("listener requires a bind address".into()))?;

    nic.reset_flow_steering(&cfg.ifname);
    nic.set_header_split(cfg.ifindex, true)?;
    nic.configure_rss(&cfg.ifname, cfg.queues.start)?;
    nic.install_flow_rule(
        &cfg.ifname,
        &FlowSpec {
            server: server_ip,
            client: cfg.client,
            port: cfg.port,
            queue: cfg.queues.start,
        },
    )?;
    thread::sleep(SETTLE_AFTER_STEERING);

    let queues: Vec<QueueId> = cfg.queues.indices().map(QueueId::rx).collect();
    let binding = nic.bind_rx(cfg.ifindex, mem.dmabuf_fd(), &queues)?;
    info!("got dmabuf id={}", binding.dmabuf_id());

    let mut staging = provider.allocate(mem.len())?;

    let listener = sock::stream_socket()?;
    sock::enable_reuseaddr(&listener)?;
    let server_sin = sock::sockaddr_in6(server_ip, cfg.port);
    sock::bind(&listener, &server_sin)?;
    sock::listen(&listener, 1)?;
    info!(
        "waiting for connection on {}",
        sock::to_socket_addr(&server_sin)
    );
    let (client, peer) = sock::accept(&listener)?;
    info!("got connection from {}", sock::to_socket_addr(&peer));

    let mut validator = cfg.validation.map(Validator::new);
    let mut stats = ServeStats::default();
    let mut acct = FragAccounting::default();
    let mut iobuf = vec![0u8; IO_BUF_BYTES];
    let mut ctrl = vec![0u8; CTRL_BUF_BYTES];
    let mut frags = Vec::new();
    let mut scratch = Vec::new();
    let mut staging_off = 0usize;

    loop {
        let n = match recv_devmem(client.as_raw_fd(), &mut iobuf, &mut ctrl, &mut frags) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                warn!("recvmsg failed: {e}");
                continue;
            }
            Ok(0) => {
                info!("client exited");
                break;
            }
            Ok(n) => n,
        };
        debug!("recvmsg ret={n}");

        if frags.is_empty() {
            return Err(Error::FlowSteering(
                "received a message with no devmem fragments".into(),
            ));
        }

        for frag in &frags {
            match *frag {
                Frag::Linear { size } => {
                    // The kernel fell back to a host copy for this span
                    // (headers, or a small trailer).
                    stats.linear_frags += 1;
                    debug!("linear fragment, frag_size={size}");
                }
                Frag::Devmem {
                    dmabuf_id,
                    offset,
                    size,
                    token,
                } => {
                    if dmabuf_id != binding.dmabuf_id() {
                        return Err(Error::FlowSteering(format!(
                            "fragment for dmabuf id {dmabuf_id}, bound id is {}",
                            binding.dmabuf_id()
                        )));
                    }
                    acct.record(offset, size);

                    if staging_off + size as usize > staging.len() {
                        staging_off = 0;
                    }
                    staging.copy_from(staging_off, mem, offset as usize, size as usize)?;
                    release_token(&client, token)?;

                    if let Some(v) = validator.as_mut() {
                        scratch.resize(size as usize, 0);
                        staging.read_to_host(staging_off, &mut scratch)?;
                        v.check(&scratch, stats.total_received as u64)?;
                    }

                    staging_off += size as usize;
                    stats.total_received += size as usize;
                    debug!(
                        "received frag_page={} in_page_offset={} frag_offset={} frag_size={} token={} total_received={} dmabuf_id={}",
                        offset >> PAGE_SHIFT,
                        offset as usize % page_size(),
                        offset,
                        size,
                        token,
                        stats.total_received,
                        dmabuf_id
                    );
                }
            }
        }
    }

    stats.page_aligned_frags = acct.page_aligned;
    stats.non_page_aligned_frags = acct.non_page_aligned;
    if let Some(v) = &validator {
        stats.validation_errors = v.errors();
    }
    info!(
        "rx ok: total_received={} page_aligned_frags={} non_page_aligned_frags={} linear_frags={}",
        stats.total_received, stats.page_aligned_frags, stats.non_page_aligned_frags,
        stats.linear_frags
    );

    // Dropping the handle closes its netlink session; the kernel unbinds the
    // queues with it.
    drop(binding);
    Ok(stats)
}
