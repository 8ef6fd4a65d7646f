//! dmTCP transmit engine.
//!
//! The payload lives in the dma-buf; the iovec passed to sendmsg names
//! offsets within it, not addresses. Internally segments stay `(offset,
//! length)` pairs and only become pointer-typed fields at the syscall
//! boundary. One send is outstanding at a time: every sendmsg is followed by
//! a completion drain, so the buffer can be reused without an occupancy map.

use std::io::{self, BufRead};
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::nic::{BindingHandle, NicControl};
use crate::provider::DeviceBuffer;
use crate::sock;
use crate::uapi::{SockExtendedErr, IPV6_RECVERR, IP_RECVERR, SCM_DEVMEM_DMABUF, SO_EE_ORIGIN_ZEROCOPY};
use crate::validate;

/// Hard cap on segments per send; the kernel limits the iovec anyway.
pub const MAX_IOV: usize = 1024;

#[derive(Debug, Default)]
pub struct SendStats {
    pub total_sent: usize,
    pub completions: u64,
}

/// An inclusive range of send-sequence numbers whose pages are reusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCompletion {
    pub lo: u32,
    pub hi: u32,
}

/// Where outgoing payloads come from: a generated validation pattern, or
/// lines read from standard input.
pub enum LineSource {
    Pattern {
        modulus: u64,
        line_size: usize,
        produced: usize,
    },
    Stdin(io::BufReader<io::Stdin>),
}

impl LineSource {
    pub fn pattern(modulus: u64, line_size: usize) -> Self {
        Self::Pattern {
            modulus,
            line_size,
            produced: 0,
        }
    }

    pub fn stdin() -> Self {
        Self::Stdin(io::BufReader::new(io::stdin()))
    }

    /// Fills `buf` with the next payload. `None` means the source is
    /// exhausted; the pattern source never is.
    fn next_line(&mut self, buf: &mut Vec<u8>) -> Result<Option<usize>> {
        match self {
            Self::Pattern {
                modulus,
                line_size,
                produced,
            } => {
                buf.resize(*line_size, 0);
                validate::fill_pattern(buf, *modulus, *produced as u64);
                *produced += *line_size;
                Ok(Some(*line_size))
            }
            Self::Stdin(reader) => {
                buf.clear();
                // getline semantics: the newline stays in the payload.
                let n = reader.read_until(b'\n', buf)?;
                if n == 0 {
                    return Ok(None);
                }
                Ok(Some(n))
            }
        }
    }
}

/// Splits `line_size` bytes at dma-buf offset 0 into send segments of at
/// most `max_chunk` bytes (0 means one segment).
fn segments(line_size: usize, max_chunk: usize) -> Result<Vec<(u64, usize)>> {
    if max_chunk == 0 || line_size == 0 {
        return Ok(vec![(0, line_size)]);
    }
    let count = line_size.div_ceil(max_chunk);
    if count > MAX_IOV {
        return Err(Error::Config(format!(
            "can't partition {line_size} bytes into a maximum of {MAX_IOV} chunks of {max_chunk}"
        )));
    }
    let mut segs = Vec::with_capacity(count);
    for i in 0..count {
        segs.push(((i * max_chunk) as u64, max_chunk));
    }
    segs[count - 1].1 = line_size - (count - 1) * max_chunk;
    Ok(segs)
}

/// Issues one zero-copy send of dma-buf segments. Offsets become the
/// pointer-typed iovec field only here.
fn send_zerocopy(fd: &OwnedFd, tx_dmabuf_id: u32, segs: &[(u64, usize)]) -> Result<usize> {
    let mut iov: Vec<libc::iovec> = segs
        .iter()
        .map(|&(off, len)| libc::iovec {
            iov_base: off as *mut libc::c_void,
            iov_len: len,
        })
        .collect();

    // CMSG_SPACE(sizeof(u32))
    let mut ctrl = [0u8; 24];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len();
    msg.msg_control = ctrl.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = ctrl.len();

    unsafe {
        let cm = libc::CMSG_FIRSTHDR(&msg);
        (*cm).cmsg_level = libc::SOL_SOCKET;
        (*cm).cmsg_type = SCM_DEVMEM_DMABUF;
        (*cm).cmsg_len = libc::CMSG_LEN(mem::size_of::<u32>() as u32) as usize;
        (libc::CMSG_DATA(cm) as *mut u32).write_unaligned(tx_dmabuf_id);
    }

    let ret = unsafe { libc::sendmsg(fd.as_raw_fd(), &msg, libc::MSG_ZEROCOPY) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(ret as usize)
}

/// Extracts a zero-copy completion from one error-queue message, if present.
fn completion_from_msg(msg: &libc::msghdr) -> Result<Option<TxCompletion>> {
    unsafe {
        let mut cm = libc::CMSG_FIRSTHDR(msg);
        while !cm.is_null() {
            let level = (*cm).cmsg_level;
            let ctype = (*cm).cmsg_type;
            let is_recverr = (level == libc::SOL_IP && ctype == IP_RECVERR)
                || (level == libc::SOL_IPV6 && ctype == IPV6_RECVERR);
            if is_recverr {
                let serr = (libc::CMSG_DATA(cm) as *const SockExtendedErr).read_unaligned();
                if serr.ee_origin != SO_EE_ORIGIN_ZEROCOPY {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("wrong error-queue origin {}", serr.ee_origin),
                    )));
                }
                if serr.ee_errno != 0 {
                    return Err(Error::Io(io::Error::from_raw_os_error(
                        serr.ee_errno as i32,
                    )));
                }
                return Ok(Some(TxCompletion {
                    lo: serr.ee_info,
                    hi: serr.ee_data,
                }));
            }
            cm = libc::CMSG_NXTHDR(msg, cm);
        }
    }
    Ok(None)
}

/// Drains the socket error queue until a zero-copy completion arrives.
/// Deadline expiry is fatal: without the completion the pages cannot be
/// reused.
pub(crate) fn wait_completion(fd: RawFd, waittime_ms: u64) -> Result<TxCompletion> {
    let deadline = Instant::now() + Duration::from_millis(waittime_ms);
    let mut ctrl = [0u8; 128];

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::CompletionTimeout(waittime_ms));
        }
        let remaining = (deadline - now).as_millis() as i32;
        if !sock::poll_err(fd, remaining.max(1))? {
            continue;
        }

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_control = ctrl.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = ctrl.len();
        let ret = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                continue;
            }
            return Err(Error::Io(err));
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            // A truncated control buffer could silently drop a completion.
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "tx completion control data truncated",
            )));
        }
        if let Some(completion) = completion_from_msg(&msg)? {
            return Ok(completion);
        }
    }
}

/// Runs the sender role: streams the source through the dma-buf until the
/// buffer size has been sent or the source runs dry.
pub fn send<N, B>(cfg: &Config, nic: &N, mem: &mut B, source: &mut LineSource) -> Result<SendStats>
where
    N: NicControl,
    B: DeviceBuffer,
{
    let peer_ip = cfg
        .server
        .ok_or_else(|| Error::Config("sender requires a peer address".into()))?;

    let fd = sock::stream_socket()?;
    sock::enable_reuseaddr(&fd)?;
    sock::bind_to_device(&fd, &cfg.ifname)?;

    let binding = nic.bind_tx(cfg.ifindex, mem.dmabuf_fd())?;
    info!("got tx dmabuf id={}", binding.dmabuf_id());

    if let Some(client_ip) = cfg.client {
        sock::bind(&fd, &sock::sockaddr_in6(client_ip, cfg.port))?;
    }
    sock::set_zerocopy(&fd)?;

    let peer_sin = sock::sockaddr_in6(peer_ip, cfg.port);
    info!(
        "connecting to {} (via {})",
        sock::to_socket_addr(&peer_sin),
        cfg.ifname
    );
    sock::connect(&fd, &peer_sin)?;

    let mut stats = SendStats::default();
    let mut line = Vec::new();

    while stats.total_sent < mem.len() {
        let Some(mut line_size) = source.next_line(&mut line)? else {
            break;
        };
        if stats.total_sent + line_size >= mem.len() {
            line_size = mem.len() - stats.total_sent;
        }

        let segs = segments(line_size, cfg.max_chunk)?;
        mem.write_from_host(0, &line[..line_size])?;

        let sent = send_zerocopy(&fd, binding.dmabuf_id(), &segs)?;
        debug!("sendmsg ret={sent}");
        if sent > 0 {
            let completion = wait_completion(fd.as_raw_fd(), cfg.waittime_ms)?;
            debug!("tx complete [{},{}]", completion.lo, completion.hi);
            stats.completions += 1;
        }
        stats.total_sent += sent;
    }

    info!("tx ok: total_sent={}", stats.total_sent);
    Ok(stats)
}
