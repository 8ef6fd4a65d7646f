//! Minimal generic netlink transport.
//!
//! Just enough of the protocol for the ethtool and netdev families: family
//! resolution through nlctrl, flat and nested attributes, and a synchronous
//! request/ack round trip. Sessions are cheap; every operation opens its own,
//! and bindings stay alive exactly as long as the session that created them.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::errors::{Error, Result};

pub(crate) const NLMSG_HDRLEN: usize = 16;
pub(crate) const GENL_HDRLEN: usize = 4;
const NLA_HDRLEN: usize = 4;
const NLA_F_NESTED: u16 = 1 << 15;
const NLA_TYPE_MASK: u16 = !(3 << 14);

const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;

const RECV_BUF_BYTES: usize = 32768;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn proto_err(what: &str) -> Error {
    Error::Netlink(io::Error::new(io::ErrorKind::InvalidData, what.to_string()))
}

/// One open generic-netlink session, resolved to a single family.
pub(crate) struct GenlSocket {
    fd: OwnedFd,
    family: u16,
    seq: u32,
}

impl GenlSocket {
    pub(crate) fn connect(family_name: &str) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if fd < 0 {
            return Err(Error::Netlink(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut sa: libc::sockaddr_nl = unsafe { mem::zeroed() };
        sa.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sa as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::Netlink(io::Error::last_os_error()));
        }

        let mut sock = Self {
            fd,
            family: GENL_ID_CTRL,
            seq: 0,
        };
        let msgs = sock.request(CTRL_CMD_GETFAMILY, 1, |b| {
            b.put_str(CTRL_ATTR_FAMILY_NAME, family_name);
        })?;
        for msg in &msgs {
            for attr in Attrs::new(msg) {
                if attr.atype() == CTRL_ATTR_FAMILY_ID {
                    sock.family = attr.u16()?;
                    return Ok(sock);
                }
            }
        }
        Err(Error::KernelUnsupported(format!(
            "generic netlink family {family_name:?} not found"
        )))
    }

    /// Sends one command and collects the response payloads (the bytes after
    /// each genl header) until the kernel acks or errors the request.
    pub(crate) fn request(
        &mut self,
        cmd: u8,
        version: u8,
        build: impl FnOnce(&mut MsgBuilder),
    ) -> Result<Vec<Vec<u8>>> {
        self.seq = self.seq.wrapping_add(1);
        let mut builder = MsgBuilder::new(self.family, cmd, version, self.seq);
        build(&mut builder);
        let msg = builder.finish();

        let sent = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if sent < 0 {
            return Err(Error::Netlink(io::Error::last_os_error()));
        }

        let mut out = Vec::new();
        let mut rx = vec![0u8; RECV_BUF_BYTES];
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    rx.as_mut_ptr() as *mut libc::c_void,
                    rx.len(),
                    0,
                )
            };
            if n < 0 {
                return Err(Error::Netlink(io::Error::last_os_error()));
            }
            let mut buf = &rx[..n as usize];
            while buf.len() >= NLMSG_HDRLEN {
                let msg_len = read_u32(buf, 0)? as usize;
                let msg_type = read_u16(buf, 4)?;
                if msg_len < NLMSG_HDRLEN || msg_len > buf.len() {
                    return Err(proto_err("truncated netlink message"));
                }
                match msg_type as libc::c_int {
                    libc::NLMSG_ERROR => {
                        let errno = read_u32(buf, NLMSG_HDRLEN)? as i32;
                        if errno == 0 {
                            return Ok(out);
                        }
                        return Err(Error::Netlink(io::Error::from_raw_os_error(-errno)));
                    }
                    libc::NLMSG_DONE => return Ok(out),
                    libc::NLMSG_NOOP => {}
                    _ => {
                        if msg_len < NLMSG_HDRLEN + GENL_HDRLEN {
                            return Err(proto_err("short generic netlink message"));
                        }
                        out.push(buf[NLMSG_HDRLEN + GENL_HDRLEN..msg_len].to_vec());
                    }
                }
                buf = &buf[align4(msg_len).min(buf.len())..];
            }
        }
    }
}

/// Serializes one request: netlink header, genl header, attributes.
pub(crate) struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    fn new(family: u16, cmd: u8, version: u8, seq: u32) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_len, patched in finish()
        buf.extend_from_slice(&family.to_ne_bytes());
        buf.extend_from_slice(&((libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16).to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid
        buf.push(cmd);
        buf.push(version);
        buf.extend_from_slice(&0u16.to_ne_bytes()); // reserved
        Self { buf }
    }

    pub(crate) fn put(&mut self, atype: u16, payload: &[u8]) {
        let len = NLA_HDRLEN + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&atype.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align4(self.buf.len()), 0);
    }

    pub(crate) fn put_u8(&mut self, atype: u16, val: u8) {
        self.put(atype, &[val]);
    }

    pub(crate) fn put_u32(&mut self, atype: u16, val: u32) {
        self.put(atype, &val.to_ne_bytes());
    }

    /// NUL-terminated string attribute.
    pub(crate) fn put_str(&mut self, atype: u16, val: &str) {
        let mut bytes = val.as_bytes().to_vec();
        bytes.push(0);
        self.put(atype, &bytes);
    }

    /// Opens a nested attribute; close it with [`Self::nest_end`].
    pub(crate) fn nest_start(&mut self, atype: u16) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes()); // patched in nest_end
        self.buf.extend_from_slice(&(atype | NLA_F_NESTED).to_ne_bytes());
        start
    }

    pub(crate) fn nest_end(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

fn read_u16(buf: &[u8], off: usize) -> Result<u16> {
    let bytes = buf
        .get(off..off + 2)
        .ok_or_else(|| proto_err("short read in netlink buffer"))?;
    Ok(u16::from_ne_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], off: usize) -> Result<u32> {
    let bytes = buf
        .get(off..off + 4)
        .ok_or_else(|| proto_err("short read in netlink buffer"))?;
    Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// One parsed attribute.
pub(crate) struct Attr<'a> {
    atype: u16,
    payload: &'a [u8],
}

impl<'a> Attr<'a> {
    pub(crate) fn atype(&self) -> u16 {
        self.atype
    }

    pub(crate) fn u8(&self) -> Result<u8> {
        self.payload
            .first()
            .copied()
            .ok_or_else(|| proto_err("empty u8 attribute"))
    }

    pub(crate) fn u16(&self) -> Result<u16> {
        read_u16(self.payload, 0)
    }

    pub(crate) fn u32(&self) -> Result<u32> {
        read_u32(self.payload, 0)
    }

    pub(crate) fn nested(&self) -> Attrs<'a> {
        Attrs::new(self.payload)
    }
}

/// Iterator over a flat attribute stream.
pub(crate) struct Attrs<'a> {
    buf: &'a [u8],
}

impl<'a> Attrs<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Attrs<'a> {
    type Item = Attr<'a>;

    fn next(&mut self) -> Option<Attr<'a>> {
        if self.buf.len() < NLA_HDRLEN {
            return None;
        }
        let len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
        let atype = u16::from_ne_bytes([self.buf[2], self.buf[3]]);
        if len < NLA_HDRLEN || len > self.buf.len() {
            return None;
        }
        let attr = Attr {
            atype: atype & NLA_TYPE_MASK,
            payload: &self.buf[NLA_HDRLEN..len],
        };
        self.buf = &self.buf[align4(len).min(self.buf.len())..];
        Some(attr)
    }
}
