//! Thin wrappers over the raw stream-socket syscalls the engines drive.
//!
//! Everything speaks AF_INET6; IPv4 addresses travel in v4-mapped form so a
//! single socket family serves both.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub fn resultify(ret: libc::c_int) -> io::Result<libc::c_int> {
    match ret >= 0 {
        true => Ok(ret),
        false => Err(io::Error::last_os_error()),
    }
}

pub fn stream_socket() -> io::Result<OwnedFd> {
    let fd = resultify(unsafe {
        libc::socket(libc::AF_INET6, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn enable_reuseaddr(fd: &OwnedFd) -> io::Result<()> {
    let opt: libc::c_int = 1;
    for name in [libc::SO_REUSEPORT, libc::SO_REUSEADDR] {
        resultify(unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                name,
                &opt as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
    }
    Ok(())
}

/// Pin egress to the named interface.
pub fn bind_to_device(fd: &OwnedFd, ifname: &str) -> io::Result<()> {
    let name = CString::new(ifname)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name with NUL"))?;
    resultify(unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr() as *const libc::c_void,
            (name.as_bytes().len() + 1) as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn set_zerocopy(fd: &OwnedFd) -> io::Result<()> {
    let opt: libc::c_int = 1;
    resultify(unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ZEROCOPY,
            &opt as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// Builds a sockaddr_in6, mapping IPv4 addresses into ::ffff: form.
pub fn sockaddr_in6(addr: IpAddr, port: u16) -> libc::sockaddr_in6 {
    let v6 = match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sin6.sin6_port = port.to_be();
    sin6.sin6_addr.s6_addr = v6.octets();
    sin6
}

/// The std-typed view of a sockaddr_in6, for logging.
pub fn to_socket_addr(sin6: &libc::sockaddr_in6) -> SocketAddr {
    let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
    SocketAddr::V6(SocketAddrV6::new(ip, u16::from_be(sin6.sin6_port), 0, 0))
}

pub fn bind(fd: &OwnedFd, sin6: &libc::sockaddr_in6) -> io::Result<()> {
    resultify(unsafe {
        libc::bind(
            fd.as_raw_fd(),
            sin6 as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn listen(fd: &OwnedFd, backlog: i32) -> io::Result<()> {
    resultify(unsafe { libc::listen(fd.as_raw_fd(), backlog) })?;
    Ok(())
}

pub fn accept(fd: &OwnedFd) -> io::Result<(OwnedFd, libc::sockaddr_in6)> {
    let mut peer: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    let client = resultify(unsafe {
        libc::accept(
            fd.as_raw_fd(),
            &mut peer as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    })?;
    Ok((unsafe { OwnedFd::from_raw_fd(client) }, peer))
}

pub fn connect(fd: &OwnedFd, sin6: &libc::sockaddr_in6) -> io::Result<()> {
    resultify(unsafe {
        libc::connect(
            fd.as_raw_fd(),
            sin6 as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// Waits up to `timeout_ms` for the socket's error queue to become readable.
pub fn poll_err(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: 0,
        revents: 0,
    };
    let ret = resultify(unsafe { libc::poll(&mut pfd, 1, timeout_ms) })?;
    Ok(ret > 0 && pfd.revents & libc::POLLERR != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_addresses_are_mapped() {
        let sin6 = sockaddr_in6("192.0.2.7".parse().unwrap(), 5201);
        let addr = to_socket_addr(&sin6);
        assert_eq!(addr.port(), 5201);
        match addr.ip() {
            IpAddr::V6(v6) => {
                assert_eq!(v6.to_ipv4_mapped(), Some("192.0.2.7".parse().unwrap()))
            }
            IpAddr::V4(_) => unreachable!(),
        }
    }

    #[test]
    fn v6_addresses_pass_through() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let sin6 = sockaddr_in6(ip, 80);
        assert_eq!(to_socket_addr(&sin6).ip(), ip);
    }

    #[test]
    fn port_is_network_order() {
        let sin6 = sockaddr_in6("::1".parse().unwrap(), 0x1234);
        assert_eq!(sin6.sin6_port, 0x1234u16.to_be());
    }
}
