//! dma-buf provider backed by the udmabuf driver.
//!
//! A sealed memfd is handed to /dev/udmabuf, which wraps its pages in a
//! dma-buf the NIC can target. The memfd mapping stays writable from the
//! host, so copies in either direction are plain memcpy.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::errors::{Error, Result};
use crate::uapi::{UdmabufCreate, UDMABUF_FLAGS_CLOEXEC};

use super::{check_allocation_size, check_range, DeviceBuffer, DmabufProvider};

const UDMABUF_DEV: &str = "/dev/udmabuf";

nix::ioctl_write_ptr!(udmabuf_create, 'u', 0x42, UdmabufCreate);

pub struct UdmabufProvider {
    dev: File,
}

impl UdmabufProvider {
    pub fn open() -> Result<Self> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(UDMABUF_DEV)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    Error::KernelUnsupported(format!("{UDMABUF_DEV} is not available"))
                }
                _ => Error::Io(e),
            })?;
        Ok(Self { dev })
    }
}

pub struct Buffer {
    dmabuf: OwnedFd,
    _memfd: OwnedFd,
    map: *mut u8,
    size: usize,
}

// The mapping is owned by the buffer and never reallocated.
unsafe impl Send for Buffer {}

impl DmabufProvider for UdmabufProvider {
    type Buffer = Buffer;

    fn allocate(&self, size_bytes: usize) -> Result<Buffer> {
        check_allocation_size(size_bytes)?;

        let memfd = memfd_sealed(size_bytes)?;

        let req = UdmabufCreate {
            memfd: memfd.as_raw_fd() as u32,
            flags: UDMABUF_FLAGS_CLOEXEC,
            offset: 0,
            size: size_bytes as u64,
        };
        let dmabuf = unsafe { udmabuf_create(self.dev.as_raw_fd(), &req) }.map_err(|errno| {
            let err = io::Error::from(errno);
            match errno {
                nix::errno::Errno::ENOTTY | nix::errno::Errno::ENODEV => {
                    Error::KernelUnsupported(format!("udmabuf export failed: {err}"))
                }
                _ => Error::Io(err),
            }
        })?;
        let dmabuf = unsafe { OwnedFd::from_raw_fd(dmabuf) };

        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size_bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                memfd.as_raw_fd(),
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        Ok(Buffer {
            dmabuf,
            _memfd: memfd,
            map: map as *mut u8,
            size: size_bytes,
        })
    }
}

fn memfd_sealed(size: usize) -> Result<OwnedFd> {
    let fd = unsafe {
        libc::memfd_create(
            c"devmem-nc".as_ptr(),
            libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
        )
    };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    // udmabuf refuses memfds whose size can still change under it.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, libc::F_SEAL_SHRINK) } < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(fd)
}

impl DeviceBuffer for Buffer {
    fn dmabuf_fd(&self) -> RawFd {
        self.dmabuf.as_raw_fd()
    }

    fn offset(&self) -> usize {
        0
    }

    fn len(&self) -> usize {
        self.size
    }

    fn write_from_host(&mut self, dst_off: usize, src: &[u8]) -> Result<()> {
        check_range(self.size, dst_off, src.len())?;
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.map.add(dst_off), src.len());
        }
        Ok(())
    }

    fn read_to_host(&self, src_off: usize, dst: &mut [u8]) -> Result<()> {
        check_range(self.size, src_off, dst.len())?;
        unsafe {
            ptr::copy_nonoverlapping(self.map.add(src_off), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn copy_from(&mut self, dst_off: usize, src: &Self, src_off: usize, len: usize) -> Result<()> {
        check_range(self.size, dst_off, len)?;
        check_range(src.size, src_off, len)?;
        unsafe {
            ptr::copy_nonoverlapping(src.map.add(src_off), self.map.add(dst_off), len);
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, self.size);
        }
    }
}
