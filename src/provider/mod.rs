//! Device-memory buffer provisioning and export.
//!
//! The rest of the crate treats the buffer as an abstract capability: a
//! contiguous region behind a dma-buf file descriptor, with synchronous
//! copies in and out. Any backend that can export a dma-buf plugs in; the
//! default is the udmabuf driver, which turns an ordinary memfd into one.

use std::os::fd::RawFd;

use crate::errors::{Error, Result};

pub mod udmabuf;

pub use udmabuf::UdmabufProvider;

/// A contiguous device-resident region exported as a dma-buf.
///
/// Created once at startup, never resized; the fd refers to the same backing
/// store for the process lifetime.
pub trait DeviceBuffer {
    fn dmabuf_fd(&self) -> RawFd;

    /// Byte offset of the region within the exported object.
    fn offset(&self) -> usize;

    fn len(&self) -> usize;

    /// Host-to-device copy. Synchronous: on return the bytes are visible to
    /// the NIC.
    fn write_from_host(&mut self, dst_off: usize, src: &[u8]) -> Result<()>;

    /// Device-to-host copy, for validation readback.
    fn read_to_host(&self, src_off: usize, dst: &mut [u8]) -> Result<()>;

    /// Device-to-device copy between two buffers from the same provider.
    fn copy_from(&mut self, dst_off: usize, src: &Self, src_off: usize, len: usize) -> Result<()>;
}

pub trait DmabufProvider {
    type Buffer: DeviceBuffer;

    /// Allocates `size_bytes` of device memory and exports it as a dma-buf.
    /// `size_bytes` must be a positive multiple of the page size.
    fn allocate(&self, size_bytes: usize) -> Result<Self::Buffer>;
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub(crate) fn check_allocation_size(size_bytes: usize) -> Result<()> {
    if size_bytes == 0 || size_bytes % page_size() != 0 {
        return Err(Error::Config(format!(
            "buffer size {size_bytes} is not a positive multiple of the page size"
        )));
    }
    Ok(())
}

pub(crate) fn check_range(buf_len: usize, off: usize, len: usize) -> Result<()> {
    match off.checked_add(len) {
        Some(end) if end <= buf_len => Ok(()),
        _ => Err(Error::Config(format!(
            "copy of {len} bytes at offset {off} exceeds buffer of {buf_len}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    /// Host-memory stand-in used by unit tests; the fake NIC never looks at
    /// the fd.
    pub(crate) struct MockProvider;

    pub(crate) struct MockBuffer {
        bytes: Vec<u8>,
    }

    impl DmabufProvider for MockProvider {
        type Buffer = MockBuffer;

        fn allocate(&self, size_bytes: usize) -> Result<MockBuffer> {
            check_allocation_size(size_bytes)?;
            Ok(MockBuffer {
                bytes: vec![0; size_bytes],
            })
        }
    }

    impl MockBuffer {
        pub(crate) fn bytes(&self) -> &[u8] {
            &self.bytes
        }

        pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
            &mut self.bytes
        }
    }

    impl DeviceBuffer for MockBuffer {
        fn dmabuf_fd(&self) -> RawFd {
            -1
        }

        fn offset(&self) -> usize {
            0
        }

        fn len(&self) -> usize {
            self.bytes.len()
        }

        fn write_from_host(&mut self, dst_off: usize, src: &[u8]) -> Result<()> {
            check_range(self.bytes.len(), dst_off, src.len())?;
            self.bytes[dst_off..dst_off + src.len()].copy_from_slice(src);
            Ok(())
        }

        fn read_to_host(&self, src_off: usize, dst: &mut [u8]) -> Result<()> {
            check_range(self.bytes.len(), src_off, dst.len())?;
            dst.copy_from_slice(&self.bytes[src_off..src_off + dst.len()]);
            Ok(())
        }

        fn copy_from(
            &mut self,
            dst_off: usize,
            src: &Self,
            src_off: usize,
            len: usize,
        ) -> Result<()> {
            check_range(self.bytes.len(), dst_off, len)?;
            check_range(src.bytes.len(), src_off, len)?;
            self.bytes[dst_off..dst_off + len].copy_from_slice(&src.bytes[src_off..src_off + len]);
            Ok(())
        }
    }
}
