//! Netdev generic netlink family: dma-buf queue bindings.
//!
//! A binding is scoped to the netlink session that created it. The handles
//! returned here own that session; dropping one closes it, and the kernel
//! releases the binding with it. There is no explicit unbind operation.

use std::os::fd::RawFd;

use tracing::debug;

use crate::errors::{Error, Result};

use super::genl::{Attrs, GenlSocket};
use super::QueueId;

const FAMILY: &str = "netdev";
const VERSION: u8 = 1;

const CMD_BIND_RX: u8 = 13;
const CMD_BIND_TX: u8 = 15;

const A_DMABUF_IFINDEX: u16 = 1;
const A_DMABUF_QUEUES: u16 = 2;
const A_DMABUF_FD: u16 = 3;
const A_DMABUF_ID: u16 = 4;

const A_QUEUE_ID: u16 = 1;
const A_QUEUE_TYPE: u16 = 3;

const QUEUE_TYPE_RX: u32 = 0;

/// Live RX binding of a dma-buf to a set of queues.
pub struct RxBinding {
    id: u32,
    _session: GenlSocket,
}

impl RxBinding {
    pub fn dmabuf_id(&self) -> u32 {
        self.id
    }
}

/// Live TX binding of a dma-buf to an interface.
pub struct TxBinding {
    id: u32,
    _session: GenlSocket,
}

impl TxBinding {
    pub fn dmabuf_id(&self) -> u32 {
        self.id
    }
}

pub fn bind_rx(ifindex: u32, dmabuf_fd: RawFd, queues: &[QueueId]) -> Result<RxBinding> {
    let mut ys = GenlSocket::connect(FAMILY)?;
    let msgs = ys.request(CMD_BIND_RX, VERSION, |b| {
        b.put_u32(A_DMABUF_IFINDEX, ifindex);
        b.put_u32(A_DMABUF_FD, dmabuf_fd as u32);
        for queue in queues {
            let nest = b.nest_start(A_DMABUF_QUEUES);
            b.put_u32(A_QUEUE_TYPE, QUEUE_TYPE_RX);
            b.put_u32(A_QUEUE_ID, queue.index);
            b.nest_end(nest);
        }
    })?;
    let id = binding_id(&msgs)?;
    debug!(id, "bind-rx acknowledged");
    Ok(RxBinding { id, _session: ys })
}

pub fn bind_tx(ifindex: u32, dmabuf_fd: RawFd) -> Result<TxBinding> {
    let mut ys = GenlSocket::connect(FAMILY)?;
    let msgs = ys.request(CMD_BIND_TX, VERSION, |b| {
        b.put_u32(A_DMABUF_IFINDEX, ifindex);
        b.put_u32(A_DMABUF_FD, dmabuf_fd as u32);
    })?;
    let id = binding_id(&msgs)?;
    debug!(id, "bind-tx acknowledged");
    Ok(TxBinding { id, _session: ys })
}

/// A bind response without an id means the NIC does not speak devmem TCP.
fn binding_id(msgs: &[Vec<u8>]) -> Result<u32> {
    for msg in msgs {
        for attr in Attrs::new(msg) {
            if attr.atype() == A_DMABUF_ID {
                return attr.u32();
            }
        }
    }
    Err(Error::KernelUnsupported(
        "bind response carried no dmabuf id".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_id_is_unsupported() {
        let err = binding_id(&[vec![]]).unwrap_err();
        assert!(matches!(err, Error::KernelUnsupported(_)));
    }

    #[test]
    fn id_attribute_is_extracted() {
        // nlattr: len=8, type=A_DMABUF_ID, payload=u32.
        let mut msg = Vec::new();
        msg.extend_from_slice(&8u16.to_ne_bytes());
        msg.extend_from_slice(&A_DMABUF_ID.to_ne_bytes());
        msg.extend_from_slice(&42u32.to_ne_bytes());
        assert_eq!(binding_id(&[msg]).unwrap(), 42);
    }
}
