//! Ethtool generic netlink family: channel counts and ring parameters.

use crate::errors::{Error, Result};

use super::genl::{Attrs, GenlSocket, MsgBuilder};

const FAMILY: &str = "ethtool";
const VERSION: u8 = 1;

const MSG_RINGS_GET: u8 = 15;
const MSG_RINGS_SET: u8 = 16;
const MSG_CHANNELS_GET: u8 = 17;

// Both the channels and rings request carry the same header nest at type 1.
const A_HEADER: u16 = 1;
const A_HEADER_DEV_INDEX: u16 = 1;

const A_CHANNELS_RX_COUNT: u16 = 6;
const A_CHANNELS_COMBINED_COUNT: u16 = 9;

const A_RINGS_TCP_DATA_SPLIT: u16 = 11;

pub const TCP_DATA_SPLIT_OFF: u8 = 0;
pub const TCP_DATA_SPLIT_AUTO: u8 = 1;
pub const TCP_DATA_SPLIT_ON: u8 = 2;

pub fn tcp_data_split_str(val: u8) -> &'static str {
    match val {
        TCP_DATA_SPLIT_OFF => "off",
        TCP_DATA_SPLIT_AUTO => "auto",
        TCP_DATA_SPLIT_ON => "on",
        _ => "?",
    }
}

fn dev_header(b: &mut MsgBuilder, ifindex: u32) {
    let nest = b.nest_start(A_HEADER);
    b.put_u32(A_HEADER_DEV_INDEX, ifindex);
    b.nest_end(nest);
}

/// Dedicated-RX plus combined channel count.
pub fn rx_queue_count(ifindex: u32) -> Result<u32> {
    let mut ys = GenlSocket::connect(FAMILY)?;
    let msgs = ys.request(MSG_CHANNELS_GET, VERSION, |b| dev_header(b, ifindex))?;

    let mut rx = 0;
    let mut combined = 0;
    for msg in &msgs {
        for attr in Attrs::new(msg) {
            match attr.atype() {
                A_CHANNELS_RX_COUNT => rx = attr.u32()?,
                A_CHANNELS_COMBINED_COUNT => combined = attr.u32()?,
                _ => {}
            }
        }
    }
    Ok(rx + combined)
}

pub fn set_tcp_data_split(ifindex: u32, val: u8) -> Result<()> {
    let mut ys = GenlSocket::connect(FAMILY)?;
    ys.request(MSG_RINGS_SET, VERSION, |b| {
        dev_header(b, ifindex);
        b.put_u8(A_RINGS_TCP_DATA_SPLIT, val);
    })?;
    Ok(())
}

/// Reads the current TCP data split setting back from the rings response.
pub fn get_tcp_data_split(ifindex: u32) -> Result<u8> {
    let mut ys = GenlSocket::connect(FAMILY)?;
    let msgs = ys.request(MSG_RINGS_GET, VERSION, |b| dev_header(b, ifindex))?;
    for msg in &msgs {
        for attr in Attrs::new(msg) {
            if attr.atype() == A_RINGS_TCP_DATA_SPLIT {
                return attr.u8();
            }
        }
    }
    Err(Error::KernelUnsupported(
        "NIC does not report a tcp-data-split setting".into(),
    ))
}
