//! NIC control plane.
//!
//! A stateless façade over two generic netlink families (ethtool for
//! channels/rings, netdev for dma-buf bindings) plus the ethtool utility for
//! the RSS/ntuple/flow-rule knobs that have no stable netlink surface here.
//!
//! The dmTCP preconditions live in the callers: header split before bind,
//! bind before the first receive. This module only exposes the verbs.

use std::net::IpAddr;
use std::os::fd::RawFd;
use std::process::Command;

use tracing::{info, warn};

use crate::errors::{Error, Result};

pub(crate) mod genl;

pub mod ethtool;
pub mod netdev;

#[cfg(test)]
pub(crate) mod mock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Rx,
    Tx,
}

/// A NIC-local queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueId {
    pub kind: QueueKind,
    pub index: u32,
}

impl QueueId {
    pub fn rx(index: u32) -> Self {
        Self {
            kind: QueueKind::Rx,
            index,
        }
    }
}

/// The 5- or 3-tuple a flow rule steers to a queue.
#[derive(Clone, Debug)]
pub struct FlowSpec {
    pub server: IpAddr,
    pub client: Option<IpAddr>,
    pub port: u16,
    pub queue: u32,
}

impl FlowSpec {
    fn flow_type(&self) -> &'static str {
        match canonical(self.server) {
            IpAddr::V4(_) => "tcp4",
            IpAddr::V6(_) => "tcp6",
        }
    }
}

/// Collapses v4-mapped IPv6 addresses back to plain IPv4 for ethtool.
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// A live binding, however implemented.
pub trait BindingHandle {
    fn dmabuf_id(&self) -> u32;
}

impl BindingHandle for netdev::RxBinding {
    fn dmabuf_id(&self) -> u32 {
        self.dmabuf_id()
    }
}

impl BindingHandle for netdev::TxBinding {
    fn dmabuf_id(&self) -> u32 {
        self.dmabuf_id()
    }
}

/// The control-plane operations the engines and the self-test drive.
///
/// Binding handles are scoped resources: dropping one releases the kernel
/// binding on any exit path.
pub trait NicControl {
    type RxHandle: BindingHandle;
    type TxHandle: BindingHandle;

    fn rx_queue_count(&self, ifindex: u32) -> Result<u32>;

    /// Sets TCP header/data split and confirms the value by reading it back.
    fn set_header_split(&self, ifindex: u32, on: bool) -> Result<()>;

    /// Best effort: NICs vary in what they allow here, so individual
    /// failures are logged and swallowed.
    fn reset_flow_steering(&self, ifname: &str);

    /// Reprograms the RSS indirection table across the first `equal_to`
    /// queues, leaving the rest for flow-steered delivery.
    fn configure_rss(&self, ifname: &str, equal_to: u32) -> Result<()>;

    fn configure_channels(&self, ifname: &str, rx: u32, tx: u32) -> Result<()>;

    fn install_flow_rule(&self, ifname: &str, flow: &FlowSpec) -> Result<()>;

    fn bind_rx(&self, ifindex: u32, dmabuf_fd: RawFd, queues: &[QueueId])
        -> Result<Self::RxHandle>;

    fn bind_tx(&self, ifindex: u32, dmabuf_fd: RawFd) -> Result<Self::TxHandle>;
}

/// The real control plane.
pub struct Netlink;

impl NicControl for Netlink {
    type RxHandle = netdev::RxBinding;
    type TxHandle = netdev::TxBinding;

    fn rx_queue_count(&self, ifindex: u32) -> Result<u32> {
        ethtool::rx_queue_count(ifindex)
    }

    fn set_header_split(&self, ifindex: u32, on: bool) -> Result<()> {
        let want = if on {
            ethtool::TCP_DATA_SPLIT_ON
        } else {
            ethtool::TCP_DATA_SPLIT_OFF
        };
        ethtool::set_tcp_data_split(ifindex, want)?;
        let got = ethtool::get_tcp_data_split(ifindex)?;
        info!("TCP header split: {}", ethtool::tcp_data_split_str(got));
        if got != want {
            return Err(Error::KernelUnsupported(format!(
                "tcp-data-split set to {} but NIC reports {}",
                ethtool::tcp_data_split_str(want),
                ethtool::tcp_data_split_str(got)
            )));
        }
        Ok(())
    }

    fn reset_flow_steering(&self, ifname: &str) {
        for toggle in ["off", "on"] {
            if let Err(e) = ethtool_cmd(&["-K", ifname, "ntuple", toggle]) {
                warn!("ntuple {toggle} failed (ignored): {e}");
            }
        }
        for id in installed_filter_ids(ifname) {
            if let Err(e) = ethtool_cmd(&["-N", ifname, "delete", &id.to_string()]) {
                warn!("deleting filter {id} failed (ignored): {e}");
            }
        }
    }

    fn configure_rss(&self, ifname: &str, equal_to: u32) -> Result<()> {
        ethtool_cmd(&["-X", ifname, "equal", &equal_to.to_string()])
    }

    fn configure_channels(&self, ifname: &str, rx: u32, tx: u32) -> Result<()> {
        ethtool_cmd(&[
            "-L",
            ifname,
            "rx",
            &rx.to_string(),
            "tx",
            &tx.to_string(),
        ])
    }

    fn install_flow_rule(&self, ifname: &str, flow: &FlowSpec) -> Result<()> {
        if flow.client.is_some() {
            let args = flow_rule_args(ifname, flow, true);
            match ethtool_cmd_owned(&args) {
                Ok(()) => return Ok(()),
                Err(e) => warn!("5-tuple flow rule failed, retrying with 3-tuple: {e}"),
            }
        }
        ethtool_cmd_owned(&flow_rule_args(ifname, flow, false))
    }

    fn bind_rx(
        &self,
        ifindex: u32,
        dmabuf_fd: RawFd,
        queues: &[QueueId],
    ) -> Result<netdev::RxBinding> {
        netdev::bind_rx(ifindex, dmabuf_fd, queues)
    }

    fn bind_tx(&self, ifindex: u32, dmabuf_fd: RawFd) -> Result<netdev::TxBinding> {
        netdev::bind_tx(ifindex, dmabuf_fd)
    }
}

fn flow_rule_args(ifname: &str, flow: &FlowSpec, five_tuple: bool) -> Vec<String> {
    let port = flow.port.to_string();
    let mut args = vec![
        "-N".to_string(),
        ifname.to_string(),
        "flow-type".to_string(),
        flow.flow_type().to_string(),
    ];
    if five_tuple {
        if let Some(client) = flow.client {
            args.push("src-ip".to_string());
            args.push(canonical(client).to_string());
        }
    }
    args.push("dst-ip".to_string());
    args.push(canonical(flow.server).to_string());
    if five_tuple && flow.client.is_some() {
        args.push("src-port".to_string());
        args.push(port.clone());
    }
    args.push("dst-port".to_string());
    args.push(port);
    args.push("queue".to_string());
    args.push(flow.queue.to_string());
    args
}

fn ethtool_cmd(args: &[&str]) -> Result<()> {
    let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    ethtool_cmd_owned(&owned)
}

fn ethtool_cmd_owned(args: &[String]) -> Result<()> {
    info!("running: ethtool {}", args.join(" "));
    let status = Command::new("ethtool").args(args).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::ShellOut(status.code().unwrap_or(-1)))
    }
}

/// Asks ethtool for the installed ntuple filters and extracts their ids.
fn installed_filter_ids(ifname: &str) -> Vec<u64> {
    let output = match Command::new("ethtool").args(["-n", ifname]).output() {
        Ok(out) => out,
        Err(e) => {
            warn!("listing filters failed (ignored): {e}");
            return Vec::new();
        }
    };
    parse_filter_ids(&String::from_utf8_lossy(&output.stdout))
}

fn parse_filter_ids(output: &str) -> Vec<u64> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match words.next() {
                Some("Filter:") => words.next()?.parse().ok(),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_ids_are_parsed_from_ethtool_output() {
        let output = "\
4 RX rings available
Total 2 rules

Filter: 12
\tRule Type: TCP over IPv4
\tAction: Direct to queue 7

Filter: 30
\tAction: Direct to queue 7
";
        assert_eq!(parse_filter_ids(output), vec![12, 30]);
    }

    #[test]
    fn no_filters_no_ids() {
        assert_eq!(parse_filter_ids("Total 0 rules\n"), Vec::<u64>::new());
    }

    #[test]
    fn five_tuple_rule_orders_arguments_like_ethtool_expects() {
        let flow = FlowSpec {
            server: "10.0.0.2".parse().unwrap(),
            client: Some("10.0.0.9".parse().unwrap()),
            port: 5201,
            queue: 7,
        };
        let args = flow_rule_args("eth1", &flow, true);
        assert_eq!(
            args,
            vec![
                "-N", "eth1", "flow-type", "tcp4", "src-ip", "10.0.0.9", "dst-ip", "10.0.0.2",
                "src-port", "5201", "dst-port", "5201", "queue", "7",
            ]
        );
    }

    #[test]
    fn three_tuple_rule_omits_client_matches() {
        let flow = FlowSpec {
            server: "2001:db8::2".parse().unwrap(),
            client: Some("2001:db8::9".parse().unwrap()),
            port: 443,
            queue: 3,
        };
        let args = flow_rule_args("eth1", &flow, false);
        assert_eq!(
            args,
            vec![
                "-N",
                "eth1",
                "flow-type",
                "tcp6",
                "dst-ip",
                "2001:db8::2",
                "dst-port",
                "443",
                "queue",
                "3",
            ]
        );
    }

    #[test]
    fn v4_mapped_addresses_select_tcp4() {
        let flow = FlowSpec {
            server: "::ffff:192.0.2.7".parse().unwrap(),
            client: None,
            port: 80,
            queue: 0,
        };
        assert_eq!(flow.flow_type(), "tcp4");
        let args = flow_rule_args("eth0", &flow, false);
        assert!(args.contains(&"192.0.2.7".to_string()));
    }
}
