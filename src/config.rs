use std::net::IpAddr;

use crate::errors::{Error, Result};

/// What the process is asked to do, derived from which addresses were given.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Listen,
    Send,
    SelfTest,
}

/// A contiguous range of NIC-local RX queue indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueRange {
    pub start: u32,
    pub count: u32,
}

impl QueueRange {
    pub fn indices(&self) -> impl Iterator<Item = u32> {
        self.start..self.start + self.count
    }
}

/// Everything the engines need, threaded explicitly instead of being held in
/// process globals. The self-test and the data-plane roles share this record.
#[derive(Clone, Debug)]
pub struct Config {
    pub ifname: String,
    pub ifindex: u32,
    pub listen: bool,
    /// Peer address on the sender, local bind address on the listener.
    pub server: Option<IpAddr>,
    /// Client-side address for the 5-tuple flow rule and the sender's local bind.
    pub client: Option<IpAddr>,
    pub port: u16,
    pub queues: QueueRange,
    /// Validation modulus, if payload checking was requested.
    pub validation: Option<u64>,
    /// TX chunk size in bytes; 0 sends each payload as a single segment.
    pub max_chunk: usize,
    /// Deadline for one zero-copy send completion.
    pub waittime_ms: u64,
}

impl Config {
    pub fn role(&self) -> Role {
        if self.server.is_none() && self.client.is_none() {
            Role::SelfTest
        } else if self.listen {
            Role::Listen
        } else {
            Role::Send
        }
    }
}

/// Queue selection when neither -t nor -q was given. The data plane binds the
/// top queue only; the self-test takes the upper half so it can exercise
/// multi-queue binds.
pub fn default_queue_range(total_queues: u32, selftest: bool) -> Result<QueueRange> {
    if total_queues < 2 {
        return Err(Error::Config(format!(
            "number of device queues is too low ({total_queues})"
        )));
    }
    if selftest {
        Ok(QueueRange {
            start: total_queues / 2,
            count: total_queues / 2,
        })
    } else {
        Ok(QueueRange {
            start: total_queues - 1,
            count: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(listen: bool, server: Option<IpAddr>, client: Option<IpAddr>) -> Config {
        Config {
            ifname: "eth1".into(),
            ifindex: 3,
            listen,
            server,
            client,
            port: 5201,
            queues: QueueRange { start: 7, count: 1 },
            validation: None,
            max_chunk: 0,
            waittime_ms: 500,
        }
    }

    #[test]
    fn role_dispatch() {
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(config(true, Some(addr), None).role(), Role::Listen);
        assert_eq!(config(false, Some(addr), None).role(), Role::Send);
        assert_eq!(config(false, None, None).role(), Role::SelfTest);
        // A client address alone still selects the data plane.
        assert_eq!(config(false, None, Some(addr)).role(), Role::Send);
    }

    #[test]
    fn default_queues_data_plane() {
        let r = default_queue_range(8, false).unwrap();
        assert_eq!(r, QueueRange { start: 7, count: 1 });
        assert_eq!(r.indices().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn default_queues_selftest_upper_half() {
        let r = default_queue_range(8, true).unwrap();
        assert_eq!(r, QueueRange { start: 4, count: 4 });
    }

    #[test]
    fn default_queues_rejects_single_queue_nic() {
        assert!(default_queue_range(1, false).is_err());
        assert!(default_queue_range(1, true).is_err());
    }
}
