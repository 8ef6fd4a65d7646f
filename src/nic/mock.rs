//! In-memory kernel model used by unit tests: tracks header split, channel
//! counts, and live bindings the way the real control plane observes them.

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::errors::{Error, Result};

use super::{ethtool, BindingHandle, FlowSpec, NicControl, QueueId};

#[derive(Debug)]
struct State {
    split: u8,
    rx_channels: u32,
    tx_channels: u32,
    bindings: Vec<(u32, Vec<u32>)>,
    next_id: u32,
    rss_equal: Option<u32>,
    flow_rules: usize,
    resets: usize,
}

pub(crate) struct FakeNic {
    state: Rc<RefCell<State>>,
}

impl FakeNic {
    pub(crate) fn new(channels: u32) -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                split: ethtool::TCP_DATA_SPLIT_OFF,
                rx_channels: channels,
                tx_channels: channels,
                bindings: Vec::new(),
                next_id: 1,
                rss_equal: None,
                flow_rules: 0,
                resets: 0,
            })),
        }
    }

    pub(crate) fn active_bindings(&self) -> usize {
        self.state.borrow().bindings.len()
    }

    pub(crate) fn flow_rules(&self) -> usize {
        self.state.borrow().flow_rules
    }

    pub(crate) fn resets(&self) -> usize {
        self.state.borrow().resets
    }

    pub(crate) fn rss_equal(&self) -> Option<u32> {
        self.state.borrow().rss_equal
    }
}

pub(crate) struct FakeBinding {
    id: u32,
    state: Rc<RefCell<State>>,
}

impl BindingHandle for FakeBinding {
    fn dmabuf_id(&self) -> u32 {
        self.id
    }
}

impl Drop for FakeBinding {
    fn drop(&mut self) {
        self.state.borrow_mut().bindings.retain(|(id, _)| *id != self.id);
    }
}

fn einval() -> Error {
    Error::Netlink(io::Error::from_raw_os_error(libc::EINVAL))
}

impl NicControl for FakeNic {
    type RxHandle = FakeBinding;
    type TxHandle = FakeBinding;

    fn rx_queue_count(&self, _ifindex: u32) -> Result<u32> {
        Ok(self.state.borrow().rx_channels)
    }

    fn set_header_split(&self, _ifindex: u32, on: bool) -> Result<()> {
        self.state.borrow_mut().split = if on {
            ethtool::TCP_DATA_SPLIT_ON
        } else {
            ethtool::TCP_DATA_SPLIT_OFF
        };
        Ok(())
    }

    fn reset_flow_steering(&self, _ifname: &str) {
        let mut state = self.state.borrow_mut();
        state.resets += 1;
        state.flow_rules = 0;
    }

    fn configure_rss(&self, _ifname: &str, equal_to: u32) -> Result<()> {
        self.state.borrow_mut().rss_equal = Some(equal_to);
        Ok(())
    }

    fn configure_channels(&self, _ifname: &str, rx: u32, tx: u32) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let deactivates_bound = state
            .bindings
            .iter()
            .flat_map(|(_, queues)| queues.iter())
            .any(|&q| q >= rx);
        if deactivates_bound {
            // The kernel refuses to deactivate a bound queue; ethtool -L
            // surfaces that as a non-zero exit.
            return Err(Error::ShellOut(1));
        }
        state.rx_channels = rx;
        state.tx_channels = tx;
        Ok(())
    }

    fn install_flow_rule(&self, _ifname: &str, _flow: &FlowSpec) -> Result<()> {
        self.state.borrow_mut().flow_rules += 1;
        Ok(())
    }

    fn bind_rx(
        &self,
        _ifindex: u32,
        _dmabuf_fd: RawFd,
        queues: &[QueueId],
    ) -> Result<FakeBinding> {
        let mut state = self.state.borrow_mut();
        if queues.is_empty() {
            return Err(einval());
        }
        if state.split != ethtool::TCP_DATA_SPLIT_ON {
            return Err(einval());
        }
        if queues.iter().any(|q| q.index >= state.rx_channels) {
            return Err(einval());
        }
        let id = state.next_id;
        state.next_id += 1;
        state
            .bindings
            .push((id, queues.iter().map(|q| q.index).collect()));
        Ok(FakeBinding {
            id,
            state: Rc::clone(&self.state),
        })
    }

    fn bind_tx(&self, _ifindex: u32, _dmabuf_fd: RawFd) -> Result<FakeBinding> {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        state.bindings.push((id, Vec::new()));
        Ok(FakeBinding {
            id,
            state: Rc::clone(&self.state),
        })
    }
}
