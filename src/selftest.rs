//! Control-plane self-test.
//!
//! With no peer to talk to, the orchestrator exercises the bind contract's
//! failure modes as positive properties: binds that must be refused, a
//! channel shrink that must be refused while a binding is live, and the
//! implicit unbind on handle drop.

use tracing::info;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::nic::{BindingHandle, NicControl, QueueId};
use crate::provider::DeviceBuffer;

pub fn run<N, B>(cfg: &Config, nic: &N, mem: &B) -> Result<()>
where
    N: NicControl,
    B: DeviceBuffer,
{
    nic.configure_rss(&cfg.ifname, cfg.queues.start)?;
    nic.set_header_split(cfg.ifindex, true)?;

    let queues: Vec<QueueId> = cfg.queues.indices().map(QueueId::rx).collect();

    if nic.bind_rx(cfg.ifindex, mem.dmabuf_fd(), &[]).is_ok() {
        return Err(Error::SelfTest(
            "binding an empty queues array should have failed".into(),
        ));
    }

    nic.set_header_split(cfg.ifindex, false)?;
    if nic.bind_rx(cfg.ifindex, mem.dmabuf_fd(), &queues).is_ok() {
        return Err(Error::SelfTest(
            "binding with header split off should have failed".into(),
        ));
    }

    nic.set_header_split(cfg.ifindex, true)?;
    let binding = nic.bind_rx(cfg.ifindex, mem.dmabuf_fd(), &queues)?;
    info!("bound dmabuf id={}", binding.dmabuf_id());

    // Deactivating a bound queue must be refused by the kernel.
    if nic
        .configure_channels(&cfg.ifname, cfg.queues.count, cfg.queues.count - 1)
        .is_ok()
    {
        return Err(Error::SelfTest(
            "deactivating a bound queue should be illegal".into(),
        ));
    }

    // Dropping the handle closes its netlink session, which unbinds.
    drop(binding);

    info!("self-test ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueRange;
    use crate::nic::mock::FakeNic;
    use crate::provider::mock::MockProvider;
    use crate::provider::{page_size, DmabufProvider};

    fn config(total_queues: u32) -> Config {
        Config {
            ifname: "eth1".into(),
            ifindex: 3,
            listen: false,
            server: None,
            client: None,
            port: 0,
            queues: QueueRange {
                start: total_queues / 2,
                count: total_queues / 2,
            },
            validation: None,
            max_chunk: 0,
            waittime_ms: 500,
        }
    }

    #[test]
    fn sequence_passes_against_a_conforming_kernel() {
        let nic = FakeNic::new(8);
        let mem = MockProvider.allocate(page_size()).unwrap();
        run(&config(8), &nic, &mem).unwrap();
        // The final handle drop released the binding.
        assert_eq!(nic.active_bindings(), 0);
        assert_eq!(nic.rss_equal(), Some(4));
    }

    #[test]
    fn empty_queue_bind_fails_without_mutating_state() {
        let nic = FakeNic::new(4);
        let mem = MockProvider.allocate(page_size()).unwrap();
        nic.set_header_split(3, true).unwrap();
        assert!(nic.bind_rx(3, mem.dmabuf_fd(), &[]).is_err());
        assert_eq!(nic.active_bindings(), 0);
    }

    #[test]
    fn bind_requires_header_split_at_bind_time() {
        let nic = FakeNic::new(4);
        let mem = MockProvider.allocate(page_size()).unwrap();
        let queues = [QueueId::rx(3)];

        nic.set_header_split(3, false).unwrap();
        assert!(nic.bind_rx(3, mem.dmabuf_fd(), &queues).is_err());

        nic.set_header_split(3, true).unwrap();
        assert!(nic.bind_rx(3, mem.dmabuf_fd(), &queues).is_ok());
    }

    #[test]
    fn shrinking_channels_below_a_bound_queue_fails() {
        let nic = FakeNic::new(4);
        let mem = MockProvider.allocate(page_size()).unwrap();
        nic.set_header_split(3, true).unwrap();
        let binding = nic.bind_rx(3, mem.dmabuf_fd(), &[QueueId::rx(3)]).unwrap();

        assert!(nic.configure_channels("eth1", 3, 3).is_err());
        // Not touching the bound queue is fine.
        assert!(nic.configure_channels("eth1", 4, 3).is_ok());

        drop(binding);
        assert!(nic.configure_channels("eth1", 3, 3).is_ok());
    }

    #[test]
    fn dropping_a_handle_releases_the_binding_for_rebind() {
        let nic = FakeNic::new(4);
        let mem = MockProvider.allocate(page_size()).unwrap();
        nic.set_header_split(3, true).unwrap();
        let queues = [QueueId::rx(2), QueueId::rx(3)];

        let first = nic.bind_rx(3, mem.dmabuf_fd(), &queues).unwrap();
        let first_id = first.dmabuf_id();
        assert_eq!(nic.active_bindings(), 1);
        drop(first);
        assert_eq!(nic.active_bindings(), 0);

        let second = nic.bind_rx(3, mem.dmabuf_fd(), &queues).unwrap();
        assert_ne!(second.dmabuf_id(), first_id);
    }

    #[test]
    fn sequence_fails_when_the_kernel_accepts_a_bad_bind() {
        // A kernel model with split forced on behaves as if split-off binds
        // succeed, which the self-test must flag.
        struct AlwaysSplit(FakeNic);
        impl NicControl for AlwaysSplit {
            type RxHandle = <FakeNic as NicControl>::RxHandle;
            type TxHandle = <FakeNic as NicControl>::TxHandle;
            fn rx_queue_count(&self, ifindex: u32) -> crate::errors::Result<u32> {
                self.0.rx_queue_count(ifindex)
            }
            fn set_header_split(&self, ifindex: u32, _on: bool) -> crate::errors::Result<()> {
                self.0.set_header_split(ifindex, true)
            }
            fn reset_flow_steering(&self, ifname: &str) {
                self.0.reset_flow_steering(ifname)
            }
            fn configure_rss(&self, ifname: &str, equal_to: u32) -> crate::errors::Result<()> {
                self.0.configure_rss(ifname, equal_to)
            }
            fn configure_channels(
                &self,
                ifname: &str,
                rx: u32,
                tx: u32,
            ) -> crate::errors::Result<()> {
                self.0.configure_channels(ifname, rx, tx)
            }
            fn install_flow_rule(
                &self,
                ifname: &str,
                flow: &crate::nic::FlowSpec,
            ) -> crate::errors::Result<()> {
                self.0.install_flow_rule(ifname, flow)
            }
            fn bind_rx(
                &self,
                ifindex: u32,
                fd: std::os::fd::RawFd,
                queues: &[QueueId],
            ) -> crate::errors::Result<Self::RxHandle> {
                self.0.bind_rx(ifindex, fd, queues)
            }
            fn bind_tx(
                &self,
                ifindex: u32,
                fd: std::os::fd::RawFd,
            ) -> crate::errors::Result<Self::TxHandle> {
                self.0.bind_tx(ifindex, fd)
            }
        }

        let nic = AlwaysSplit(FakeNic::new(8));
        let mem = MockProvider.allocate(page_size()).unwrap();
        let err = run(&config(8), &nic, &mem).unwrap_err();
        assert!(matches!(err, Error::SelfTest(_)));
    }
}
