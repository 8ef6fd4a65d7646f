//! # devmem-nc
//!
//! A netcat-style diagnostic endpoint for device-memory TCP (dmTCP): TCP
//! payload moves directly between the socket and a dma-buf, bypassing host
//! memory on the hot path.
//!
//! ## Roles
//!
//! - **Listener** - steers a flow into a bound set of RX queues and receives
//!   fragments into the dma-buf (`receiver::serve`).
//! - **Sender** - zero-copy sends a device-resident buffer, draining
//!   completions from the socket error queue (`sender::send`).
//! - **Self-test** - with no peer configured, probes the kernel's bind
//!   contract (`selftest::run`).
//!
//! Either side interoperates with a classic TCP peer; dmTCP is a local
//! kernel arrangement and the wire bytes are plain TCP.
//!
//! ## Quick Start
//!
//! ```ignore
//! // On the server:  devmem-nc -l -s <addr> -p 5201 -f eth1
//! // On the client:  echo "hello" | devmem-nc -s <addr> -p 5201 -f eth1
//! ```

pub mod config;
pub mod errors;
pub mod nic;
pub mod provider;
pub mod receiver;
pub mod selftest;
pub mod sender;
pub mod sock;
pub mod uapi;
pub mod validate;
