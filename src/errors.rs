use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("kernel feature missing: {0}")]
    KernelUnsupported(String),
    #[error("flow steering leak: {0}")]
    FlowSteering(String),
    #[error("no tx completion within {0} ms")]
    CompletionTimeout(u64),
    #[error("payload validation failed: {0} mismatches")]
    Validation(usize),
    #[error("self-test: {0}")]
    SelfTest(String),
    #[error("ethtool exited with status {0}")]
    ShellOut(i32),
    #[error("netlink: {0}")]
    Netlink(#[source] io::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
}
