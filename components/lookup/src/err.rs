use std::time::Duration;

use dxram_types::NodeId;
use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("node 0x{node:04X} is unreachable"))]
    Unreachable {
        node: NodeId,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("node 0x{node:04X} did not answer within {timeout:?}"))]
    Timeout {
        node: NodeId,
        timeout: Duration,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("failed to encode or decode a lookup message"))]
    Codec {
        #[snafu(implicit)]
        location: Location,
        source: bincode::Error,
    },

    #[snafu(display("node 0x{node:04X} answered {operation} with {got}"))]
    UnexpectedResponse {
        node: NodeId,
        operation: &'static str,
        got: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{operation} gave up after {attempts} attempts"))]
    RetriesExhausted {
        operation: &'static str,
        attempts: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("superpeer 0x{node:04X} refused {operation} for 0x{target:04X}"))]
    NotResponsible {
        node: NodeId,
        target: NodeId,
        operation: &'static str,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{operation} is not available on a {role} node"))]
    RoleMismatch {
        operation: &'static str,
        role: dxram_types::NodeRole,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("chunk range 0x{start:X}..=0x{end:X} spans more than one creator"))]
    InvalidRange {
        start: u64,
        end: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("boot failed: {reason}"))]
    Boot {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("0x{node:04X} is shut down"))]
    ShutDown {
        node: NodeId,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("failed to spawn the stabilization worker"))]
    SpawnWorker {
        #[snafu(implicit)]
        location: Location,
        source: std::io::Error,
    },
}

impl Error {
    /// The destination may have failed; the overlay heals itself from these.
    pub fn is_network_failure(&self) -> bool {
        matches!(self, Error::Unreachable { .. } | Error::Timeout { .. })
    }

    pub fn is_unreachable(&self) -> bool { matches!(self, Error::Unreachable { .. }) }

    pub fn is_retries_exhausted(&self) -> bool { matches!(self, Error::RetriesExhausted { .. }) }
}

pub type Result<T> = std::result::Result<T, Error>;
