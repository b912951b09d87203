use std::io;

use thiserror::Error;

use crate::state::HopData;

/// Errors from a single traceroute probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Raw ICMP sockets are forbidden for this process. Surfaced at probe
    /// creation so the CLI can print a permissions hint; there is no
    /// ICMP-less fallback.
    #[error("raw ICMP sockets unavailable: {0}")]
    TransportUnavailable(#[source] io::Error),

    /// The read deadline elapsed with no acceptable ICMP message.
    #[error("timed out waiting for ICMP message")]
    Timeout,

    /// No matching ICMP reply, or the reply came from an unexpected peer.
    /// Counted in `HopData::lost`; never surfaced past the probe loops.
    #[error("failed to complete connection or receive ICMP TTL exceeded")]
    HopUnreachable,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from a whole hop-discovery run.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Every TTL up to the maximum was probed without the destination
    /// completing a TCP handshake. Carries whatever hops did answer.
    #[error("destination not responding to TCP connection")]
    DestinationUnresponsive { hops: Vec<HopData> },

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// Errors from the framed handshake codec.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Malformed frame, short buffer, or a first message that is not a SYN.
    /// The connection is dropped silently; only a debug line is logged.
    #[error("invalid handshake message")]
    Invalid,

    /// An encoded message would not fit the single 1024-byte handshake read.
    #[error("handshake message too large: {0} bytes")]
    TooLarge(usize),

    #[error("handshake encode failed: {0}")]
    Codec(#[from] bincode::Error),
}

impl TraceError {
    /// The hops gathered before the run failed, if any.
    pub fn partial_hops(&self) -> &[HopData] {
        match self {
            TraceError::DestinationUnresponsive { hops } => hops,
            TraceError::Probe(_) => &[],
        }
    }
}
