//! One TCP-traceroute probe.
//!
//! A SYN is dialled at a chosen TTL while a concurrent matcher drains the
//! raw ICMP socket for the Time Exceeded error a router on the path will
//! quote the SYN back in. The probe's identity lives in the 4-tuple: local
//! port is base+TTL, and `local_port || remote_port` in network order is the
//! fingerprint searched for inside the quoted packet.

use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::error::ProbeError;
use crate::probe::{
    dial_with_ttl, find_fingerprint, fingerprint, icmp_socket, local_addr_for,
    recv_icmp_from_peer, time_exceeded_quoted, RECV_BUFFER_LEN,
};
use crate::state::{HopData, Test};

/// Local port base when none is configured
pub const DEFAULT_LOCAL_PORT: u16 = 8888;

/// Per-attempt ICMP read deadline
const ICMP_DEADLINE: Duration = Duration::from_secs(2);
/// Bound on the TCP dial so an unresponsive destination cannot stall a probe
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Probe-side network identity, shared by discovery and the MTR loops
#[derive(Debug, Clone, Copy)]
pub struct Prober {
    pub local_ip: IpAddr,
    pub local_port: Option<u16>,
}

impl Prober {
    pub fn new(target: IpAddr, local_port: Option<u16>) -> Self {
        Self {
            local_ip: local_addr_for(target),
            local_port,
        }
    }

    /// Send one probe at TTL `hop` and fold the outcome into `hop_data`.
    ///
    /// Returns `Ok(true)` when the destination itself completed the TCP
    /// handshake (the trace is done), `Ok(false)` for an intermediate hop.
    /// A probe with no matching ICMP, or one answered by a router other
    /// than a non-empty `expected_peer`, counts as lost.
    pub async fn probe_hop(
        &self,
        test: &Test,
        hop: u8,
        expected_peer: Option<IpAddr>,
        hop_data: &mut HopData,
    ) -> Result<bool, ProbeError> {
        let icmp = icmp_socket(test.remote_ip)?;

        let base = self.local_port.unwrap_or(DEFAULT_LOCAL_PORT);
        let local_port = base.wrapping_add(hop as u16);
        let fp = fingerprint(local_port, test.remote_port);
        let ipv6 = test.remote_ip.is_ipv6();

        let (time_tx, time_rx) = oneshot::channel();
        let (peer_tx, peer_rx) = oneshot::channel();

        // The ICMP socket is open before the SYN leaves; this matcher only
        // drains it, so a reply that beats the dial-error observation is
        // still picked up. Spawned strictly before the dial.
        tokio::task::spawn_blocking(move || {
            let mut buffer = [0u8; RECV_BUFFER_LEN];
            let deadline = Instant::now() + ICMP_DEADLINE;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return;
                }
                match recv_icmp_from_peer(&icmp, remaining, expected_peer, &mut buffer) {
                    Ok((len, source)) => {
                        let Some(quoted) = time_exceeded_quoted(&buffer[..len], ipv6) else {
                            continue;
                        };
                        if find_fingerprint(quoted, &fp).is_some() {
                            let _ = time_tx.send(Instant::now());
                            let _ = peer_tx.send(source);
                            return;
                        }
                    }
                    // Deadline exhausted or the socket failed: no match.
                    // Dropping the senders wakes the waiting probe.
                    Err(_) => return,
                }
            }
        });

        let dial_addr = test.dial_addr;
        let local_ip = self.local_ip;
        let start = Instant::now();
        let dialed = tokio::task::spawn_blocking(move || {
            dial_with_ttl(dial_addr, local_ip, local_port, hop as u32, DIAL_TIMEOUT)
        })
        .await
        .map_err(|e| ProbeError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        hop_data.sent += 1;

        let (end_time, peer, is_last) = match dialed {
            // The destination completed the handshake: the trace ends here
            Ok(conn) => {
                drop(conn);
                (Instant::now(), Some(test.remote_ip), true)
            }
            // The expected case for intermediate hops: rendezvous with the matcher
            Err(_) => match time_rx.await {
                Ok(end_time) => (end_time, peer_rx.await.ok(), false),
                Err(_) => (Instant::now(), None, false),
            },
        };

        let elapsed = end_time.duration_since(start);
        match peer {
            Some(peer) if expected_peer.is_none() || expected_peer == Some(peer) => {
                hop_data.record(peer, elapsed);
                Ok(is_last)
            }
            _ => {
                hop_data.lost += 1;
                Err(ProbeError::HopUnreachable)
            }
        }
    }
}
