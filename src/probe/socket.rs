use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::error::ProbeError;

/// Buffer large enough for any quoted ICMP error payload
pub const RECV_BUFFER_LEN: usize = 1500;

/// Open a raw ICMP listener for the IP version of `remote_ip`.
///
/// Requires root/CAP_NET_RAW; a denial maps to `TransportUnavailable` so the
/// CLI can print a permissions hint instead of retrying.
pub fn icmp_socket(remote_ip: IpAddr) -> Result<Socket, ProbeError> {
    let (domain, protocol) = if remote_ip.is_ipv6() {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol)).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            ProbeError::TransportUnavailable(e)
        } else {
            ProbeError::Io(e)
        }
    })?;

    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(Duration::from_secs(1)))?;

    Ok(socket)
}

/// Receive one ICMP message within `timeout`.
///
/// Messages whose source does not match a non-empty `expected_peer` are
/// silently discarded and the read retried within the remaining deadline.
/// Returns `Timeout` at deadline exhaustion.
pub fn recv_icmp_from_peer(
    socket: &Socket,
    timeout: Duration,
    expected_peer: Option<IpAddr>,
    buffer: &mut [u8],
) -> Result<(usize, IpAddr), ProbeError> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout);
        }
        socket.set_read_timeout(Some(remaining))?;

        // Convert buffer to MaybeUninit slice for socket2
        let uninit_buf: &mut [MaybeUninit<u8>] = unsafe {
            std::slice::from_raw_parts_mut(
                buffer.as_mut_ptr() as *mut MaybeUninit<u8>,
                buffer.len(),
            )
        };

        match socket.recv_from(uninit_buf) {
            Ok((len, addr)) => {
                let Some(source) = addr.as_socket().map(|s| s.ip()) else {
                    continue;
                };
                if let Some(want) = expected_peer {
                    if source != want {
                        continue;
                    }
                }
                return Ok((len, source));
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Err(ProbeError::Timeout);
            }
            Err(e) => return Err(ProbeError::Io(e)),
        }
    }
}

/// Establish a TCP connection from `local_ip:local_port` with the given IP
/// TTL, so intermediate routers answer the SYN with Time Exceeded.
///
/// The TTL (unicast hop limit for v6) is set before `connect` emits the SYN.
pub fn dial_with_ttl(
    dial_addr: SocketAddr,
    local_ip: IpAddr,
    local_port: u16,
    ttl: u32,
    timeout: Duration,
) -> io::Result<Socket> {
    let domain = if dial_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    // The same local port is reused across probe rounds in MTR mode
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(SocketAddr::new(local_ip, local_port)))?;

    if dial_addr.is_ipv6() {
        socket.set_unicast_hops_v6(ttl)?;
    } else {
        socket.set_ttl(ttl)?;
    }

    socket.connect_timeout(&SockAddr::from(dial_addr), timeout)?;
    Ok(socket)
}

/// Get the local IP address that routes toward the target.
/// Uses the UDP connect trick: no packet is sent, the kernel just picks
/// the source address it would use.
pub fn local_addr_for(target: IpAddr) -> IpAddr {
    use std::net::UdpSocket;

    let bind_addr = match target {
        IpAddr::V4(_) => "0.0.0.0:0",
        IpAddr::V6(_) => "[::]:0",
    };
    let target_addr = SocketAddr::new(target, 80);

    if let Ok(socket) = UdpSocket::bind(bind_addr) {
        if socket.connect(target_addr).is_ok() {
            if let Ok(local_addr) = socket.local_addr() {
                return local_addr.ip();
            }
        }
    }

    // Fallback to unspecified if lookup fails
    match target {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}

/// Human hint printed when raw ICMP is denied
pub fn permissions_hint() -> String {
    let binary_path = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "netgauge".to_string());

    format!(
        "Insufficient permissions for raw ICMP sockets.\n\n\
         Fix options:\n\
         \u{2022} Run with sudo: sudo netgauge <target>\n\
         \u{2022} Add capability: sudo setcap cap_net_raw+ep {}",
        binary_path
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_addr_matches_target_family() {
        let v4 = local_addr_for(IpAddr::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)));
        assert!(v4.is_ipv4());

        let v6 = local_addr_for(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST));
        assert!(v6.is_ipv6());
    }

    #[test]
    fn test_permissions_hint_mentions_setcap() {
        assert!(permissions_hint().contains("cap_net_raw"));
    }
}
