//! UDP packet workers.
//!
//! All datagrams for the bound socket land on a single receive queue, so one
//! worker per CPU shares the socket. Each worker keeps a private remote→Test
//! index to stay off the registry lock on the per-packet path; the registry
//! remains authoritative. UDP has no close, so dormant entries are garbage
//! collected by idle time: marked inactive after 200 ms, deleted after 2 s.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::server::handshake::decode_syn;
use crate::server::ServerCtx;
use crate::state::{Protocol, Test, TestKind};

/// Largest possible UDP datagram
const UDP_READ_BUFFER: usize = 64 * 1024;

/// Reaper cadence, and the idle threshold that stops stats display
const INACTIVE_AFTER: Duration = Duration::from_millis(200);
/// Idle threshold after which the client is assumed gone
const DELETE_AFTER: Duration = Duration::from_secs(2);

/// Bind is done by the caller; this spawns the per-CPU packet workers.
pub async fn run_udp_server(ctx: Arc<ServerCtx>, socket: UdpSocket, shutdown: CancellationToken) {
    let socket = Arc::new(socket);
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    for worker_id in 0..workers {
        tokio::spawn(udp_packet_worker(
            ctx.clone(),
            socket.clone(),
            shutdown.clone(),
            worker_id,
        ));
    }
}

async fn udp_packet_worker(
    ctx: Arc<ServerCtx>,
    socket: Arc<UdpSocket>,
    shutdown: CancellationToken,
    worker_id: usize,
) {
    // Worker-local index: single-owner, no lock on the hot path
    let mut tests: HashMap<IpAddr, Arc<Test>> = HashMap::new();
    let mut buffer = vec![0u8; UDP_READ_BUFFER];

    let mut reaper = tokio::time::interval(INACTIVE_AFTER);
    reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = reaper.tick() => {
                reap_dormant(&ctx, &mut tests, INACTIVE_AFTER, DELETE_AFTER);
            }
            received = socket.recv_from(&mut buffer) => match received {
                Ok((n, peer)) => handle_datagram(&ctx, &mut tests, &buffer[..n], peer),
                Err(e) => {
                    // Only a fatal socket error terminates a worker
                    ctx.sink.print_dbg(&format!(
                        "UDP worker {} receive error: {}", worker_id, e
                    ));
                    break;
                }
            }
        }
    }

    // Give back this worker's references on the way out
    for (_, test) in tests.drain() {
        ctx.registry.safe_delete(&test);
    }
}

fn handle_datagram(
    ctx: &ServerCtx,
    tests: &mut HashMap<IpAddr, Arc<Test>>,
    datagram: &[u8],
    peer: SocketAddr,
) {
    let remote = peer.ip();
    let test = match tests.get(&remote) {
        Some(test) => test.clone(),
        None => {
            let (test, is_new) = ctx.registry.create_or_get(remote, Protocol::Udp, TestKind::All);
            tests.insert(remote, test.clone());
            if is_new {
                // The first datagram doubles as the handshake
                match decode_syn(datagram) {
                    Ok((_, params)) => *test.client_params.lock() = params,
                    Err(_) => ctx.sink.print_dbg(&format!(
                        "No handshake in first datagram from {}, counting traffic anyway",
                        remote
                    )),
                }
                ctx.sink
                    .print_dbg(&format!("Creating UDP test for {}", remote));
                ctx.sink.emit_test_hdr();
            }
            test
        }
    };

    test.touch();
    test.result.pps.fetch_add(1, Ordering::Relaxed);
    test.result.bw.fetch_add(datagram.len() as u64, Ordering::Relaxed);
}

/// One garbage-collection pass over a worker's index
fn reap_dormant(
    ctx: &ServerCtx,
    tests: &mut HashMap<IpAddr, Arc<Test>>,
    inactive_after: Duration,
    delete_after: Duration,
) {
    tests.retain(|remote, test| {
        let idle = test.idle();
        if idle > inactive_after {
            test.set_active(false);
        }
        if idle > delete_after {
            ctx.sink.print_dbg(&format!(
                "Deleting dormant UDP test for {}, idle {:?}",
                remote, idle
            ));
            ctx.registry.safe_delete(test);
            false
        } else {
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::init_server;

    fn remote(n: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, n))
    }

    fn datagram_from(n: u8, len: usize) -> (Vec<u8>, SocketAddr) {
        (vec![0u8; len], SocketAddr::new(remote(n), 40000))
    }

    #[test]
    fn test_contractual_thresholds() {
        assert_eq!(INACTIVE_AFTER, Duration::from_millis(200));
        assert_eq!(DELETE_AFTER, Duration::from_secs(2));
    }

    #[test]
    fn test_datagrams_count_pps_and_bw() {
        let ctx = init_server(false, Vec::new());
        let mut tests = HashMap::new();

        for _ in 0..10 {
            let (payload, peer) = datagram_from(1, 512);
            handle_datagram(&ctx, &mut tests, &payload, peer);
        }

        let test = tests.get(&remote(1)).expect("worker-local entry");
        assert_eq!(test.result.pps.load(Ordering::Relaxed), 10);
        assert_eq!(test.result.bw.load(Ordering::Relaxed), 10 * 512);
        assert_eq!(ctx.registry.len(), 1);
    }

    #[test]
    fn test_reaper_marks_then_deletes() {
        let ctx = init_server(false, Vec::new());
        let mut tests = HashMap::new();

        let (payload, peer) = datagram_from(2, 64);
        handle_datagram(&ctx, &mut tests, &payload, peer);
        let test = tests.get(&remote(2)).unwrap().clone();
        assert!(test.is_active());

        std::thread::sleep(Duration::from_millis(30));

        // Past the inactive threshold but short of deletion
        reap_dormant(&ctx, &mut tests, Duration::from_millis(10), Duration::from_millis(200));
        assert!(!test.is_active());
        assert_eq!(tests.len(), 1);
        assert_eq!(ctx.registry.len(), 1);

        // Past the delete threshold: gone from both the index and the registry
        reap_dormant(&ctx, &mut tests, Duration::from_millis(10), Duration::from_millis(20));
        assert!(tests.is_empty());
        assert!(ctx.registry.is_empty());
    }

    #[test]
    fn test_fresh_traffic_revives_entry() {
        let ctx = init_server(false, Vec::new());
        let mut tests = HashMap::new();

        let (payload, peer) = datagram_from(3, 64);
        handle_datagram(&ctx, &mut tests, &payload, peer);
        let test = tests.get(&remote(3)).unwrap().clone();

        std::thread::sleep(Duration::from_millis(30));
        reap_dormant(&ctx, &mut tests, Duration::from_millis(10), Duration::from_secs(2));
        assert!(!test.is_active());

        // New packet flips it back
        handle_datagram(&ctx, &mut tests, &payload, peer);
        assert!(test.is_active());
    }

    #[test]
    fn test_workers_share_registry_entry() {
        let ctx = init_server(false, Vec::new());
        let mut worker_a = HashMap::new();
        let mut worker_b = HashMap::new();

        let (payload, peer) = datagram_from(4, 128);
        handle_datagram(&ctx, &mut worker_a, &payload, peer);
        handle_datagram(&ctx, &mut worker_b, &payload, peer);

        // Two worker-local references, one registry entry
        assert_eq!(ctx.registry.len(), 1);
        assert!(Arc::ptr_eq(
            worker_a.get(&remote(4)).unwrap(),
            worker_b.get(&remote(4)).unwrap()
        ));

        // Each worker releasing its own reference deletes only on the last
        ctx.registry.safe_delete(worker_a.get(&remote(4)).unwrap());
        assert_eq!(ctx.registry.len(), 1);
        ctx.registry.safe_delete(worker_b.get(&remote(4)).unwrap());
        assert!(ctx.registry.is_empty());
    }
}
