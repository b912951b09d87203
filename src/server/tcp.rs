use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::server::bandwidth::serve_bandwidth;
use crate::server::handshake::{ack_msg, decode_syn, encode_msg, MAX_MSG_LEN};
use crate::server::latency::serve_latency;
use crate::server::ServerCtx;
use crate::state::{Protocol, Test, TestKind};

/// How long a finished connection keeps its Test referenced. Short-lived
/// connection patterns (CPS) land on the existing entry within this window
/// instead of thrashing create/delete and reprinting headers.
pub(crate) const TEST_DELETE_GRACE: Duration = Duration::from_secs(2);

/// Accept loop. Individual accept failures are logged and accepting
/// resumes; only shutdown ends the loop.
pub async fn run_tcp_server(
    ctx: Arc<ServerCtx>,
    listener: TcpListener,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_conn(ctx.clone(), stream, peer));
                }
                Err(e) => {
                    ctx.sink
                        .print_err(&format!("Error accepting new TCP connection: {}", e));
                }
            }
        }
    }
}

async fn handle_conn(ctx: Arc<ServerCtx>, mut stream: TcpStream, peer: SocketAddr) {
    match stream.local_addr() {
        Ok(local) => ctx.sink.print_dbg(&format!(
            "New connection from {}, port {} to {}, port {}",
            peer.ip(),
            peer.port(),
            local.ip(),
            local.port()
        )),
        Err(e) => {
            ctx.sink.print_dbg(&format!("LocalAddr failed: {}", e));
            return;
        }
    }

    let (test, is_new) = ctx
        .registry
        .create_or_get(peer.ip(), Protocol::Tcp, TestKind::All);
    if is_new {
        ctx.sink.emit_test_hdr();
    }

    if let Err(e) = serve_conn(&ctx, &test, &mut stream).await {
        ctx.sink
            .print_dbg(&format!("Connection from {} ended: {}", peer, e));
    }
    drop(stream);

    // Deferred release: keep the Test alive through the grace window so a
    // CPS burst reuses it, then give the reference back.
    tokio::time::sleep(TEST_DELETE_GRACE).await;
    ctx.registry.safe_delete(&test);
}

async fn serve_conn(ctx: &ServerCtx, test: &Test, stream: &mut TcpStream) -> Result<()> {
    // Every connection counts toward CPS, whatever else it negotiates
    test.result.cps.fetch_add(1, Ordering::Relaxed);
    test.touch();

    let mut buffer = [0u8; MAX_MSG_LEN];
    let n = stream.read(&mut buffer).await?;
    let (test_id, params) = match decode_syn(&buffer[..n]) {
        Ok(decoded) => decoded,
        Err(_) => {
            // Invalid handshake: drop the connection silently
            ctx.sink
                .print_dbg(&format!("Invalid handshake from {}", test.remote_ip));
            return Ok(());
        }
    };
    *test.client_params.lock() = params.clone();

    let ack = encode_msg(&ack_msg(&ctx.cert, ctx.clock.time_to_next_tick()))?;
    stream.write_all(&ack).await?;

    match (test_id.protocol, test_id.kind) {
        (Protocol::Tcp, TestKind::Bandwidth) => serve_bandwidth(test, &params, stream).await?,
        (Protocol::Tcp, TestKind::Latency) => {
            ctx.sink.emit_latency_hdr();
            serve_latency(test, &params, stream, ctx.sink.as_ref()).await?;
        }
        // CPS-style tests are done once the connection is counted
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handshake::Msg;
    use crate::server::init_server;
    use crate::state::{ClientParams, TestId};

    async fn start_server(cert: Vec<u8>) -> (Arc<ServerCtx>, SocketAddr, CancellationToken) {
        let ctx = init_server(false, cert);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(run_tcp_server(ctx.clone(), listener, shutdown.clone()));
        (ctx, addr, shutdown)
    }

    fn syn_frame(kind: TestKind, params: ClientParams) -> Vec<u8> {
        encode_msg(&Msg::Syn {
            test_id: TestId {
                protocol: Protocol::Tcp,
                kind,
            },
            params,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_handshake_acks_with_cert() {
        let (_ctx, addr, shutdown) = start_server(b"opaque-cert".to_vec()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let frame = syn_frame(TestKind::Cps, ClientParams::default());
        client.write_all(&frame).await.unwrap();

        let mut reply = vec![0u8; MAX_MSG_LEN];
        let n = client.read(&mut reply).await.unwrap();
        match crate::server::handshake::decode_msg(&reply[..n]).unwrap() {
            Msg::Ack { cert, tick_delay } => {
                assert_eq!(cert, b"opaque-cert");
                assert!(tick_delay > Duration::ZERO);
                assert!(tick_delay <= Duration::from_secs(1));
            }
            other => panic!("expected ACK, got {:?}", other),
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cps_connections_share_one_test() {
        let (ctx, addr, shutdown) = start_server(Vec::new()).await;

        for _ in 0..5 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let frame = syn_frame(TestKind::Cps, ClientParams::default());
            client.write_all(&frame).await.unwrap();
            let mut reply = vec![0u8; MAX_MSG_LEN];
            let _ = client.read(&mut reply).await.unwrap();
        }

        // Handlers finish behind the scenes; wait for the counters to settle
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(ctx.registry.len(), 1, "one Test per remote across burst");
        let tests = ctx.registry.snapshot();
        assert!(tests[0].result.cps.load(Ordering::Relaxed) >= 5);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_invalid_handshake_dropped_silently() {
        let (ctx, addr, shutdown) = start_server(Vec::new()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"not a handshake").await.unwrap();

        // Server closes without answering
        let mut reply = [0u8; 16];
        let n = client.read(&mut reply).await.unwrap();
        assert_eq!(n, 0);

        // The Test survives the connection for the grace window
        assert_eq!(ctx.registry.len(), 1);

        shutdown.cancel();
    }
}
