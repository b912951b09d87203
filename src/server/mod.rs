//! Measurement server: one port, TCP and UDP, framed handshake, per-type
//! protocol routines, stats tick.

pub mod bandwidth;
pub mod handshake;
pub mod latency;
pub mod stats;
pub mod tcp;
pub mod udp;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::state::TestRegistry;
use crate::ui::{ConsoleSink, Sink};
use self::stats::{run_stats_timer, StatsClock};

/// Process-wide server context, created by `init_server` and passed by
/// handle. Holds the only owners of the UI sink and the registry.
pub struct ServerCtx {
    pub sink: Arc<dyn Sink>,
    pub registry: Arc<TestRegistry>,
    pub clock: StatsClock,
    /// Opaque certificate blob echoed in every handshake ACK
    pub cert: Vec<u8>,
}

/// Build the server context. Order matters and is load-bearing: the UI sink
/// first, then the registry; `fini_server` tears down in inverse order.
pub fn init_server(show_ui: bool, cert: Vec<u8>) -> Arc<ServerCtx> {
    let sink: Arc<dyn Sink> = Arc::new(ConsoleSink::new(show_ui));
    let registry = Arc::new(TestRegistry::new());

    Arc::new(ServerCtx {
        sink,
        registry,
        clock: StatsClock::new(),
        cert,
    })
}

/// Tear down in inverse order of `init_server`: registry first, UI last.
pub fn fini_server(ctx: &ServerCtx) {
    ctx.registry.clear();
    ctx.sink.print_msg("Server stopped");
}

/// Bind both listeners, start the stats tick and UDP workers, and run the
/// TCP accept loop until shutdown. A bind failure is fatal and propagates.
pub async fn run_server(
    config: &Config,
    ctx: Arc<ServerCtx>,
    shutdown: CancellationToken,
) -> Result<()> {
    let stats_task = tokio::spawn(run_stats_timer(
        ctx.clock.clone(),
        ctx.registry.clone(),
        ctx.sink.clone(),
        shutdown.clone(),
    ));

    ctx.sink.print_msg(&format!(
        "Accepting IP version: {}",
        config.ip_version.as_str()
    ));
    ctx.sink.print_msg(&format!(
        "Listening on port {} for TCP & UDP",
        config.port
    ));

    let addr = config.listen_addr();

    let udp_socket = UdpSocket::bind(&addr)
        .await
        .with_context(|| format!("Error listening on {} for UDP tests", addr))?;
    udp::run_udp_server(ctx.clone(), udp_socket, shutdown.clone()).await;

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Error listening on {} for TCP tests", addr))?;
    tcp::run_tcp_server(ctx.clone(), listener, shutdown.clone()).await;

    let _ = stats_task.await;
    Ok(())
}
