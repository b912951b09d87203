use anyhow::{Context, Result};
use clap::Parser;
use scopeguard::defer;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use netgauge::cli::Args;
use netgauge::config::Config;
use netgauge::error::{ProbeError, TraceError};
use netgauge::lookup::DnsLookup;
use netgauge::probe::permissions_hint;
use netgauge::server::{fini_server, init_server, run_server};
use netgauge::state::{HopData, Protocol, Test, TestKind};
use netgauge::trace::{discover_hops, new_hop_table, spawn_mtr_loops, HopTable, Prober};
use netgauge::ui::{duration_to_string, ConsoleSink, Sink};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    init_tracing();
    let config = Config::from(&args);

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    if args.server {
        run_server_mode(&args, &config, cancel).await
    } else {
        run_trace_mode(&args, &config, cancel).await
    }
}

async fn run_server_mode(args: &Args, config: &Config, cancel: CancellationToken) -> Result<()> {
    let cert = match &args.cert {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("Failed to read certificate blob: {}", path))?,
        None => Vec::new(),
    };

    let ctx = init_server(config.show_ui, cert);
    println!("-----------------------------------------------------------");

    let result = run_server(config, ctx.clone(), cancel).await;

    // The UI is finalised before a fatal listen error takes the process down
    fini_server(&ctx);
    if let Err(e) = result {
        eprintln!("Fatal error running server: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_trace_mode(args: &Args, config: &Config, cancel: CancellationToken) -> Result<()> {
    let target_str = args.target.as_deref().context("target host is required")?;
    let remote_ip = resolve_target(target_str, args.ipv4, args.ipv6)
        .with_context(|| format!("Failed to resolve target: {}", target_str))?;

    let sink: Arc<dyn Sink> = Arc::new(ConsoleSink::new(false));
    let dns = config.dns_enabled.then(DnsLookup::new);

    let test = Arc::new(Test::client(
        remote_ip,
        config.port,
        Protocol::Tcp,
        TestKind::TraceRoute,
    ));
    // Whatever path leaves this function, background probe loops get stopped
    let done_guard = test.clone();
    defer! {
        done_guard.done.cancel();
    }

    let prober = Prober::new(remote_ip, config.local_port);
    println!(
        "Tracing route to {} ({}) over {} hops max",
        target_str, remote_ip, config.max_hops
    );

    let hops = match discover_hops(
        &prober,
        &test,
        config.max_hops,
        dns.as_ref(),
        sink.as_ref(),
    )
    .await
    {
        Ok(hops) => hops,
        Err(TraceError::Probe(ProbeError::TransportUnavailable(_))) => {
            eprintln!("{}", permissions_hint());
            std::process::exit(1);
        }
        Err(err) => {
            print_hop_report(err.partial_hops());
            anyhow::bail!(
                "destination ({}) not responding to TCP connection",
                remote_ip
            );
        }
    };

    print_hop_report(&hops);

    if config.mtr {
        let table = new_hop_table(hops);
        let handles = spawn_mtr_loops(prober, test.clone(), config.gap, table.clone());

        // Print a rolling summary until interrupted
        let mut ticks = tokio::time::interval(config.gap.max(Duration::from_secs(1)));
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => print_mtr_report(&table),
            }
        }

        test.done.cancel();
        for handle in handles {
            let _ = handle.await;
        }
    }

    Ok(())
}

fn resolve_target(target: &str, force_ipv4: bool, force_ipv6: bool) -> Result<IpAddr> {
    // Try parsing as IP address first
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }

    // Resolve hostname
    let addrs: Vec<_> = format!("{}:0", target)
        .to_socket_addrs()?
        .map(|s| s.ip())
        .collect();

    if addrs.is_empty() {
        anyhow::bail!("No addresses found for hostname");
    }

    // Filter by IP version if requested
    let filtered: Vec<_> = addrs
        .iter()
        .filter(|ip| {
            if force_ipv4 {
                ip.is_ipv4()
            } else if force_ipv6 {
                ip.is_ipv6()
            } else {
                true
            }
        })
        .cloned()
        .collect();

    if filtered.is_empty() {
        anyhow::bail!(
            "No {} addresses found",
            if force_ipv4 { "IPv4" } else { "IPv6" }
        );
    }

    // Prefer IPv4 by default if no preference
    if !force_ipv6 {
        if let Some(ipv4) = filtered.iter().find(|ip| ip.is_ipv4()) {
            return Ok(*ipv4);
        }
    }

    Ok(filtered[0])
}

fn print_hop_report(hops: &[HopData]) {
    for (index, hop) in hops.iter().enumerate() {
        if hop.addr.is_some() {
            println!(
                "{:2}.|--{:<46} {:>10}",
                index + 1,
                format!(
                    "{} [{}]",
                    hop.addr_str(),
                    hop.full_name.as_deref().unwrap_or("")
                ),
                duration_to_string(hop.last)
            );
        } else {
            println!("{:2}.|--{}", index + 1, "???");
        }
    }
}

fn print_mtr_report(table: &HopTable) {
    println!(
        "{:>3} {:<20} {:>6} {:>6} {:>6} {:>10} {:>10} {:>10} {:>10}",
        "Hop", "Address", "Loss%", "Sent", "Rcvd", "Last", "Avg", "Best", "Worst"
    );
    for (index, hop) in table.read().iter().enumerate() {
        println!(
            "{:>3} {:<20} {:>5.1}% {:>6} {:>6} {:>10} {:>10} {:>10} {:>10}",
            index + 1,
            hop.name.clone().unwrap_or_else(|| hop.addr_str()),
            hop.loss_pct(),
            hop.sent,
            hop.rcvd,
            duration_to_string(hop.last),
            duration_to_string(hop.avg()),
            duration_to_string(if hop.best == Duration::MAX {
                Duration::ZERO
            } else {
                hop.best
            }),
            duration_to_string(hop.worst),
        );
    }
    println!("---");
}
