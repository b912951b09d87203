//! UI hook interface consumed by the server and trace loops.
//!
//! The full-screen results view lives outside this crate; everything here is
//! the producer side: headers, per-tick result rows, latency summaries and
//! the message/error rings a display layer splices from.

use chrono::Local;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;

use crate::server::stats::{LatencyPayload, ServerPayload};

/// Entries kept in each of the message and error rings
const RING_LEN: usize = 64;

/// Sink for everything the measurement loops want a human to see
pub trait Sink: Send + Sync {
    /// Announce the per-test results header. Called once per Test lifecycle
    /// (callers gate on registry `is_new`), so repeated emission is safe.
    fn emit_test_hdr(&self);

    /// Announce the latency results header
    fn emit_latency_hdr(&self);

    /// One latency batch worth of percentiles
    fn emit_latency_results(&self, remote: IpAddr, protocol: &str, latency: &LatencyPayload);

    /// One stats-tick row for an active test
    fn emit_test_results(&self, remote: IpAddr, protocol: &str, payload: &ServerPayload);

    fn print_msg(&self, msg: &str);
    fn print_dbg(&self, msg: &str);
    fn print_err(&self, msg: &str);
}

/// Plain-terminal sink: rows to stdout, diagnostics through `tracing`,
/// recent lines retained in rings for an attached display layer.
pub struct ConsoleSink {
    /// Suppress per-tick rows when the operator did not ask for them
    show_results: bool,
    msg_ring: RwLock<VecDeque<String>>,
    err_ring: RwLock<VecDeque<String>>,
}

impl ConsoleSink {
    pub fn new(show_results: bool) -> Self {
        Self {
            show_results,
            msg_ring: RwLock::new(VecDeque::with_capacity(RING_LEN)),
            err_ring: RwLock::new(VecDeque::with_capacity(RING_LEN)),
        }
    }

    /// Recent messages, oldest first
    pub fn recent_messages(&self) -> Vec<String> {
        self.msg_ring.read().iter().cloned().collect()
    }

    /// Recent errors, oldest first
    pub fn recent_errors(&self) -> Vec<String> {
        self.err_ring.read().iter().cloned().collect()
    }

    fn splice(ring: &RwLock<VecDeque<String>>, line: String) {
        // Writer side held only while splicing
        let mut ring = ring.write();
        if ring.len() == RING_LEN {
            ring.pop_front();
        }
        ring.push_back(line);
    }

    fn stamp(msg: &str) -> String {
        format!("{} {}", Local::now().format("%H:%M:%S"), msg)
    }
}

impl Sink for ConsoleSink {
    fn emit_test_hdr(&self) {
        if self.show_results {
            println!(
                "{:<24} {:>6} {:>10} {:>8} {:>8} {:>12}",
                "RemoteAddress", "Proto", "Bits/s", "Conn/s", "Pkts/s", "Avg Latency"
            );
        }
    }

    fn emit_latency_hdr(&self) {
        if self.show_results {
            println!(
                "{:<24} {:>6} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
                "RemoteAddress", "Proto", "Avg", "Min", "Max", "P50", "P90", "P95", "P99", "P99.9",
                "P99.99"
            );
        }
    }

    fn emit_latency_results(&self, remote: IpAddr, protocol: &str, latency: &LatencyPayload) {
        if self.show_results {
            println!(
                "{:<24} {:>6} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
                remote,
                protocol,
                duration_to_string(latency.avg),
                duration_to_string(latency.min),
                duration_to_string(latency.max),
                duration_to_string(latency.p50),
                duration_to_string(latency.p90),
                duration_to_string(latency.p95),
                duration_to_string(latency.p99),
                duration_to_string(latency.p999),
                duration_to_string(latency.p9999),
            );
        }
    }

    fn emit_test_results(&self, remote: IpAddr, protocol: &str, payload: &ServerPayload) {
        if self.show_results {
            println!(
                "{:<24} {:>6} {:>10} {:>8} {:>8} {:>12}",
                remote,
                protocol,
                bytes_to_rate(payload.bandwidth),
                number_to_unit(payload.connections_per_second),
                number_to_unit(payload.packets_per_second),
                duration_to_string(payload.latency.avg),
            );
        }
    }

    fn print_msg(&self, msg: &str) {
        tracing::info!("{}", msg);
        Self::splice(&self.msg_ring, Self::stamp(msg));
    }

    fn print_dbg(&self, msg: &str) {
        tracing::debug!("{}", msg);
    }

    fn print_err(&self, msg: &str) {
        tracing::error!("{}", msg);
        Self::splice(&self.err_ring, Self::stamp(msg));
    }
}

/// Format a byte counter as a bit rate ("14.40Kbps")
pub fn bytes_to_rate(bytes: u64) -> String {
    format!("{}bps", number_to_unit(bytes.saturating_mul(8)))
}

/// Format a plain number with K/M/G/T units (decimal, like link rates)
pub fn number_to_unit(num: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (1_000_000_000_000, "T"),
        (1_000_000_000, "G"),
        (1_000_000, "M"),
        (1_000, "K"),
    ];

    for (scale, suffix) in UNITS {
        if num >= scale {
            return format!("{:.2}{}", num as f64 / scale as f64, suffix);
        }
    }
    num.to_string()
}

/// Format a duration at display precision ("1.25ms", "870us")
pub fn duration_to_string(d: Duration) -> String {
    if d == Duration::ZERO {
        return "0".to_string();
    }
    let nanos = d.as_nanos();
    if nanos < 1_000 {
        format!("{}ns", nanos)
    } else if nanos < 1_000_000 {
        format!("{:.2}us", nanos as f64 / 1_000.0)
    } else if nanos < 1_000_000_000 {
        format!("{:.2}ms", nanos as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}
