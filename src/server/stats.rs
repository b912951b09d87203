//! Stats tick: the server's reporting clock and the per-tick payloads
//! consumed by the results view.

use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::state::TestRegistry;
use crate::ui::Sink;

/// Latency summary of one ping-pong batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPayload {
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub p999: Duration,
    pub p9999: Duration,
    /// Sorted samples the percentiles were cut from
    pub raw: Vec<Duration>,
}

/// Per-tick aggregate for one test, produced by the stats ticker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerPayload {
    /// Bytes moved since the previous tick
    pub bandwidth: u64,
    pub connections_per_second: u64,
    pub packets_per_second: u64,
    pub latency: LatencyPayload,
}

/// The server's reporting clock. Ticks fall on whole seconds from the
/// process stats epoch; the ACK's delay field lets clients align their
/// sampling intervals to it.
#[derive(Debug, Clone)]
pub struct StatsClock {
    epoch: Instant,
}

impl StatsClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Delay until the next tick boundary (always in (0, 1s])
    pub fn time_to_next_tick(&self) -> Duration {
        let elapsed = self.epoch.elapsed();
        Duration::from_secs(elapsed.as_secs() + 1) - elapsed
    }
}

impl Default for StatsClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain the rate counters of every registered test and publish a payload
/// row for the active ones. Runs until `stop` fires.
pub async fn run_stats_timer(
    clock: StatsClock,
    registry: Arc<TestRegistry>,
    sink: Arc<dyn Sink>,
    stop: CancellationToken,
) {
    let start = tokio::time::Instant::now() + clock.time_to_next_tick();
    let mut ticks = tokio::time::interval_at(start, Duration::from_secs(1));
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticks.tick() => {
                for test in registry.snapshot() {
                    let payload = ServerPayload {
                        bandwidth: test.result.bw.swap(0, Ordering::Relaxed),
                        connections_per_second: test.result.cps.swap(0, Ordering::Relaxed),
                        packets_per_second: test.result.pps.swap(0, Ordering::Relaxed),
                        latency: LatencyPayload {
                            avg: Duration::from_nanos(test.result.latency.load(Ordering::Relaxed)),
                            ..LatencyPayload::default()
                        },
                    };
                    test.set_latest(payload.clone());

                    if test.is_active() {
                        sink.emit_test_results(test.remote_ip, &test.protocol.to_string(), &payload);
                    }
                }
            }
        }
    }
}
