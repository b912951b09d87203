use std::io;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::server::stats::LatencyPayload;
use crate::state::{ClientParams, Test};
use crate::ui::Sink;

/// Round-trip latency in `rtt_count`-sample ping-pong batches.
///
/// Per batch: read one client-sync frame, then alternate write/read pairs
/// timing each round trip, then publish the percentile summary. Runs until
/// an I/O error or cancellation ends the connection.
pub(crate) async fn serve_latency(
    test: &Test,
    params: &ClientParams,
    stream: &mut TcpStream,
    sink: &dyn Sink,
) -> io::Result<()> {
    let size = params.buffer_size as usize;
    let rtt_count = params.rtt_count.max(1) as usize;
    let mut buffer = vec![0u8; size];
    let mut samples = vec![Duration::ZERO; rtt_count];

    loop {
        // Client sync frame opens each batch
        tokio::select! {
            _ = test.done.cancelled() => return Ok(()),
            res = stream.read_exact(&mut buffer) => {
                res?;
            }
        }

        for slot in samples.iter_mut() {
            let t0 = Instant::now();
            stream.write_all(&buffer).await?;
            stream.read_exact(&mut buffer).await?;
            *slot = t0.elapsed();
        }

        let latency = latency_payload(&mut samples);
        test.result
            .latency
            .store(latency.avg.as_nanos() as u64, Ordering::Relaxed);
        test.touch();

        sink.emit_latency_results(test.remote_ip, &test.protocol.to_string(), &latency);
    }
}

/// Cut the percentile summary from one batch of samples (sorted in place).
///
/// Indexing is 1-based over the sample count; a single observation would
/// index below zero, so the divisor is inflated to two and every percentile
/// pins to that observation.
pub fn latency_payload(samples: &mut [Duration]) -> LatencyPayload {
    let n = samples.len();
    debug_assert!(n > 0, "latency batch cannot be empty");

    let sum: Duration = samples.iter().sum();
    let avg = Duration::from_nanos((sum.as_nanos() / n as u128) as u64);

    samples.sort();
    let nf = if n == 1 { 2 } else { n };

    LatencyPayload {
        avg,
        min: samples[0],
        max: samples[n - 1],
        p50: samples[nf * 50 / 100 - 1],
        p90: samples[nf * 90 / 100 - 1],
        p95: samples[nf * 95 / 100 - 1],
        p99: samples[nf * 99 / 100 - 1],
        p999: samples[((nf as f64 * 99.9 / 100.0) - 1.0) as usize],
        p9999: samples[((nf as f64 * 99.99 / 100.0) - 1.0) as usize],
        raw: samples.to_vec(),
    }
}
