use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::state::{HopData, Test};
use crate::trace::probe::Prober;

/// Hop list shared between the MTR loops and whatever displays it
pub type HopTable = Arc<RwLock<Vec<HopData>>>;

pub fn new_hop_table(hops: Vec<HopData>) -> HopTable {
    Arc::new(RwLock::new(hops))
}

/// Start one background re-probe loop per discovered hop. Silent hops are
/// skipped: there is no address to gate the probe to.
pub fn spawn_mtr_loops(
    prober: Prober,
    test: Arc<Test>,
    gap: Duration,
    hops: HopTable,
) -> Vec<JoinHandle<()>> {
    let count = hops.read().len();
    let mut handles = Vec::with_capacity(count);

    for index in 0..count {
        if hops.read()[index].addr.is_none() {
            continue;
        }
        handles.push(tokio::spawn(probe_hop_loop(
            prober,
            test.clone(),
            gap,
            index,
            hops.clone(),
        )));
    }

    handles
}

/// Re-probe one hop forever, keeping the iteration period at least `gap`.
/// Ends when the test's Done signal fires.
async fn probe_hop_loop(prober: Prober, test: Arc<Test>, gap: Duration, index: usize, hops: HopTable) {
    let mut seq: u64 = 0;

    loop {
        if test.done.is_cancelled() {
            return;
        }

        let t0 = Instant::now();
        let mut hop_data = { hops.read()[index].clone() };
        // Gate to the discovered router so only its ICMP updates the
        // aggregate. The address is sticky: a run of losses never decays it.
        let expected = hop_data.addr;

        // Per-probe errors are already folded into the loss counters
        let _ = prober
            .probe_hop(&test, (index + 1) as u8, expected, &mut hop_data)
            .await;
        hops.write()[index] = hop_data;

        seq += 1;
        tracing::trace!(hop = index + 1, seq, "mtr probe round");

        let elapsed = t0.elapsed();
        if elapsed < gap {
            tokio::select! {
                _ = test.done.cancelled() => return,
                _ = tokio::time::sleep(gap - elapsed) => {}
            }
        }
    }
}
