use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Per-TTL aggregate over repeated traceroute probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopData {
    /// Responding router (None = unknown / silent hop)
    pub addr: Option<IpAddr>,
    /// Reverse-DNS name truncated for display
    pub name: Option<String>,
    /// Untruncated reverse-DNS name
    pub full_name: Option<String>,

    // Counters
    pub sent: u64,
    pub rcvd: u64,
    pub lost: u64,

    // Latency aggregates
    #[serde(with = "duration_serde")]
    pub last: Duration,
    #[serde(with = "duration_serde")]
    pub best: Duration,
    #[serde(with = "duration_serde")]
    pub worst: Duration,
    #[serde(with = "duration_serde")]
    pub total: Duration,
}

impl Default for HopData {
    fn default() -> Self {
        Self {
            addr: None,
            name: None,
            full_name: None,
            sent: 0,
            rcvd: 0,
            lost: 0,
            last: Duration::ZERO,
            // Initialised so the first observation wins
            best: Duration::MAX,
            worst: Duration::ZERO,
            total: Duration::ZERO,
        }
    }
}

impl HopData {
    /// Fold one successful probe observation into the aggregate.
    ///
    /// Associative over probe order: aggregating N observations in any order
    /// yields the same best/worst/total/rcvd.
    pub fn record(&mut self, peer: IpAddr, elapsed: Duration) {
        self.addr = Some(peer);
        self.last = elapsed;
        if self.best > elapsed {
            self.best = elapsed;
        }
        if self.worst < elapsed {
            self.worst = elapsed;
        }
        self.total += elapsed;
        self.rcvd += 1;
    }

    /// Mean round-trip over received probes
    pub fn avg(&self) -> Duration {
        if self.rcvd == 0 {
            Duration::ZERO
        } else {
            self.total / self.rcvd as u32
        }
    }

    /// Loss percentage over sent probes
    pub fn loss_pct(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            (self.lost as f64 / self.sent as f64) * 100.0
        }
    }

    /// Display form of the hop address ("???" for silent hops)
    pub fn addr_str(&self) -> String {
        match self.addr {
            Some(ip) => ip.to_string(),
            None => "???".to_string(),
        }
    }
}

/// Ordered hop list produced by discovery and updated by the MTR loops
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceRoutePayload {
    pub hops: Vec<HopData>,
}

impl TraceRoutePayload {
    /// True when the last entry is the destination itself
    pub fn completed(&self, destination: IpAddr) -> bool {
        self.hops
            .last()
            .is_some_and(|h| h.addr == Some(destination))
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_micros().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = u128::deserialize(deserializer)?;
        Ok(Duration::from_micros(micros as u64))
    }
}
