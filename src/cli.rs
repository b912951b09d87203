use clap::Parser;
use std::time::Duration;

/// Network performance measurement: bandwidth/latency/CPS/PPS server and
/// TCP traceroute/MTR client
#[derive(Parser, Debug, Clone)]
#[command(name = "netgauge")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Run in server mode (accept measurement tests on TCP & UDP)
    #[arg(short = 's', long = "server")]
    pub server: bool,

    /// Destination host for client mode (IP address or hostname)
    pub target: Option<String>,

    /// Port to listen on (server) or to probe toward (client)
    #[arg(short = 'p', long = "port", default_value = "8888")]
    pub port: u16,

    /// Address to bind in server mode (default chosen by IP version)
    #[arg(long = "host")]
    pub host: Option<String>,

    /// Force IPv4
    #[arg(short = '4', long = "ipv4")]
    pub ipv4: bool,

    /// Force IPv6
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,

    /// Show live per-test results (server mode)
    #[arg(long = "ui")]
    pub show_ui: bool,

    /// Maximum TTL (hops) probed during discovery
    #[arg(short = 'm', long = "max-hops", default_value = "30")]
    pub max_hops: u8,

    /// Minimum seconds between re-probes of the same hop
    #[arg(short = 'g', long = "gap", default_value = "1.0")]
    pub gap: f64,

    /// Keep re-probing discovered hops for per-hop latency (MTR mode)
    #[arg(long = "mtr")]
    pub mtr: bool,

    /// Base local port for traceroute probes (TTL is added per hop)
    #[arg(long = "local-port")]
    pub local_port: Option<u16>,

    /// File whose bytes are echoed as the certificate blob in handshake ACKs
    #[arg(long = "cert")]
    pub cert: Option<String>,

    /// Skip reverse DNS lookups for discovered hops
    #[arg(long = "no-dns")]
    pub no_dns: bool,
}

impl Args {
    /// Get hop re-probe gap as Duration
    pub fn gap_duration(&self) -> Duration {
        Duration::from_secs_f64(self.gap)
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if !self.server && self.target.is_none() {
            return Err("A target host is required unless --server is set".into());
        }

        if self.server && self.target.is_some() {
            return Err("--server does not take a target host".into());
        }

        if self.ipv4 && self.ipv6 {
            return Err("Cannot specify both -4 and -6".into());
        }

        if self.max_hops == 0 {
            return Err("Max hops must be at least 1".into());
        }

        // Upper bound to prevent resource exhaustion (MTR spawns one loop per hop)
        const MAX_SAFE_HOPS: u8 = 64;
        if self.max_hops > MAX_SAFE_HOPS {
            return Err(format!("Max hops cannot exceed {}", MAX_SAFE_HOPS));
        }

        if self.gap <= 0.0 {
            return Err("Gap must be positive".into());
        }

        if self.mtr && self.server {
            return Err("--mtr is a client-mode option".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["netgauge", "example.com"])
    }

    #[test]
    fn test_client_requires_target() {
        let args = Args::parse_from(["netgauge", "--port", "8888"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_server_rejects_target() {
        let args = Args::parse_from(["netgauge", "--server", "example.com"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_defaults_valid() {
        assert!(base_args().validate().is_ok());
    }

    #[test]
    fn test_ip_version_conflict() {
        let mut args = base_args();
        args.ipv4 = true;
        args.ipv6 = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_max_hops_bounds() {
        let mut args = base_args();
        args.max_hops = 0;
        assert!(args.validate().is_err());
        args.max_hops = 65;
        assert!(args.validate().is_err());
        args.max_hops = 64;
        assert!(args.validate().is_ok());
    }
}
