use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cli::Args;

/// Accepted IP version policy for the listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
    #[default]
    Both,
}

impl IpVersion {
    /// Human form used in the startup banner
    pub fn as_str(&self) -> &'static str {
        match self {
            IpVersion::V4 => "ipv4",
            IpVersion::V6 => "ipv6",
            IpVersion::Both => "ipv4, ipv6",
        }
    }

    /// Wildcard bind address for this policy
    pub fn default_host(&self) -> &'static str {
        match self {
            IpVersion::V4 => "0.0.0.0",
            // The v6 wildcard also accepts v4-mapped peers where the OS allows it
            IpVersion::V6 | IpVersion::Both => "::",
        }
    }
}

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port shared by the TCP and UDP listeners
    pub port: u16,
    /// Explicit bind address (None = wildcard for the IP version)
    pub host: Option<String>,
    /// IP version policy
    pub ip_version: IpVersion,
    /// Show live per-test results in server mode
    pub show_ui: bool,
    /// Maximum TTL probed during hop discovery
    pub max_hops: u8,
    /// Minimum period between re-probes of the same hop
    #[serde(with = "duration_serde")]
    pub gap: Duration,
    /// Continuous per-hop re-probing after discovery
    pub mtr: bool,
    /// Base local port for traceroute probes (None = default base)
    pub local_port: Option<u16>,
    /// Reverse DNS enabled for discovered hops
    pub dns_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8888,
            host: None,
            ip_version: IpVersion::Both,
            show_ui: false,
            max_hops: 30,
            gap: Duration::from_secs(1),
            mtr: false,
            local_port: None,
            dns_enabled: true,
        }
    }
}

impl Config {
    /// The address:port string the server listeners bind
    pub fn listen_addr(&self) -> String {
        let host = self
            .host
            .as_deref()
            .unwrap_or_else(|| self.ip_version.default_host());
        if host.contains(':') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        let ip_version = if args.ipv4 {
            IpVersion::V4
        } else if args.ipv6 {
            IpVersion::V6
        } else {
            IpVersion::Both
        };

        Self {
            port: args.port,
            host: args.host.clone(),
            ip_version,
            show_ui: args.show_ui,
            max_hops: args.max_hops,
            gap: args.gap_duration(),
            mtr: args.mtr,
            local_port: args.local_port,
            dns_enabled: !args.no_dns,
        }
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
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr_wildcards() {
        let mut config = Config::default();
        assert_eq!(config.listen_addr(), "[::]:8888");

        config.ip_version = IpVersion::V4;
        assert_eq!(config.listen_addr(), "0.0.0.0:8888");
    }

    #[test]
    fn test_listen_addr_explicit_host() {
        let config = Config {
            host: Some("10.1.2.3".to_string()),
            port: 9999,
            ..Config::default()
        };
        assert_eq!(config.listen_addr(), "10.1.2.3:9999");

        let config = Config {
            host: Some("fd00::1".to_string()),
            ..Config::default()
        };
        assert_eq!(config.listen_addr(), "[fd00::1]:8888");
    }
}
