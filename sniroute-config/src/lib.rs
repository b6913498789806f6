use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Listen port when `PORT` is not set.
pub const DEFAULT_PORT: u16 = 443;
/// Drain timeout in milliseconds when `SHUTDOWN_GRACE` is not set.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
/// Resolution TTL in milliseconds when `DNS_CACHE` is not set.
pub const DEFAULT_DNS_CACHE_MS: u64 = 3_600_000;

const DNS_PORT: u16 = 53;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid resolver address {0:?}")]
    InvalidDnsServer(String),
    #[error("unknown log level {0:?}, expected trace, debug, info, warn or error")]
    InvalidLogLevel(String),
}

/// Router configuration.
///
/// Every option maps to one environment variable: `PORT`, `DNS`,
/// `SHUTDOWN_GRACE`, `DNS_CACHE` and `LOG_LEVEL`.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the listener binds on all interfaces.
    pub port: u16,
    /// Upstream DNS servers; empty means the system resolver configuration.
    pub dns_servers: Vec<SocketAddr>,
    /// How long live connections may drain after the termination signal.
    pub shutdown_grace: Duration,
    /// How long a cached resolution stays valid.
    pub dns_cache_ttl: Duration,
    /// Severity applied to the dns, tcp and sni log streams.
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            dns_servers: Vec::new(),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            dns_cache_ttl: Duration::from_millis(DEFAULT_DNS_CACHE_MS),
            log_level: LogLevel::default(),
        }
    }
}

/// Severity for the three log streams. The set is fixed at startup; there is
/// no runtime level switching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Name understood by tracing filter directives.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::InvalidLogLevel(s.to_string())),
        }
    }
}

/// Comma-separated resolver list from the `DNS` option.
///
/// Elements are `ip` or `ip:port`; bare addresses get the standard DNS port.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DnsServers(pub Vec<SocketAddr>);

impl FromStr for DnsServers {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|element| !element.is_empty())
            .map(parse_dns_server)
            .collect::<Result<Vec<_>, _>>()
            .map(DnsServers)
    }
}

fn parse_dns_server(element: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = SocketAddr::from_str(element) {
        return Ok(addr);
    }
    if let Ok(ip) = IpAddr::from_str(element) {
        return Ok(SocketAddr::new(ip, DNS_PORT));
    }
    Err(ConfigError::InvalidDnsServer(element.to_string()))
}
