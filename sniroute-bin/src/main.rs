use std::time::Duration;

use clap::Parser;
use sniroute_bin::run;
use sniroute_config::{Config, DnsServers, LogLevel};

/// TLS passthrough router: splices connections to the host named by SNI
/// without terminating TLS.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen port
    #[arg(long, env = "PORT", default_value_t = sniroute_config::DEFAULT_PORT)]
    port: u16,

    /// Comma-separated upstream DNS servers (defaults to the system
    /// resolvers)
    #[arg(long, env = "DNS")]
    dns: Option<DnsServers>,

    /// Drain timeout on shutdown, in milliseconds
    #[arg(long, env = "SHUTDOWN_GRACE", default_value_t = sniroute_config::DEFAULT_SHUTDOWN_GRACE_MS)]
    shutdown_grace: u64,

    /// Cache lifetime for resolved hostnames, in milliseconds
    #[arg(long, env = "DNS_CACHE", default_value_t = sniroute_config::DEFAULT_DNS_CACHE_MS)]
    dns_cache: u64,

    /// Severity for the dns, tcp and sni log streams
    #[arg(long, env = "LOG_LEVEL", default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config {
        port: args.port,
        dns_servers: args.dns.unwrap_or_default().0,
        shutdown_grace: Duration::from_millis(args.shutdown_grace),
        dns_cache_ttl: Duration::from_millis(args.dns_cache),
        log_level: args.log_level,
    };
    run(config).await
}
