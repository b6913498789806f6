//! Transport-layer passthrough routing for TLS connections.
//!
//! Accepted connections have their ClientHello inspected for a server name,
//! the name is resolved through a TTL'd cache, and the connection is spliced
//! to `resolved:443` with the encrypted stream flowing through untouched.

pub mod registry;
pub mod resolver;
pub mod session;
pub mod shutdown;
pub mod sni;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use registry::{ConnectionRegistry, RegistryError};
use resolver::{DnsCache, HickoryResolver};
use session::SessionHandler;
use shutdown::{Coordinator, DrainOutcome};
use sniroute_config::Config;

/// Bind the listener and route connections until a termination signal
/// arrives, then drain live sessions within the configured grace period.
pub async fn run_proxy(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let resolver = HickoryResolver::new(&config.dns_servers)?;
    let cache = DnsCache::new(Arc::new(resolver), config.dns_cache_ttl);
    let registry = ConnectionRegistry::new();
    let handler = SessionHandler::new(cache, registry.clone());

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(target: "tcp", port = config.port, "started listening");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!(target: "tcp", "received shutdown signal");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle_connection(socket, peer).await;
                        });
                    }
                    Err(error) => {
                        error!(target: "tcp", %error, "accept failed");
                    }
                }
            }
        }
    }

    // New connections stop here; whatever is in flight gets the grace
    // period.
    drop(listener);
    let mut coordinator = Coordinator::new(registry, config.shutdown_grace);
    match coordinator.drain().await {
        DrainOutcome::Clean => info!(target: "tcp", "drained, exiting"),
        DrainOutcome::Forced => info!(target: "tcp", "grace expired, exiting with sessions open"),
        DrainOutcome::Aborted => return Err(Box::new(RegistryError)),
    }
    Ok(())
}
