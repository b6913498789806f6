//! Hostname resolution with a TTL'd, single-flight cache.
//!
//! Concurrent lookups for the same hostname collapse into one upstream
//! query; every waiter receives the same result. Failures are handed back
//! but never cached, so a later request retries on its own.

use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use lru::LruCache;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// Upper bound on cached hostnames; least-recently-used entries are evicted
/// beyond this.
const CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(1000).unwrap();

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("no A records for {0}")]
    NoAddresses(String),
    #[error("lookup failed: {0}")]
    Lookup(Arc<hickory_resolver::error::ResolveError>),
    #[error("resolution abandoned before a result arrived")]
    Abandoned,
}

/// DNS A-record lookup primitive, kept behind a trait so the cache can be
/// exercised against scripted resolvers.
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    async fn lookup_v4(&self, hostname: &str) -> Result<Vec<Ipv4Addr>, ResolveError>;
}

/// Production resolver: system configuration by default, explicit UDP
/// nameservers when the `DNS` option supplies them.
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn new(servers: &[SocketAddr]) -> Result<Self, ResolveError> {
        let inner = if servers.is_empty() {
            TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| ResolveError::Lookup(Arc::new(e)))?
        } else {
            let mut config = ResolverConfig::new();
            for server in servers {
                config.add_name_server(NameServerConfig::new(*server, Protocol::Udp));
            }
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        };
        Ok(Self { inner })
    }
}

#[async_trait]
impl Resolve for HickoryResolver {
    async fn lookup_v4(&self, hostname: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
        let lookup = self
            .inner
            .ipv4_lookup(hostname)
            .await
            .map_err(|e| ResolveError::Lookup(Arc::new(e)))?;
        let addrs: Vec<Ipv4Addr> = lookup.iter().map(|a| a.0).collect();
        if addrs.is_empty() {
            return Err(ResolveError::NoAddresses(hostname.to_string()));
        }
        Ok(addrs)
    }
}

struct CacheEntry {
    addrs: Vec<Ipv4Addr>,
    fetched_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() > ttl
    }
}

type Outcome = Result<Vec<Ipv4Addr>, ResolveError>;

/// Shared resolution cache. Cloning is cheap; all clones observe the same
/// entries and in-flight queries.
#[derive(Clone)]
pub struct DnsCache {
    resolver: Arc<dyn Resolve>,
    entries: Arc<Mutex<LruCache<String, CacheEntry>>>,
    inflight: Arc<DashMap<String, broadcast::Sender<Outcome>>>,
    ttl: Duration,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn Resolve>, ttl: Duration) -> Self {
        Self::with_capacity(resolver, ttl, CACHE_CAPACITY)
    }

    fn with_capacity(resolver: Arc<dyn Resolve>, ttl: Duration, capacity: NonZeroUsize) -> Self {
        Self {
            resolver,
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            inflight: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Resolve through the cache. An unexpired entry returns immediately;
    /// otherwise exactly one upstream query runs per hostname, shared by
    /// every concurrent caller.
    pub async fn resolve(&self, hostname: &str) -> Outcome {
        if let Some(addrs) = self.cached(hostname) {
            return Ok(addrs);
        }

        // First caller in creates the channel and owns the lookup; everyone
        // else subscribes to its result.
        let mut rx = match self.inflight.entry(hostname.to_string()) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(slot) => {
                let (tx, rx) = broadcast::channel(1);
                slot.insert(tx.clone());
                self.spawn_lookup(hostname.to_string(), tx);
                rx
            }
        };
        match rx.recv().await {
            Ok(outcome) => outcome,
            Err(_) => Err(ResolveError::Abandoned),
        }
    }

    /// The lookup runs in its own task so a caller that goes away cannot
    /// strand the other waiters.
    fn spawn_lookup(&self, hostname: String, tx: broadcast::Sender<Outcome>) {
        let cache = self.clone();
        tokio::spawn(async move {
            let outcome = match cache.cached(&hostname) {
                // A previous flight finished between our cache miss and the
                // in-flight registration.
                Some(addrs) => Ok(addrs),
                None => {
                    debug!(target: "dns", hostname, "looking up A");
                    let outcome = cache.resolver.lookup_v4(&hostname).await;
                    if let Ok(addrs) = &outcome {
                        cache.store(&hostname, addrs.clone());
                    }
                    outcome
                }
            };
            cache.inflight.remove(&hostname);
            let _ = tx.send(outcome);
        });
    }

    fn cached(&self, hostname: &str) -> Option<Vec<Ipv4Addr>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(hostname) {
            Some(entry) if !entry.is_expired(self.ttl) => Some(entry.addrs.clone()),
            Some(_) => {
                // Expired entries are treated as absent and re-fetched.
                entries.pop(hostname);
                None
            }
            None => None,
        }
    }

    fn store(&self, hostname: &str, addrs: Vec<Ipv4Addr>) {
        let mut entries = self.entries.lock().unwrap();
        entries.put(
            hostname.to_string(),
            CacheEntry {
                addrs,
                fetched_at: Instant::now(),
            },
        );
    }
}
