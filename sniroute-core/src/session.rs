//! Per-connection routing: handshake inspection, resolution, the upstream
//! dial and the bidirectional splice.
//!
//! Nothing in here crosses session boundaries. A failing connection is
//! logged with its peer and hostname and dies alone.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::registry::ConnectionRegistry;
use crate::resolver::DnsCache;
use crate::sni::{self, HelloVerdict};

/// TLS port upstream connections are made to, matching what the client set
/// out to reach.
pub const UPSTREAM_PORT: u16 = 443;

/// Patience for the ClientHello to arrive and for the upstream dial.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK_SIZE: usize = 2048;
const SPLICE_BUFFER_SIZE: usize = 8192;

/// Drives accepted connections. Cloning shares the cache and the registry.
#[derive(Clone)]
pub struct SessionHandler {
    cache: DnsCache,
    registry: ConnectionRegistry,
    upstream_port: u16,
}

impl SessionHandler {
    pub fn new(cache: DnsCache, registry: ConnectionRegistry) -> Self {
        Self {
            cache,
            registry,
            upstream_port: UPSTREAM_PORT,
        }
    }

    /// Dial upstreams on a non-standard port.
    pub fn with_upstream_port(mut self, port: u16) -> Self {
        self.upstream_port = port;
        self
    }

    /// Drive one inbound connection to completion. Never fails outward:
    /// every error is logged and ends only this session.
    pub async fn handle_connection(&self, mut client: TcpStream, peer: SocketAddr) {
        let arrived = std::time::Instant::now();
        let _conn = match self.registry.register(peer) {
            Ok(guard) => Some(guard),
            Err(error) => {
                warn!(target: "tcp", %peer, %error, "connection not tracked");
                None
            }
        };

        if let Some((buffered, hostname)) = self.inspect_handshake(&mut client, peer).await {
            self.relay(client, peer, buffered, &hostname).await;
        }
        // A handshake that never produced a hostname was already logged;
        // dropping the socket closes it either way.
        debug!(
            target: "tcp",
            %peer,
            duration_secs = %arrived.elapsed().as_secs_f64(),
            "connection finished"
        );
    }

    /// Accumulate reads until the ClientHello yields a verdict. Returns the
    /// buffered bytes (owed to the upstream) and the hostname, or `None`
    /// when the connection is finished here.
    async fn inspect_handshake(
        &self,
        client: &mut TcpStream,
        peer: SocketAddr,
    ) -> Option<(Vec<u8>, String)> {
        let mut buf = Vec::with_capacity(1024);
        loop {
            match sni::inspect_client_hello(&buf) {
                Ok(HelloVerdict::Incomplete) => {}
                Ok(HelloVerdict::Found { hostname, consumed }) => {
                    debug!(target: "sni", %peer, hostname, consumed, "client hello inspected");
                    return Some((buf, hostname));
                }
                Ok(HelloVerdict::NoSni { .. }) => {
                    warn!(target: "sni", %peer, "(none)");
                    return None;
                }
                Err(error) => {
                    debug!(target: "sni", %peer, %error, "rejecting handshake");
                    return None;
                }
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match timeout(HANDSHAKE_TIMEOUT, client.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    debug!(target: "sni", %peer, "client disconnected before the handshake completed");
                    return None;
                }
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(error)) => {
                    debug!(target: "sni", %peer, %error, "read failed during handshake");
                    return None;
                }
                Err(_) => {
                    debug!(target: "sni", %peer, "timed out waiting for the client hello");
                    return None;
                }
            }
        }
    }

    async fn relay(&self, client: TcpStream, peer: SocketAddr, buffered: Vec<u8>, hostname: &str) {
        let addrs = match self.cache.resolve(hostname).await {
            Ok(addrs) => addrs,
            Err(error) => {
                warn!(target: "dns", %peer, hostname, %error, "resolve");
                return;
            }
        };
        // First address of the resolved set, no health checking and no
        // rotation.
        let Some(&ip) = addrs.first() else {
            warn!(target: "dns", %peer, hostname, "resolved to an empty set");
            return;
        };

        let upstream_addr = SocketAddr::new(IpAddr::V4(ip), self.upstream_port);
        debug!(target: "tcp", %peer, hostname, ?addrs, "connecting");
        let mut upstream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(upstream_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                warn!(target: "tcp", %peer, hostname, %upstream_addr, %error, "upstream connect failed");
                return;
            }
            Err(_) => {
                warn!(target: "tcp", %peer, hostname, %upstream_addr, "upstream connect timed out");
                return;
            }
        };

        // Handshake bytes already read belong to the upstream and go first,
        // before any later traffic.
        if let Err(error) = upstream.write_all(&buffered).await {
            warn!(target: "tcp", %peer, hostname, %error, "replaying client hello failed");
            return;
        }

        info!(target: "tcp", %peer, hostname, ip = %ip, "connected");
        match splice(client, upstream).await {
            Ok(()) => info!(target: "tcp", %peer, hostname, "session closed"),
            Err(error) => debug!(target: "tcp", %peer, hostname, %error, "session ended with error"),
        }
    }
}

/// Copy bytes both ways until either side reaches end-of-stream or fails.
/// The first direction to finish wins the select; both halves are dropped
/// together, closing the two sockets exactly once.
async fn splice<C, U>(client: C, upstream: U) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = io::split(client);
    let (mut upstream_read, mut upstream_write) = io::split(upstream);

    let client_to_upstream = async {
        let mut buf = [0u8; SPLICE_BUFFER_SIZE];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            upstream_write.write_all(&buf[..n]).await?;
        }
        Ok::<_, io::Error>(())
    };

    let upstream_to_client = async {
        let mut buf = [0u8; SPLICE_BUFFER_SIZE];
        loop {
            let n = upstream_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            client_write.write_all(&buf[..n]).await?;
        }
        Ok::<_, io::Error>(())
    };

    tokio::select! {
        result = client_to_upstream => result,
        result = upstream_to_client => result,
    }
}
