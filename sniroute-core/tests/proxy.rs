//! Loopback end-to-end tests: a real listener in front of the session
//! handler, a scripted resolver pointing at 127.0.0.1, and a captive
//! upstream that records what arrives.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use sniroute_core::registry::ConnectionRegistry;
use sniroute_core::resolver::{DnsCache, Resolve, ResolveError};
use sniroute_core::session::SessionHandler;

const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolves every hostname to 127.0.0.1.
struct Loopback;

#[async_trait]
impl Resolve for Loopback {
    async fn lookup_v4(&self, _hostname: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
        Ok(vec![Ipv4Addr::LOCALHOST])
    }
}

/// Refuses every hostname.
struct Unresolvable;

#[async_trait]
impl Resolve for Unresolvable {
    async fn lookup_v4(&self, hostname: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
        Err(ResolveError::NoAddresses(hostname.to_string()))
    }
}

/// Complete TLS ClientHello record; `domain: None` omits the extensions
/// block entirely.
fn build_client_hello(domain: Option<&str>) -> Vec<u8> {
    let extensions = domain.map(|domain| {
        let domain_len = domain.len() as u16;
        let sni_list_len = 3 + domain_len;
        let sni_ext_len = 2 + sni_list_len;
        let mut ext = vec![
            0x00,
            0x00,
            (sni_ext_len >> 8) as u8,
            (sni_ext_len & 0xff) as u8,
            (sni_list_len >> 8) as u8,
            (sni_list_len & 0xff) as u8,
            0x00,
            (domain_len >> 8) as u8,
            (domain_len & 0xff) as u8,
        ];
        ext.extend_from_slice(domain.as_bytes());
        ext
    });

    let extensions_block_len = extensions.as_ref().map_or(0, |e| 2 + e.len());
    let handshake_len = 2 + 32 + 1 + 2 + 2 + 2 + extensions_block_len;
    let record_len = 4 + handshake_len;

    let mut record = vec![
        0x16,
        0x03,
        0x03,
        (record_len >> 8) as u8,
        (record_len & 0xff) as u8,
        0x01,
        (handshake_len >> 16) as u8,
        (handshake_len >> 8) as u8,
        (handshake_len & 0xff) as u8,
        0x03,
        0x03,
    ];
    record.extend_from_slice(&[0; 32]);
    record.extend_from_slice(&[0x00, 0x00, 0x02, 0x00, 0x00, 0x01, 0x00]);
    if let Some(ext) = extensions {
        let extensions_len = ext.len() as u16;
        record.push((extensions_len >> 8) as u8);
        record.push((extensions_len & 0xff) as u8);
        record.extend_from_slice(&ext);
    }
    record
}

/// Accepts connections and hands them to a handler wired to the given
/// resolver and upstream port. Returns the address clients dial.
async fn start_router(resolver: Arc<dyn Resolve>, upstream_port: u16) -> SocketAddr {
    let cache = DnsCache::new(resolver, Duration::from_secs(3600));
    let handler = SessionHandler::new(cache, ConnectionRegistry::new())
        .with_upstream_port(upstream_port);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, peer)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler.handle_connection(socket, peer).await;
            });
        }
    });
    addr
}

/// One-shot upstream that records everything it receives, then echoes a
/// fixed reply and holds the socket open until the peer closes.
async fn start_recording_upstream(reply: &'static [u8]) -> (u16, Arc<tokio::sync::Mutex<Vec<u8>>>) {
    let received = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let received_clone = received.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            stream.write_all(reply).await.unwrap();
            let mut buf = [0u8; 4096];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                received_clone.lock().await.extend_from_slice(&buf[..n]);
            }
        }
    });
    (port, received)
}

/// Counts accepted connections without reading from them.
async fn start_counting_upstream() -> (u16, Arc<AtomicUsize>) {
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_clone = accepted.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((_stream, _)) = listener.accept().await {
            accepted_clone.fetch_add(1, Ordering::SeqCst);
        }
    });
    (port, accepted)
}

#[tokio::test]
async fn test_client_hello_and_later_bytes_reach_the_upstream_in_order() {
    let (upstream_port, received) = start_recording_upstream(b"reply-from-upstream").await;
    let router = start_router(Arc::new(Loopback), upstream_port).await;

    let hello = build_client_hello(Some("example.com"));
    let mut client = TcpStream::connect(router).await.unwrap();

    // Split the handshake across two deliveries to exercise accumulation.
    let (first, rest) = hello.split_at(hello.len() / 2);
    client.write_all(first).await.unwrap();
    sleep(Duration::from_millis(20)).await;
    client.write_all(rest).await.unwrap();
    client.write_all(b"encrypted application bytes").await.unwrap();

    // The upstream's reply makes it back through the splice.
    let mut reply = [0u8; 19];
    timeout(TEST_TIMEOUT, client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"reply-from-upstream");

    // Closing the client closes the upstream side; the recorder drains.
    drop(client);
    sleep(Duration::from_millis(100)).await;

    let mut expected = hello.clone();
    expected.extend_from_slice(b"encrypted application bytes");
    assert_eq!(*received.lock().await, expected);
}

#[tokio::test]
async fn test_hello_without_sni_is_closed_with_no_upstream_dial() {
    let (upstream_port, accepted) = start_counting_upstream().await;
    let router = start_router(Arc::new(Loopback), upstream_port).await;

    let mut client = TcpStream::connect(router).await.unwrap();
    client
        .write_all(&build_client_hello(None))
        .await
        .unwrap();

    let mut buf = [0u8; 8];
    let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "router should close the connection");

    sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_handshake_is_closed_with_no_upstream_dial() {
    let (upstream_port, accepted) = start_counting_upstream().await;
    let router = start_router(Arc::new(Loopback), upstream_port).await;

    let mut client = TcpStream::connect(router).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let mut buf = [0u8; 8];
    let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_resolution_failure_closes_the_client() {
    let (upstream_port, accepted) = start_counting_upstream().await;
    let router = start_router(Arc::new(Unresolvable), upstream_port).await;

    let mut client = TcpStream::connect(router).await.unwrap();
    client
        .write_all(&build_client_hello(Some("missing.example")))
        .await
        .unwrap();

    let mut buf = [0u8; 8];
    let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_upstream_close_propagates_to_the_client() {
    // Upstream that accepts, swallows the handshake, then hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
        }
        // Stream dropped here: upstream side closed.
    });

    let router = start_router(Arc::new(Loopback), upstream_port).await;
    let mut client = TcpStream::connect(router).await.unwrap();
    client
        .write_all(&build_client_hello(Some("example.com")))
        .await
        .unwrap();

    let mut buf = [0u8; 8];
    let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "client should observe the upstream close");
}
