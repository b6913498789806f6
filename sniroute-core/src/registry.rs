//! Process-wide accounting of live inbound connections.
//!
//! The registry exists for one consumer: the shutdown coordinator, which
//! needs an accurate live count and a way to watch it reach zero.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;

/// The connection set could not be read; coordinator state is unreliable.
#[derive(Debug, Error)]
#[error("connection registry lock poisoned")]
pub struct RegistryError;

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    connections: Mutex<HashMap<u64, SocketAddr>>,
    count: watch::Sender<usize>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                connections: Mutex::new(HashMap::new()),
                count,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Track a connection for the lifetime of the returned guard; dropping
    /// the guard removes the entry on every exit path.
    pub fn register(&self, peer: SocketAddr) -> Result<ConnectionGuard, RegistryError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.inner.connections.lock().map_err(|_| RegistryError)?;
        connections.insert(id, peer);
        let _ = self.inner.count.send(connections.len());
        Ok(ConnectionGuard {
            inner: Arc::clone(&self.inner),
            id,
        })
    }

    /// Live connection count at this instant.
    pub fn active(&self) -> Result<usize, RegistryError> {
        let connections = self.inner.connections.lock().map_err(|_| RegistryError)?;
        Ok(connections.len())
    }

    /// Receiver observing every change of the live count.
    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.inner.count.subscribe()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Ok(mut connections) = self.inner.connections.lock() {
            connections.remove(&self.id);
            let _ = self.inner.count.send(connections.len());
        }
    }
}
