//! Drain coordination after the termination signal.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{error, warn};

use crate::registry::ConnectionRegistry;

/// Lifecycle of the process once a termination signal arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// How the drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection closed within the grace period, or none were open.
    Clean,
    /// The grace period expired with sessions still live; they are dropped.
    Forced,
    /// Connection bookkeeping failed; terminated without waiting at all.
    Aborted,
}

pub struct Coordinator {
    registry: ConnectionRegistry,
    grace: Duration,
    state: ShutdownState,
}

impl Coordinator {
    pub fn new(registry: ConnectionRegistry, grace: Duration) -> Self {
        Self {
            registry,
            grace,
            state: ShutdownState::Running,
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    /// Wait for live connections to finish, bounded by the grace period.
    /// The caller must already have closed the listener.
    pub async fn drain(&mut self) -> DrainOutcome {
        self.state = ShutdownState::Draining;
        let outcome = self.wait_for_connections().await;
        self.state = ShutdownState::Terminated;
        outcome
    }

    async fn wait_for_connections(&self) -> DrainOutcome {
        let open = match self.registry.active() {
            Ok(count) => count,
            Err(error) => {
                error!(target: "tcp", %error, "cannot inspect live connections, bailing with no grace");
                return DrainOutcome::Aborted;
            }
        };
        if open == 0 {
            return DrainOutcome::Clean;
        }

        warn!(
            target: "tcp",
            open,
            grace_ms = self.grace.as_millis() as u64,
            "waiting for clients to disconnect"
        );
        let mut count = self.registry.watch_count();
        match timeout(self.grace, count.wait_for(|&open| open == 0)).await {
            Ok(Ok(_)) => DrainOutcome::Clean,
            // The count channel cannot close while we hold the registry;
            // treat it as bookkeeping failure all the same.
            Ok(Err(_)) => DrainOutcome::Aborted,
            Err(_) => {
                warn!(target: "tcp", "grace period expired, dropping remaining sessions");
                DrainOutcome::Forced
            }
        }
    }
}
