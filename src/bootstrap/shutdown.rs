//! Graceful shutdown coordination.
//!
//! A single watch channel propagates the lifecycle state to every task:
//!
//! 1. Running - normal operation
//! 2. Draining - stop accepting new work, let in-flight work finish
//! 3. Terminated - everything stopped

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle state shared by all tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Draining,
    Terminated,
}

/// Shutdown coordinator.
pub struct Shutdown {
    state: watch::Sender<State>,
    active_connections: AtomicU64,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        let (state, _) = watch::channel(State::Running);
        Arc::new(Self {
            state,
            active_connections: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Begin draining (called on SIGINT/SIGTERM).
    pub fn start_drain(&self) {
        if self.state() != State::Running {
            return;
        }
        info!(
            active_connections = self.active_connections(),
            "starting graceful shutdown drain"
        );
        let _ = self.state.send(State::Draining);
    }

    /// Complete shutdown.
    pub fn terminate(&self) {
        if self.state() == State::Terminated {
            return;
        }
        let active = self.active_connections();
        if active > 0 {
            warn!(active_connections = active, "terminating with active connections");
        }
        let _ = self.state.send(State::Terminated);
    }

    /// Register a new connection. Returns false when draining, so acceptors
    /// reject new work during shutdown.
    pub fn connection_opened(&self) -> bool {
        if self.state() != State::Running {
            return false;
        }
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Unregister a connection.
    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        let shutdown = Shutdown::new();

        assert_eq!(shutdown.state(), State::Running);
        assert!(shutdown.connection_opened());
        assert_eq!(shutdown.active_connections(), 1);

        shutdown.start_drain();
        assert_eq!(shutdown.state(), State::Draining);

        // New connections rejected during drain.
        assert!(!shutdown.connection_opened());

        shutdown.connection_closed();
        assert_eq!(shutdown.active_connections(), 0);

        shutdown.terminate();
        assert_eq!(shutdown.state(), State::Terminated);
    }

    #[test]
    fn terminate_is_idempotent() {
        let shutdown = Shutdown::new();
        shutdown.terminate();
        shutdown.terminate();
        assert_eq!(shutdown.state(), State::Terminated);
    }

    #[tokio::test]
    async fn subscribers_observe_drain() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();

        shutdown.start_drain();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), State::Draining);
    }
}
