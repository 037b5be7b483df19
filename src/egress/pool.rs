//! Keep-alive connection reuse for an egress target.
//!
//! Holds at most one idle framed connection per target. A parked connection
//! is only reused while it is younger than the keep-alive window; anything
//! stale is dropped and the caller dials fresh.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::codec::MllpCodec;

/// Framed MLLP transport over TCP.
pub type Transport = Framed<TcpStream, MllpCodec>;

struct Idle {
    transport: Transport,
    parked_at: Instant,
}

/// Single-slot connection pool for one egress target.
pub struct ConnectionPool {
    addr: String,
    keep_alive: Duration,
    idle: Mutex<Option<Idle>>,
}

impl ConnectionPool {
    pub fn new(addr: impl Into<String>, keep_alive: Duration) -> Self {
        Self {
            addr: addr.into(),
            keep_alive,
            idle: Mutex::new(None),
        }
    }

    /// Take the idle connection if it passes the health check.
    pub async fn take(&self) -> Option<Transport> {
        let idle = self.idle.lock().await.take()?;

        if idle.parked_at.elapsed() > self.keep_alive {
            debug!(target = %self.addr, "idle connection past keep-alive, discarding");
            return None;
        }

        // A peer that closed the socket while it was parked shows up as
        // readable EOF; catch it here instead of failing the next send.
        if let Err(e) = idle.transport.get_ref().try_write(&[]) {
            debug!(target = %self.addr, error = %e, "parked connection unusable");
            return None;
        }

        trace!(target = %self.addr, "reusing idle connection");
        Some(idle.transport)
    }

    /// Park a healthy connection for reuse.
    pub async fn put(&self, transport: Transport) {
        let mut idle = self.idle.lock().await;
        *idle = Some(Idle {
            transport,
            parked_at: Instant::now(),
        });
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}
