//! TCP acceptor for one ingress direction.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, span, Instrument, Level};

use crate::bootstrap::Shutdown;
use crate::queue::{Direction, DirectionQueue};

use super::connection;

/// MLLP listener for one direction.
pub struct Listener {
    direction: Direction,
    local_addr: SocketAddr,
    listener: TcpListener,
    destination: String,
    queue: Arc<DirectionQueue>,
    shutdown: Arc<Shutdown>,
}

impl Listener {
    /// Bind the ingress port. Bind failure is fatal for the process, so it
    /// is surfaced here rather than inside the accept task.
    pub async fn bind(
        port: u16,
        direction: Direction,
        destination: String,
        queue: Arc<DirectionQueue>,
        shutdown: Arc<Shutdown>,
    ) -> io::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            direction = %direction,
            address = %local_addr,
            destination = %destination,
            "mllp listener started"
        );

        Ok(Self {
            direction,
            local_addr,
            listener,
            destination,
            queue,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until shutdown.
    pub async fn run(self) {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if !self.shutdown.is_running() {
                        info!(direction = %self.direction, "listener shutting down");
                        break;
                    }
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.handle_accept(stream, peer),
                        Err(e) => {
                            error!(direction = %self.direction, error = %e, "accept error");
                        }
                    }
                }
            }
        }

        info!(direction = %self.direction, "listener stopped");
    }

    fn handle_accept(&self, stream: TcpStream, peer: SocketAddr) {
        if !self.shutdown.connection_opened() {
            debug!(direction = %self.direction, peer = %peer, "draining, connection rejected");
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "set_nodelay failed");
        }

        let span = span!(
            Level::INFO,
            "conn",
            direction = %self.direction,
            peer = %peer
        );

        let direction = self.direction;
        let destination = self.destination.clone();
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();
        let shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(
            async move {
                connection::handle(stream, peer, direction, destination, queue, shutdown_rx).await;
                shutdown.connection_closed();
            }
            .instrument(span),
        );
    }
}
