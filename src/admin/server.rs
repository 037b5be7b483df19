//! Admin HTTP server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::bootstrap::Shutdown;
use crate::egress::MllpClient;
use crate::queue::QueueSet;

use super::handlers;

/// State shared by all admin handlers.
pub struct AdminState {
    start_time: Instant,
    queues: Arc<QueueSet>,
    order_egress: MllpClient,
    report_egress: MllpClient,
}

impl AdminState {
    pub fn new(queues: Arc<QueueSet>, order_egress: MllpClient, report_egress: MllpClient) -> Self {
        Self {
            start_time: Instant::now(),
            queues,
            order_egress,
            report_egress,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn queues(&self) -> &Arc<QueueSet> {
        &self.queues
    }

    pub fn order_egress(&self) -> &MllpClient {
        &self.order_egress
    }

    pub fn report_egress(&self) -> &MllpClient {
        &self.report_egress
    }
}

/// Admin HTTP server.
pub struct AdminServer {
    listener: TcpListener,
    state: Arc<AdminState>,
    shutdown: Arc<Shutdown>,
}

impl AdminServer {
    /// Bind the admin port. Bind failure is fatal for the process.
    pub async fn bind(
        port: u16,
        state: Arc<AdminState>,
        shutdown: Arc<Shutdown>,
    ) -> io::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        info!(address = %listener.local_addr()?, "admin server started");

        Ok(Self {
            listener,
            state,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn build_router(state: Arc<AdminState>) -> Router {
        let api = Router::new()
            .route("/health", get(handlers::health))
            .route("/stats", get(handlers::stats))
            .route("/messages", get(handlers::messages))
            .route("/messages/{id}/retry", post(handlers::retry_message))
            .route("/streams", get(handlers::streams))
            .route("/consumers", get(handlers::consumers));

        Router::new()
            .nest("/api", api)
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Serve until shutdown; in-flight requests get a grace period which
    /// the supervisor bounds at 10 seconds.
    pub async fn run(self) -> io::Result<()> {
        let router = Self::build_router(self.state);
        let mut shutdown_rx = self.shutdown.subscribe();

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
                info!("admin server shutting down");
            })
            .await
    }
}
