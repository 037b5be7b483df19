//! Replicator supervisor.
//!
//! Owns startup order and shutdown: durable stores first, then both
//! ingress listeners, both forwarders, the maintenance task, and the admin
//! server. On SIGINT/SIGTERM the shutdown watch drains everything and the
//! stores are flushed last.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::admin::{AdminServer, AdminState};
use crate::config::Config;
use crate::egress::MllpClient;
use crate::forwarder::{self, ForwarderConfig};
use crate::listener::Listener;
use crate::queue::{self, Direction, QueueOptions, QueueSet};

use super::shutdown::Shutdown;

/// Grace period for the admin server after drain starts.
const ADMIN_GRACE: Duration = Duration::from_secs(10);
/// Upper bound on waiting for listeners and forwarders to drain. Covers an
/// in-flight egress exchange at its 30s deadline.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(35);

/// The replicator process.
pub struct Server {
    config: Arc<Config>,
    shutdown: Arc<Shutdown>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            shutdown: Shutdown::new(),
        }
    }

    /// Run until a termination signal arrives and everything has drained.
    pub async fn run(self) -> Result<()> {
        let queues = QueueSet::open(Path::new(&self.config.db_path), QueueOptions::default())
            .context("storage initialisation failed")?;

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // Ingress. Bind failures are fatal startup errors.
        let order_listener = Listener::bind(
            self.config.order_listen_port,
            Direction::Order,
            self.config.zenpacs_endpoint(),
            queues.orders().clone(),
            self.shutdown.clone(),
        )
        .await
        .context("order listener bind failed")?;

        let report_listener = Listener::bind(
            self.config.report_listen_port,
            Direction::Report,
            self.config.hospital_endpoint(),
            queues.reports().clone(),
            self.shutdown.clone(),
        )
        .await
        .context("report listener bind failed")?;

        handles.push(tokio::spawn(order_listener.run()));
        handles.push(tokio::spawn(report_listener.run()));

        // Forwarders, one per direction.
        handles.push(forwarder::start(
            &queues,
            Direction::Order,
            MllpClient::new(self.config.zenpacs_host.clone(), self.config.zenpacs_port),
            ForwarderConfig::default(),
            self.shutdown.clone(),
        ));
        handles.push(forwarder::start(
            &queues,
            Direction::Report,
            MllpClient::new(
                self.config.hospital_his_host.clone(),
                self.config.hospital_his_port,
            ),
            ForwarderConfig::default(),
            self.shutdown.clone(),
        ));

        handles.push(queue::start_maintenance(queues.clone(), self.shutdown.clone()));

        // Admin surface.
        let admin_state = Arc::new(AdminState::new(
            queues.clone(),
            MllpClient::new(self.config.zenpacs_host.clone(), self.config.zenpacs_port),
            MllpClient::new(
                self.config.hospital_his_host.clone(),
                self.config.hospital_his_port,
            ),
        ));
        let admin = AdminServer::bind(self.config.web_port, admin_state, self.shutdown.clone())
            .await
            .context("admin server bind failed")?;
        let admin_handle = tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                error!(error = %e, "admin server failed");
            }
        });

        info!(
            order_port = self.config.order_listen_port,
            report_port = self.config.report_listen_port,
            web_port = self.config.web_port,
            zenpacs = %self.config.zenpacs_endpoint(),
            hospital = %self.config.hospital_endpoint(),
            "hl7 replicator started"
        );

        Self::wait_for_signal().await;

        info!("shutdown signal received, draining");
        self.shutdown.start_drain();

        if tokio::time::timeout(ADMIN_GRACE, admin_handle).await.is_err() {
            warn!("admin server did not stop within grace period");
        }

        if tokio::time::timeout(DRAIN_TIMEOUT, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                active_connections = self.shutdown.active_connections(),
                "drain timeout reached, forcing shutdown"
            );
        }

        self.shutdown.terminate();
        queues.flush();

        info!("hl7 replicator stopped");
        Ok(())
    }

    /// Wait for SIGINT (Ctrl+C) or SIGTERM.
    async fn wait_for_signal() {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("received SIGINT");
            }
            _ = terminate => {
                info!("received SIGTERM");
            }
        }
    }
}
