//! Periodic housekeeping for the queue stores.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bootstrap::{Shutdown, ShutdownState};

use super::QueueSet;

/// History entries expire after a day.
pub const HISTORY_TTL: Duration = Duration::from_secs(24 * 3600);
/// Dead letters are kept for a week.
pub const DLQ_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the maintenance task: bucket TTL expiry and log retention limits.
pub fn start(queues: Arc<QueueSet>, shutdown: Arc<Shutdown>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = shutdown.subscribe();
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow_and_update() != ShutdownState::Running {
                        break;
                    }
                }

                _ = interval.tick() => {
                    let swept = queues.run_maintenance();
                    if swept > 0 {
                        debug!(swept, "maintenance sweep removed entries");
                    }
                }
            }
        }

        info!("queue maintenance stopped");
    })
}
