//! Durable store-and-forward queue.
//!
//! One append-only log per direction with explicit consumer cursors,
//! ack-wait redelivery, and persisted delivery counters, plus keyed buckets
//! for dead letters, history, and statistics. Everything lives in a single
//! fjall keyspace rooted at the configured storage path, so the whole state
//! survives process restarts.
//!
//! ```text
//! Ingress → publish → [orders_log | reports_log] → fetch → Forwarder
//!                                                    │
//!                                 ack ───────────────┤ (removed from log)
//!                                 nack ──────────────┤ (redelivered later)
//!                                 exhausted ─────────┴→ dlq + history
//! ```

mod buckets;
mod log;
mod maintenance;
mod types;

pub use buckets::{DlqBucket, HistoryBucket, StatsBucket};
pub use log::{DirectionQueue, QueueLimits, QueueOptions};
pub use maintenance::{start as start_maintenance, DLQ_TTL, HISTORY_TTL};
pub use types::{ConsumerInfo, Delivery, Direction, Envelope, QueueError, Status, StreamInfo};

use std::path::Path;
use std::sync::Arc;

use fjall::{Config, Keyspace, PartitionCreateOptions};

/// All durable state: both direction queues and the shared buckets.
pub struct QueueSet {
    keyspace: Keyspace,
    orders: Arc<DirectionQueue>,
    reports: Arc<DirectionQueue>,
    dlq: DlqBucket,
    history: HistoryBucket,
    stats: Arc<StatsBucket>,
    limits: QueueLimits,
}

impl QueueSet {
    /// Open (or create) the durable stores under `path`.
    ///
    /// Creation is idempotent; existing logs and buckets are recovered.
    pub fn open(path: &Path, opts: QueueOptions) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(path)?;
        let keyspace = Config::new(path).open()?;

        let cursors = keyspace.open_partition("cursors", PartitionCreateOptions::default())?;
        let deliveries = keyspace.open_partition("deliveries", PartitionCreateOptions::default())?;

        let orders = DirectionQueue::open(
            keyspace.clone(),
            cursors.clone(),
            deliveries.clone(),
            Direction::Order,
            opts.clone(),
        )?;
        let reports = DirectionQueue::open(
            keyspace.clone(),
            cursors,
            deliveries,
            Direction::Report,
            opts,
        )?;

        let dlq = DlqBucket::new(
            keyspace.clone(),
            keyspace.open_partition("dlq", PartitionCreateOptions::default())?,
        );
        let history = HistoryBucket::new(
            keyspace.clone(),
            keyspace.open_partition("history", PartitionCreateOptions::default())?,
        );
        let stats = Arc::new(StatsBucket::new(
            keyspace.clone(),
            keyspace.open_partition("stats", PartitionCreateOptions::default())?,
        ));

        tracing::info!(
            path = %path.display(),
            order_backlog = orders.depth(),
            report_backlog = reports.depth(),
            dead_letters = dlq.len(),
            "durable stores opened"
        );

        Ok(Arc::new(Self {
            keyspace,
            orders,
            reports,
            dlq,
            history,
            stats,
            limits: QueueLimits::default(),
        }))
    }

    pub fn queue(&self, direction: Direction) -> &Arc<DirectionQueue> {
        match direction {
            Direction::Order => &self.orders,
            Direction::Report => &self.reports,
        }
    }

    pub fn orders(&self) -> &Arc<DirectionQueue> {
        &self.orders
    }

    pub fn reports(&self) -> &Arc<DirectionQueue> {
        &self.reports
    }

    pub fn dlq(&self) -> &DlqBucket {
        &self.dlq
    }

    pub fn history(&self) -> &HistoryBucket {
        &self.history
    }

    pub fn stats(&self) -> &Arc<StatsBucket> {
        &self.stats
    }

    /// Quick storage liveness probe for the health endpoint.
    pub fn is_available(&self) -> bool {
        self.keyspace
            .open_partition("stats", PartitionCreateOptions::default())
            .is_ok()
    }

    /// One maintenance sweep: TTL expiry and retention limits. Returns the
    /// number of removed entries.
    pub fn run_maintenance(&self) -> u64 {
        self.stats.persist();
        self.history.expire(HISTORY_TTL)
            + self.dlq.expire(DLQ_TTL)
            + self.orders.enforce_limits(&self.limits)
            + self.reports.enforce_limits(&self.limits)
    }

    /// Flush everything to disk (used during shutdown).
    pub fn flush(&self) {
        if let Err(e) = self.keyspace.persist(fjall::PersistMode::SyncAll) {
            tracing::error!(error = %e, "final flush failed");
        }
    }
}
