//! Per-direction durable queue.
//!
//! An append-only log with monotonic sequence numbers and work-queue
//! retention: entries are removed once the consumer acknowledges them, so
//! the log holds exactly the backlog plus in-flight work. Delivered but
//! unacknowledged entries sit in an in-memory pending set with an ack-wait
//! deadline; the per-entry delivery counter is persisted so redelivery
//! counts survive a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, warn};

use crate::bootstrap::ShutdownState;

use super::types::{ConsumerInfo, Delivery, Direction, Envelope, QueueError, StreamInfo};

/// Tunables for delivery and redelivery behavior.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// How long a delivery may stay unacknowledged before it becomes
    /// redeliverable.
    pub ack_wait: Duration,
    /// Maximum unacknowledged deliveries outstanding at once.
    pub max_ack_pending: usize,
    /// Base delay for redelivery after an explicit nack.
    pub base_redelivery_delay: Duration,
    /// Cap for the exponential redelivery delay.
    pub max_redelivery_delay: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(30),
            max_ack_pending: 100,
            base_redelivery_delay: Duration::from_secs(1),
            max_redelivery_delay: Duration::from_secs(30),
        }
    }
}

/// Retention limits enforced by the maintenance task.
#[derive(Debug, Clone)]
pub struct QueueLimits {
    pub max_messages: u64,
    pub max_bytes: u64,
    pub max_age: Duration,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_messages: 1_000_000,
            max_bytes: 10 * 1024 * 1024 * 1024,
            max_age: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

struct ConsumerState {
    /// Delivered, awaiting ack: seq → deadline.
    pending: HashMap<u64, Instant>,
    /// Nacked, awaiting redelivery: seq → earliest redelivery time.
    delayed: BTreeMap<u64, Instant>,
}

/// Durable queue for one direction.
pub struct DirectionQueue {
    direction: Direction,
    keyspace: Keyspace,
    log: PartitionHandle,
    deliveries: PartitionHandle,
    cursors: PartitionHandle,
    opts: QueueOptions,
    next_seq: AtomicU64,
    last_acked: AtomicU64,
    delivered: AtomicU64,
    redelivered: AtomicU64,
    state: Mutex<ConsumerState>,
    notify: Notify,
}

impl DirectionQueue {
    /// Open (or create) the log for one direction inside a shared keyspace.
    pub fn open(
        keyspace: Keyspace,
        cursors: PartitionHandle,
        deliveries: PartitionHandle,
        direction: Direction,
        opts: QueueOptions,
    ) -> anyhow::Result<Arc<Self>> {
        let log = keyspace.open_partition(
            &format!("{}_log", direction.plural()),
            PartitionCreateOptions::default(),
        )?;

        // Recover cursors. The log itself is authoritative for the next
        // sequence in case the cursor write did not make it to disk.
        let next_key = format!("next_seq_{}", direction.plural());
        let mut next_seq = cursors
            .get(next_key.as_bytes())?
            .and_then(|v| decode_u64(&v))
            .unwrap_or(1);

        let mut backlog = 0u64;
        for item in log.iter() {
            let (key, _) = item?;
            if let Some(seq) = decode_u64(&key) {
                next_seq = next_seq.max(seq + 1);
                backlog += 1;
            }
        }

        let acked_key = format!("last_acked_{}", direction.plural());
        let last_acked = cursors
            .get(acked_key.as_bytes())?
            .and_then(|v| decode_u64(&v))
            .unwrap_or(0);

        tracing::info!(
            direction = %direction,
            next_seq,
            last_acked,
            backlog,
            "queue opened"
        );

        Ok(Arc::new(Self {
            direction,
            keyspace,
            log,
            deliveries,
            cursors,
            opts,
            next_seq: AtomicU64::new(next_seq),
            last_acked: AtomicU64::new(last_acked),
            delivered: AtomicU64::new(0),
            redelivered: AtomicU64::new(0),
            state: Mutex::new(ConsumerState {
                pending: HashMap::new(),
                delayed: BTreeMap::new(),
            }),
            notify: Notify::new(),
        }))
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Durably append an envelope. Returns its sequence number.
    ///
    /// The entry is synced to disk before this returns; callers may only
    /// acknowledge the sender afterwards.
    pub fn publish(&self, envelope: &Envelope) -> Result<u64, QueueError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let value = serde_json::to_vec(envelope)?;

        self.log.insert(seq.to_be_bytes(), value)?;
        self.cursors.insert(
            format!("next_seq_{}", self.direction.plural()).as_bytes(),
            (seq + 1).to_be_bytes(),
        )?;
        self.keyspace.persist(PersistMode::SyncAll)?;

        debug!(direction = %self.direction, seq, id = %envelope.id, "envelope enqueued");
        self.notify.notify_one();
        Ok(seq)
    }

    /// Wait for the next deliverable entry.
    ///
    /// Returns `None` once shutdown leaves the `Running` state. Entries
    /// whose ack-wait elapsed and nacked entries whose redelivery delay
    /// passed are handed out again with an incremented delivery counter.
    pub async fn fetch(&self, shutdown: &mut watch::Receiver<ShutdownState>) -> Option<Delivery> {
        loop {
            if *shutdown.borrow() != ShutdownState::Running {
                return None;
            }

            // Arm the notification before scanning so a concurrent publish
            // cannot slip between the scan and the wait.
            let notified = self.notify.notified();

            let wait = match self.try_claim() {
                Ok((Some(delivery), _)) => return Some(delivery),
                Ok((None, wait)) => wait,
                Err(e) => {
                    error!(direction = %self.direction, error = %e, "queue fetch failed");
                    Duration::from_secs(1)
                }
            };

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Claim the lowest deliverable sequence, if any.
    ///
    /// On `None`, the returned duration bounds how long the caller should
    /// wait before the picture can change without an external notification.
    fn try_claim(&self) -> Result<(Option<Delivery>, Duration), QueueError> {
        let now = Instant::now();
        let mut st = self.state.lock().expect("queue state lock poisoned");

        // Ack-wait lapses make entries redeliverable immediately.
        let lapsed: Vec<u64> = st
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in lapsed {
            warn!(direction = %self.direction, seq, "ack wait elapsed, entry redeliverable");
            st.pending.remove(&seq);
        }

        let mut wait = self.opts.ack_wait;

        if st.pending.len() >= self.opts.max_ack_pending {
            if let Some(deadline) = st.pending.values().min() {
                wait = deadline.saturating_duration_since(now);
            }
            return Ok((None, wait));
        }

        for item in self.log.iter() {
            let (key, value) = item.map_err(fjall::Error::from)?;
            let Some(seq) = decode_u64(&key) else {
                continue;
            };
            if st.pending.contains_key(&seq) {
                continue;
            }
            if let Some(&due) = st.delayed.get(&seq) {
                if due > now {
                    wait = wait.min(due.saturating_duration_since(now));
                    continue;
                }
            }

            st.delayed.remove(&seq);
            let envelope: Envelope = serde_json::from_slice(&value)?;
            let num_delivered = self.bump_delivery_count(seq)?;
            st.pending.insert(seq, now + self.opts.ack_wait);

            self.delivered.fetch_add(1, Ordering::Relaxed);
            if num_delivered > 1 {
                self.redelivered.fetch_add(1, Ordering::Relaxed);
            }

            return Ok((
                Some(Delivery {
                    seq,
                    num_delivered,
                    envelope,
                }),
                Duration::ZERO,
            ));
        }

        if let Some(deadline) = st.pending.values().min() {
            wait = wait.min(deadline.saturating_duration_since(now));
        }
        Ok((None, wait))
    }

    /// Acknowledge a delivery: the entry leaves the active queue for good.
    pub fn ack(&self, seq: u64) -> Result<(), QueueError> {
        {
            let mut st = self.state.lock().expect("queue state lock poisoned");
            st.pending.remove(&seq);
            st.delayed.remove(&seq);
        }

        self.log.remove(seq.to_be_bytes())?;
        self.deliveries.remove(self.delivery_key(seq).as_bytes())?;
        self.last_acked.fetch_max(seq, Ordering::SeqCst);
        self.cursors.insert(
            format!("last_acked_{}", self.direction.plural()).as_bytes(),
            self.last_acked.load(Ordering::SeqCst).to_be_bytes(),
        )?;
        self.keyspace.persist(PersistMode::SyncData)?;

        // An ack frees an ack-pending slot.
        self.notify.notify_one();
        Ok(())
    }

    /// Negative-acknowledge a delivery: schedule redelivery with an
    /// exponential delay derived from the delivery count.
    pub fn nack(&self, seq: u64) -> Result<(), QueueError> {
        if self.log.get(seq.to_be_bytes())?.is_none() {
            return Err(QueueError::UnknownSequence(seq));
        }

        let num_delivered = self
            .deliveries
            .get(self.delivery_key(seq).as_bytes())?
            .and_then(|v| decode_u64(&v))
            .unwrap_or(1);
        let delay = self.redelivery_delay(num_delivered);

        {
            let mut st = self.state.lock().expect("queue state lock poisoned");
            st.pending.remove(&seq);
            st.delayed.insert(seq, Instant::now() + delay);
        }

        debug!(
            direction = %self.direction,
            seq,
            num_delivered,
            delay_ms = delay.as_millis() as u64,
            "entry nacked, redelivery scheduled"
        );
        self.notify.notify_one();
        Ok(())
    }

    fn redelivery_delay(&self, num_delivered: u64) -> Duration {
        let exponent = num_delivered.saturating_sub(1).min(16) as u32;
        let base = self.opts.base_redelivery_delay.as_millis() as u64;
        let capped = (base << exponent).min(self.opts.max_redelivery_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }

    fn bump_delivery_count(&self, seq: u64) -> Result<u64, QueueError> {
        let key = self.delivery_key(seq);
        let num = self
            .deliveries
            .get(key.as_bytes())?
            .and_then(|v| decode_u64(&v))
            .unwrap_or(0)
            + 1;
        self.deliveries.insert(key.as_bytes(), num.to_be_bytes())?;
        self.keyspace.persist(PersistMode::SyncData)?;
        Ok(num)
    }

    fn delivery_key(&self, seq: u64) -> String {
        format!("{}_{}", self.direction.plural(), seq)
    }

    /// Number of entries in the log (backlog plus in-flight).
    pub fn depth(&self) -> u64 {
        self.log.len().map(|n| n as u64).unwrap_or(0)
    }

    /// Snapshot of the log for the admin surface.
    pub fn stream_info(&self) -> StreamInfo {
        let mut messages = 0u64;
        let mut bytes = 0u64;
        let mut first = 0u64;
        let mut last = 0u64;

        for item in self.log.iter() {
            let Ok((key, value)) = item else { continue };
            let Some(seq) = decode_u64(&key) else { continue };
            if messages == 0 {
                first = seq;
            }
            last = seq;
            messages += 1;
            bytes += value.len() as u64;
        }

        StreamInfo {
            name: self.direction.plural().to_string(),
            messages,
            bytes,
            first_sequence: first,
            last_sequence: last,
        }
    }

    /// Snapshot of the consumer for the admin surface.
    pub fn consumer_info(&self) -> ConsumerInfo {
        let ack_pending = {
            let st = self.state.lock().expect("queue state lock poisoned");
            st.pending.len() as u64
        };

        ConsumerInfo {
            stream: self.direction.plural().to_string(),
            name: format!("{}-forwarder", self.direction),
            pending: self.depth().saturating_sub(ack_pending),
            delivered: self.delivered.load(Ordering::Relaxed),
            ack_pending,
            redelivered: self.redelivered.load(Ordering::Relaxed),
        }
    }

    /// Drop entries violating the retention limits. Returns how many were
    /// removed. In-flight entries are spared.
    pub fn enforce_limits(&self, limits: &QueueLimits) -> u64 {
        let now = chrono::Utc::now();
        let in_flight: std::collections::HashSet<u64> = {
            let st = self.state.lock().expect("queue state lock poisoned");
            st.pending.keys().copied().collect()
        };

        let mut entries: Vec<(u64, u64, chrono::DateTime<chrono::Utc>)> = Vec::new();
        let mut total_bytes = 0u64;
        for item in self.log.iter() {
            let Ok((key, value)) = item else { continue };
            let Some(seq) = decode_u64(&key) else { continue };
            let received_at = serde_json::from_slice::<Envelope>(&value)
                .map(|e| e.received_at)
                .unwrap_or(now);
            total_bytes += value.len() as u64;
            entries.push((seq, value.len() as u64, received_at));
        }

        let mut removed = 0u64;
        let mut count = entries.len() as u64;
        for (seq, len, received_at) in entries {
            if in_flight.contains(&seq) {
                continue;
            }
            let too_old = now.signed_duration_since(received_at).to_std().unwrap_or_default()
                > limits.max_age;
            let over_count = count > limits.max_messages;
            let over_bytes = total_bytes > limits.max_bytes;
            if !(too_old || over_count || over_bytes) {
                break;
            }

            if self.log.remove(seq.to_be_bytes()).is_ok() {
                let _ = self.deliveries.remove(self.delivery_key(seq).as_bytes());
                warn!(direction = %self.direction, seq, "entry dropped by retention limits");
                removed += 1;
                count -= 1;
                total_bytes = total_bytes.saturating_sub(len);
            }
        }

        if removed > 0 {
            let _ = self.keyspace.persist(PersistMode::SyncData);
        }
        removed
    }
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    bytes.get(..8).and_then(|b| b.try_into().ok()).map(u64::from_be_bytes)
}
