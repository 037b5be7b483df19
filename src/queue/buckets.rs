//! Keyed buckets layered on the shared keyspace: dead letters, delivery
//! history, and scalar statistics.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fjall::{Keyspace, PartitionHandle, PersistMode};
use tracing::{debug, error, warn};

use super::types::{Envelope, QueueError};

/// Dead-letter bucket.
///
/// Keys are `<direction>_<envelope_id>_<unix_ts>`; values are the serialized
/// envelope with `status = dead_lettered`. Written by the forwarder, read
/// and deleted by the admin surface.
#[derive(Clone)]
pub struct DlqBucket {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl DlqBucket {
    pub fn new(keyspace: Keyspace, partition: PartitionHandle) -> Self {
        Self { keyspace, partition }
    }

    pub fn put(&self, envelope: &Envelope) -> Result<String, QueueError> {
        let key = format!(
            "{}_{}_{}",
            envelope.direction.as_str(),
            envelope.id,
            Utc::now().timestamp()
        );
        let value = serde_json::to_vec(envelope)?;
        self.partition.insert(key.as_bytes(), value)?;
        self.keyspace.persist(PersistMode::SyncData)?;
        Ok(key)
    }

    /// All dead-lettered envelopes with their keys. Unreadable values are
    /// skipped with a log line rather than failing the whole scan.
    pub fn entries(&self) -> Vec<(String, Envelope)> {
        scan_envelopes(&self.partition, "dlq")
    }

    pub fn find_by_id(&self, id: &str) -> Option<(String, Envelope)> {
        self.entries().into_iter().find(|(_, env)| env.id == id)
    }

    pub fn remove(&self, key: &str) -> Result<(), QueueError> {
        self.partition.remove(key.as_bytes())?;
        self.keyspace.persist(PersistMode::SyncData)?;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.partition.len().map(|n| n as u64).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove entries whose key timestamp (seconds) is older than `ttl`.
    pub fn expire(&self, ttl: Duration) -> u64 {
        let cutoff = Utc::now().timestamp() - ttl.as_secs() as i64;
        expire_by_key_suffix(&self.keyspace, &self.partition, cutoff, "dlq")
    }
}

/// Rolling history of processed envelopes (successes and dead letters).
///
/// Keys are `<direction>_<envelope_id>_<unix_nanos>`; entries expire after
/// the bucket TTL (default 24h).
#[derive(Clone)]
pub struct HistoryBucket {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl HistoryBucket {
    pub fn new(keyspace: Keyspace, partition: PartitionHandle) -> Self {
        Self { keyspace, partition }
    }

    pub fn put(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp() * 1_000_000_000);
        let key = format!(
            "{}_{}_{}",
            envelope.direction.as_str(),
            envelope.id,
            nanos
        );
        let value = serde_json::to_vec(envelope)?;
        self.partition.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn entries(&self) -> Vec<Envelope> {
        scan_envelopes(&self.partition, "history")
            .into_iter()
            .map(|(_, env)| env)
            .collect()
    }

    pub fn len(&self) -> u64 {
        self.partition.len().map(|n| n as u64).unwrap_or(0)
    }

    /// Remove entries whose key timestamp (nanoseconds) is older than `ttl`.
    pub fn expire(&self, ttl: Duration) -> u64 {
        let cutoff = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX)
            .saturating_sub(ttl.as_nanos() as i64);
        expire_by_key_suffix(&self.keyspace, &self.partition, cutoff, "history")
    }
}

/// Scalar counters and timestamps for the admin dashboard.
///
/// Increments are read-modify-write; the internal mutex serializes them so
/// concurrent forwarders cannot lose updates.
pub struct StatsBucket {
    keyspace: Keyspace,
    partition: PartitionHandle,
    write_lock: Mutex<()>,
}

impl StatsBucket {
    pub fn new(keyspace: Keyspace, partition: PartitionHandle) -> Self {
        Self {
            keyspace,
            partition,
            write_lock: Mutex::new(()),
        }
    }

    /// Atomically add one to a counter, creating it at 1 if absent.
    pub fn increment(&self, key: &str) -> u64 {
        let _guard = self.write_lock.lock().expect("stats lock poisoned");

        let current = self.counter_unlocked(key);
        let next = current + 1;
        if let Err(e) = self.partition.insert(key.as_bytes(), next.to_string().as_bytes()) {
            error!(key, error = %e, "statistics counter update failed");
            return current;
        }
        next
    }

    pub fn counter(&self, key: &str) -> u64 {
        let _guard = self.write_lock.lock().expect("stats lock poisoned");
        self.counter_unlocked(key)
    }

    fn counter_unlocked(&self, key: &str) -> u64 {
        self.partition
            .get(key.as_bytes())
            .ok()
            .flatten()
            .and_then(|v| String::from_utf8_lossy(&v).parse().ok())
            .unwrap_or(0)
    }

    pub fn set_timestamp(&self, key: &str, when: DateTime<Utc>) {
        if let Err(e) = self
            .partition
            .insert(key.as_bytes(), when.to_rfc3339().as_bytes())
        {
            error!(key, error = %e, "statistics timestamp update failed");
        }
    }

    pub fn timestamp(&self, key: &str) -> Option<String> {
        self.partition
            .get(key.as_bytes())
            .ok()
            .flatten()
            .map(|v| String::from_utf8_lossy(&v).into_owned())
    }

    pub fn len(&self) -> u64 {
        self.partition.len().map(|n| n as u64).unwrap_or(0)
    }

    /// Flush buffered statistics writes.
    pub fn persist(&self) {
        if let Err(e) = self.keyspace.persist(PersistMode::Buffer) {
            error!(error = %e, "statistics persist failed");
        }
    }
}

fn scan_envelopes(partition: &PartitionHandle, bucket: &str) -> Vec<(String, Envelope)> {
    let mut out = Vec::new();
    for item in partition.iter() {
        let Ok((key, value)) = item else { continue };
        let key = String::from_utf8_lossy(&key).into_owned();
        match serde_json::from_slice::<Envelope>(&value) {
            Ok(env) => out.push((key, env)),
            Err(e) => debug!(bucket, key, error = %e, "skipping unreadable bucket entry"),
        }
    }
    out
}

/// Delete entries whose key ends in `_<timestamp>` with a timestamp before
/// `cutoff`. Keys without a parseable suffix are left alone.
fn expire_by_key_suffix(
    keyspace: &Keyspace,
    partition: &PartitionHandle,
    cutoff: i64,
    bucket: &str,
) -> u64 {
    let mut stale = Vec::new();
    for item in partition.iter() {
        let Ok((key, _)) = item else { continue };
        let key = String::from_utf8_lossy(&key).into_owned();
        let Some(ts) = key.rsplit('_').next().and_then(|s| s.parse::<i64>().ok()) else {
            continue;
        };
        if ts < cutoff {
            stale.push(key);
        }
    }

    let mut removed = 0u64;
    for key in &stale {
        match partition.remove(key.as_bytes()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(bucket, key, error = %e, "bucket expiry delete failed"),
        }
    }
    if removed > 0 {
        let _ = keyspace.persist(PersistMode::Buffer);
        debug!(bucket, removed, "expired bucket entries");
    }
    removed
}
