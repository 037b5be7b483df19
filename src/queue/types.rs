//! Types shared by the durable queue and its consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message flow direction, fixed at ingress by the accepting listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// HIS → PACS (orders).
    Order,
    /// PACS → HIS (reports).
    Report,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::Report => "report",
        }
    }

    /// Plural form used for partition names and statistics keys.
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Order => "orders",
            Self::Report => "reports",
        }
    }

}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Accepted at ingress, not yet forwarded.
    Pending,
    /// Delivered downstream with a positive ACK.
    Forwarded,
    /// Last delivery attempt failed; retries remain.
    Failed,
    /// Delivery attempts exhausted; parked in the DLQ.
    DeadLettered,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Forwarded => "forwarded",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// The unit persisted, forwarded, and surfaced to the operator.
///
/// `raw` holds the unframed HL7 payload exactly as received and is never
/// modified; the downstream peer gets it byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub direction: Direction,
    pub received_at: DateTime<Utc>,
    pub source_addr: String,
    pub destination_addr: String,
    pub raw: Vec<u8>,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub control_id: String,
    #[serde(default)]
    pub patient_id: String,
    #[serde(default)]
    pub patient_name: String,
    pub status: Status,
    pub retry_count: u64,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Create a pending envelope for a freshly received message.
    pub fn new(direction: Direction, source_addr: &str, destination_addr: &str, raw: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            direction,
            received_at: Utc::now(),
            source_addr: source_addr.to_string(),
            destination_addr: destination_addr.to_string(),
            raw,
            message_type: String::new(),
            control_id: String::new(),
            patient_id: String::new(),
            patient_name: String::new(),
            status: Status::Pending,
            retry_count: 0,
            last_error: String::new(),
            processed_at: None,
        }
    }

    /// Attach the parsed header fields used for display and audit.
    pub fn with_header(mut self, header: &crate::codec::Header) -> Self {
        self.message_type = header.message_type.clone();
        self.control_id = header.control_id.clone();
        self.patient_id = header.patient_id.clone();
        self.patient_name = header.patient_name.clone();
        self
    }
}

/// A message handed to a consumer, with its queue bookkeeping.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Log sequence number; used to ack or nack.
    pub seq: u64,
    /// How many times this entry has been delivered, this delivery included.
    pub num_delivered: u64,
    pub envelope: Envelope,
}

/// Errors from the durable queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("persist failed: {0}")]
    PersistFailed(#[from] fjall::Error),

    #[error("stored envelope is unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("no such sequence in the active queue: {0}")]
    UnknownSequence(u64),
}

/// Point-in-time view of one direction log, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub name: String,
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
}

/// Point-in-time view of one direction consumer, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerInfo {
    pub stream: String,
    pub name: String,
    pub pending: u64,
    pub delivered: u64,
    pub ack_pending: u64,
    pub redelivered: u64,
}
