//! Message forwarder.
//!
//! One consumer per direction drains the durable queue and drives the MLLP
//! egress client. Per delivery:
//!
//! - positive ACK downstream → mark forwarded, write history, ack
//! - failure with deliveries remaining → nack for redelivery
//! - failure with deliveries exhausted → dead-letter, write history, ack
//!
//! Statistics are first-attempt accounted: `total_*` and `failed_*` move
//! only on the first delivery of an envelope, so redeliveries do not
//! inflate the counters.

mod processor;

pub use processor::Forwarder;

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::bootstrap::Shutdown;
use crate::egress::MllpClient;
use crate::queue::{Direction, QueueSet};

/// Delivery attempts before an envelope is dead-lettered.
pub const MAX_DELIVER: u64 = 5;

/// Forwarder tunables.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub max_deliver: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_deliver: MAX_DELIVER,
        }
    }
}

/// Spawn the consumer loop for one direction.
pub fn start(
    queues: &Arc<QueueSet>,
    direction: Direction,
    client: MllpClient,
    config: ForwarderConfig,
    shutdown: Arc<Shutdown>,
) -> JoinHandle<()> {
    let forwarder = Forwarder::new(queues, direction, client, config);
    tokio::spawn(async move { forwarder.run(shutdown).await })
}
