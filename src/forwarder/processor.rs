//! Per-direction consumer loop.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::bootstrap::Shutdown;
use crate::egress::{EgressError, MllpClient};
use crate::queue::{
    Delivery, Direction, DirectionQueue, DlqBucket, Envelope, HistoryBucket, QueueSet,
    StatsBucket, Status,
};

use super::ForwarderConfig;

/// Consumer for one direction: fetch, send, and settle.
pub struct Forwarder {
    direction: Direction,
    queue: Arc<DirectionQueue>,
    dlq: DlqBucket,
    history: HistoryBucket,
    stats: Arc<StatsBucket>,
    client: MllpClient,
    max_deliver: u64,
}

impl Forwarder {
    pub fn new(
        queues: &Arc<QueueSet>,
        direction: Direction,
        client: MllpClient,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            direction,
            queue: queues.queue(direction).clone(),
            dlq: queues.dlq().clone(),
            history: queues.history().clone(),
            stats: queues.stats().clone(),
            client,
            max_deliver: config.max_deliver,
        }
    }

    /// Run until shutdown. An in-flight send finishes or times out before
    /// the loop exits; unacknowledged entries redeliver on next start.
    pub async fn run(self, shutdown: Arc<Shutdown>) {
        info!(
            direction = %self.direction,
            destination = %self.client.addr(),
            max_deliver = self.max_deliver,
            "forwarder started"
        );

        let mut shutdown_rx = shutdown.subscribe();
        while let Some(delivery) = self.queue.fetch(&mut shutdown_rx).await {
            self.process(delivery).await;
        }

        info!(direction = %self.direction, "forwarder stopped");
    }

    pub(crate) async fn process(&self, delivery: Delivery) {
        let Delivery {
            seq,
            num_delivered,
            envelope,
        } = delivery;

        info!(
            id = %envelope.id,
            message_type = %envelope.message_type,
            patient_id = %envelope.patient_id,
            attempt = num_delivered,
            "forwarding message"
        );

        match self.client.send(&envelope.raw).await {
            Ok(()) => self.settle_success(seq, num_delivered, envelope),
            Err(e) => self.settle_failure(seq, num_delivered, envelope, e),
        }
    }

    fn settle_success(&self, seq: u64, num_delivered: u64, mut envelope: Envelope) {
        envelope.status = Status::Forwarded;
        envelope.processed_at = Some(Utc::now());
        envelope.last_error.clear();

        let plural = self.direction.plural();
        if num_delivered == 1 {
            self.stats.increment(&format!("total_{plural}"));
        }
        self.stats.increment(&format!("successful_{plural}"));
        self.stats
            .set_timestamp(&format!("last_{}_time", self.direction), Utc::now());

        if let Err(e) = self.history.put(&envelope) {
            error!(id = %envelope.id, error = %e, "history write failed");
        }

        if let Err(e) = self.queue.ack(seq) {
            // A failed ack after a successful send redelivers the entry and
            // the peer sees a duplicate.
            error!(id = %envelope.id, seq, error = %e, "ack after successful send failed");
            return;
        }

        info!(
            id = %envelope.id,
            destination = %self.client.addr(),
            "message forwarded"
        );
    }

    fn settle_failure(&self, seq: u64, num_delivered: u64, mut envelope: Envelope, err: EgressError) {
        envelope.retry_count = num_delivered;
        envelope.last_error = err.to_string();

        let plural = self.direction.plural();
        if num_delivered == 1 {
            self.stats.increment(&format!("total_{plural}"));
            self.stats.increment(&format!("failed_{plural}"));
        }

        if num_delivered >= self.max_deliver {
            envelope.status = Status::DeadLettered;

            let key = match self.dlq.put(&envelope) {
                Ok(key) => key,
                Err(e) => {
                    // Without a DLQ record the entry must stay in the
                    // queue; redeliver instead of acking it away.
                    error!(id = %envelope.id, error = %e, "dlq write failed, entry stays queued");
                    if let Err(e) = self.queue.nack(seq) {
                        error!(id = %envelope.id, seq, error = %e, "nack failed");
                    }
                    return;
                }
            };

            if let Err(e) = self.history.put(&envelope) {
                error!(id = %envelope.id, error = %e, "history write failed");
            }

            if let Err(e) = self.queue.ack(seq) {
                error!(id = %envelope.id, seq, error = %e, "ack after dlq promotion failed");
            }

            warn!(
                id = %envelope.id,
                key = %key,
                attempts = num_delivered,
                error = %envelope.last_error,
                "message dead-lettered"
            );
            return;
        }

        error!(
            id = %envelope.id,
            attempt = num_delivered,
            error = %envelope.last_error,
            "delivery failed, scheduling redelivery"
        );

        if let Err(e) = self.queue.nack(seq) {
            error!(id = %envelope.id, seq, error = %e, "nack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::ShutdownState;
    use crate::codec::{build_ack, AckCode, MllpCodec};
    use crate::queue::QueueOptions;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::watch;
    use tokio_util::codec::Framed;

    const ORM: &[u8] = b"MSH|^~\\&|HIS|H1|PACS|P1|20240101||ORM^O01|MSG001|P|2.5\rPID|1||12345||DOE^JOHN";

    fn fast_opts() -> QueueOptions {
        QueueOptions {
            ack_wait: Duration::from_millis(500),
            max_ack_pending: 100,
            base_redelivery_delay: Duration::from_millis(5),
            max_redelivery_delay: Duration::from_millis(20),
        }
    }

    async fn accepting_peer() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut transport = Framed::new(stream, MllpCodec::new());
                    while let Some(Ok(frame)) = transport.next().await {
                        let ack = build_ack(&frame, AckCode::Aa);
                        if transport.send(ack).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    fn forwarder_for(
        queues: &Arc<QueueSet>,
        port: u16,
        max_deliver: u64,
    ) -> Forwarder {
        let client = MllpClient::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
        Forwarder::new(
            queues,
            Direction::Order,
            client,
            ForwarderConfig { max_deliver },
        )
    }

    #[tokio::test]
    async fn successful_delivery_acks_and_counts_once() {
        let dir = tempfile::tempdir().unwrap();
        let queues = QueueSet::open(dir.path(), fast_opts()).unwrap();
        let port = accepting_peer().await;
        let forwarder = forwarder_for(&queues, port, 5);

        let envelope = Envelope::new(Direction::Order, "peer:1", "dest:2575", ORM.to_vec());
        queues.orders().publish(&envelope).unwrap();

        let (_tx, mut rx) = watch::channel(ShutdownState::Running);
        let delivery = queues.orders().fetch(&mut rx).await.unwrap();
        forwarder.process(delivery).await;

        assert_eq!(queues.orders().depth(), 0);
        assert_eq!(queues.stats().counter("total_orders"), 1);
        assert_eq!(queues.stats().counter("successful_orders"), 1);
        assert_eq!(queues.stats().counter("failed_orders"), 0);
        assert!(queues.stats().timestamp("last_order_time").is_some());

        let history = queues.history().entries();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, Status::Forwarded);
        assert!(history[0].processed_at.is_some());
        assert_eq!(history[0].raw, ORM);
    }

    #[tokio::test]
    async fn exhausted_deliveries_move_to_dlq() {
        let dir = tempfile::tempdir().unwrap();
        let queues = QueueSet::open(dir.path(), fast_opts()).unwrap();
        // Nothing listens on port 1.
        let forwarder = forwarder_for(&queues, 1, 2);

        let envelope = Envelope::new(Direction::Order, "peer:1", "dest:2575", ORM.to_vec());
        queues.orders().publish(&envelope).unwrap();

        let (_tx, mut rx) = watch::channel(ShutdownState::Running);
        for _ in 0..2 {
            let delivery = queues.orders().fetch(&mut rx).await.unwrap();
            forwarder.process(delivery).await;
        }

        // Removed from the active queue, parked in the DLQ.
        assert_eq!(queues.orders().depth(), 0);
        let (key, dead) = queues.dlq().find_by_id(&envelope.id).unwrap();
        assert!(key.starts_with("order_"));
        assert_eq!(dead.status, Status::DeadLettered);
        assert_eq!(dead.retry_count, 2);
        assert!(!dead.last_error.is_empty());

        // First-attempt accounting: one total, one failed, despite two
        // attempts and a DLQ promotion.
        assert_eq!(queues.stats().counter("total_orders"), 1);
        assert_eq!(queues.stats().counter("failed_orders"), 1);
        assert_eq!(queues.stats().counter("successful_orders"), 0);

        let history = queues.history().entries();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, Status::DeadLettered);
    }

    #[tokio::test]
    async fn retry_after_failure_counts_success_without_new_total() {
        let dir = tempfile::tempdir().unwrap();
        let queues = QueueSet::open(dir.path(), fast_opts()).unwrap();

        let envelope = Envelope::new(Direction::Order, "peer:1", "dest:2575", ORM.to_vec());
        queues.orders().publish(&envelope).unwrap();
        let (_tx, mut rx) = watch::channel(ShutdownState::Running);

        // First attempt against a dead port.
        let failing = forwarder_for(&queues, 1, 5);
        let delivery = queues.orders().fetch(&mut rx).await.unwrap();
        failing.process(delivery).await;
        assert_eq!(queues.stats().counter("failed_orders"), 1);

        // Peer comes up; redelivery succeeds.
        let port = accepting_peer().await;
        let recovering = forwarder_for(&queues, port, 5);
        let delivery = queues.orders().fetch(&mut rx).await.unwrap();
        assert_eq!(delivery.num_delivered, 2);
        recovering.process(delivery).await;

        assert_eq!(queues.orders().depth(), 0);
        assert_eq!(queues.stats().counter("total_orders"), 1);
        assert_eq!(queues.stats().counter("successful_orders"), 1);
        assert_eq!(queues.stats().counter("failed_orders"), 1);
    }
}
