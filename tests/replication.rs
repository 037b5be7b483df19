//! End-to-end replication tests.
//!
//! Each test wires real components together: a TCP ingress listener, the
//! durable queue in a temp directory, a forwarder, and a stub MLLP peer
//! standing in for the downstream system.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio_util::codec::Framed;

use hl7d::bootstrap::Shutdown;
use hl7d::codec::{build_ack, extract_ack_code, AckCode, MllpCodec};
use hl7d::egress::MllpClient;
use hl7d::forwarder::{self, ForwarderConfig};
use hl7d::listener::Listener;
use hl7d::queue::{Direction, QueueOptions, QueueSet, Status};

const ORM: &[u8] = b"MSH|^~\\&|HIS|H1|PACS|P1|20240101120000||ORM^O01|MSG001|P|2.5\rPID|1||12345||DOE^JOHN";

fn fast_opts() -> QueueOptions {
    QueueOptions {
        ack_wait: Duration::from_secs(5),
        max_ack_pending: 100,
        base_redelivery_delay: Duration::from_millis(5),
        max_redelivery_delay: Duration::from_millis(20),
    }
}

/// Stub downstream peer acknowledging every message with AA.
async fn accepting_peer() -> u16 {
    let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
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

/// Bind an ingress listener on an ephemeral port and run it.
async fn start_ingress(
    queues: &Arc<QueueSet>,
    direction: Direction,
    destination: String,
    shutdown: &Arc<Shutdown>,
) -> u16 {
    let listener = Listener::bind(
        0,
        direction,
        destination,
        queues.queue(direction).clone(),
        shutdown.clone(),
    )
    .await
    .unwrap();
    let port = listener.local_addr().port();
    tokio::spawn(listener.run());
    port
}

/// Send one raw chunk to an ingress port and read back the ACK code.
///
/// Writes bytes verbatim (no codec) so tests can prepend garbage outside
/// the frame.
async fn submit(port: u16, bytes: &[u8]) -> Option<String> {
    use tokio::io::AsyncWriteExt;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    stream.flush().await.unwrap();

    let mut transport = Framed::new(stream, MllpCodec::new());
    let ack = tokio::time::timeout(Duration::from_secs(5), transport.next())
        .await
        .ok()??
        .ok()?;
    extract_ack_code(&ack)
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn happy_path_order_is_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let queues = QueueSet::open(dir.path(), fast_opts()).unwrap();
    let shutdown = Shutdown::new();

    let egress_port = accepting_peer().await;
    forwarder::start(
        &queues,
        Direction::Order,
        MllpClient::new("127.0.0.1", egress_port),
        ForwarderConfig::default(),
        shutdown.clone(),
    );

    let ingress = start_ingress(
        &queues,
        Direction::Order,
        format!("127.0.0.1:{egress_port}"),
        &shutdown,
    )
    .await;

    let wrapped = hl7d::codec::wrap(ORM);
    let ack = submit(ingress, &wrapped).await;
    assert_eq!(ack.as_deref(), Some("AA"));

    wait_until("order to be forwarded", || {
        queues.stats().counter("successful_orders") == 1
    })
    .await;

    assert_eq!(queues.stats().counter("total_orders"), 1);
    assert_eq!(queues.stats().counter("failed_orders"), 0);
    assert_eq!(queues.orders().depth(), 0);

    let history = queues.history().entries();
    assert_eq!(history.len(), 1);
    let entry = &history[0];
    assert_eq!(entry.status, Status::Forwarded);
    assert!(entry.processed_at.is_some());
    assert_eq!(entry.message_type, "ORM^O01");
    assert_eq!(entry.control_id, "MSG001");
    assert_eq!(entry.patient_id, "12345");
    assert_eq!(entry.patient_name, "DOE JOHN");
    // Forwarded byte-for-byte.
    assert_eq!(entry.raw, ORM);

    shutdown.start_drain();
}

#[tokio::test]
async fn garbage_before_start_block_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let queues = QueueSet::open(dir.path(), fast_opts()).unwrap();
    let shutdown = Shutdown::new();

    let ingress = start_ingress(&queues, Direction::Order, "dest:2575".into(), &shutdown).await;

    let mut bytes = b"junk bytes".to_vec();
    bytes.extend_from_slice(&hl7d::codec::wrap(ORM));

    let ack = submit(ingress, &bytes).await;
    assert_eq!(ack.as_deref(), Some("AA"));
    assert_eq!(queues.orders().depth(), 1);

    shutdown.start_drain();
}

#[tokio::test]
async fn malformed_msh_gets_ae_and_is_not_enqueued() {
    let dir = tempfile::tempdir().unwrap();
    let queues = QueueSet::open(dir.path(), fast_opts()).unwrap();
    let shutdown = Shutdown::new();

    let ingress = start_ingress(&queues, Direction::Order, "dest:2575".into(), &shutdown).await;

    let ack = submit(ingress, &hl7d::codec::wrap(b"ABC|foo")).await;
    assert_eq!(ack.as_deref(), Some("AE"));

    assert_eq!(queues.orders().depth(), 0);
    assert_eq!(queues.stats().counter("total_orders"), 0);

    shutdown.start_drain();
}

#[tokio::test]
async fn msh_with_too_few_fields_gets_ae() {
    let dir = tempfile::tempdir().unwrap();
    let queues = QueueSet::open(dir.path(), fast_opts()).unwrap();
    let shutdown = Shutdown::new();

    let ingress = start_ingress(&queues, Direction::Order, "dest:2575".into(), &shutdown).await;

    let ack = submit(ingress, &hl7d::codec::wrap(b"MSH|^~\\&|HIS|H1")).await;
    assert_eq!(ack.as_deref(), Some("AE"));
    assert_eq!(queues.orders().depth(), 0);

    shutdown.start_drain();
}

#[tokio::test]
async fn framing_error_gets_ae_and_connection_survives() {
    use tokio::io::AsyncWriteExt;

    let dir = tempfile::tempdir().unwrap();
    let queues = QueueSet::open(dir.path(), fast_opts()).unwrap();
    let shutdown = Shutdown::new();

    let ingress = start_ingress(&queues, Direction::Order, "dest:2575".into(), &shutdown).await;

    // A frame whose end block is not followed by CR, then a valid message
    // on the same connection.
    let mut bytes = vec![0x0B];
    bytes.extend_from_slice(b"broken");
    bytes.push(0x1C);
    bytes.push(b'X');
    bytes.extend_from_slice(&hl7d::codec::wrap(ORM));

    let mut stream = TcpStream::connect(("127.0.0.1", ingress)).await.unwrap();
    stream.write_all(&bytes).await.unwrap();

    let mut transport = Framed::new(stream, MllpCodec::new());
    let first = tokio::time::timeout(Duration::from_secs(5), transport.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(extract_ack_code(&first).as_deref(), Some("AE"));

    let second = tokio::time::timeout(Duration::from_secs(5), transport.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(extract_ack_code(&second).as_deref(), Some("AA"));

    assert_eq!(queues.orders().depth(), 1);

    shutdown.start_drain();
}

#[tokio::test]
async fn one_connection_carries_many_messages() {
    let dir = tempfile::tempdir().unwrap();
    let queues = QueueSet::open(dir.path(), fast_opts()).unwrap();
    let shutdown = Shutdown::new();

    let ingress = start_ingress(&queues, Direction::Report, "dest:9999".into(), &shutdown).await;

    let stream = TcpStream::connect(("127.0.0.1", ingress)).await.unwrap();
    let mut transport = Framed::new(stream, MllpCodec::new());

    for i in 0..3 {
        let msg = format!(
            "MSH|^~\\&|PACS|P1|HIS|H1|20240101||ORU^R01|RPT{i}|P|2.5\rPID|1||77{i}||ROE^JANE"
        );
        transport.send(Bytes::from(msg)).await.unwrap();
        let ack = tokio::time::timeout(Duration::from_secs(5), transport.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(extract_ack_code(&ack).as_deref(), Some("AA"));
    }

    assert_eq!(queues.reports().depth(), 3);

    shutdown.start_drain();
}

#[tokio::test]
async fn egress_down_exhausts_deliveries_into_dlq() {
    let dir = tempfile::tempdir().unwrap();
    let queues = QueueSet::open(dir.path(), fast_opts()).unwrap();
    let shutdown = Shutdown::new();

    // Nothing listens on port 1: every dial is refused.
    forwarder::start(
        &queues,
        Direction::Order,
        MllpClient::new("127.0.0.1", 1),
        ForwarderConfig::default(),
        shutdown.clone(),
    );

    let ingress = start_ingress(&queues, Direction::Order, "127.0.0.1:1".into(), &shutdown).await;

    let ack = submit(ingress, &hl7d::codec::wrap(ORM)).await;
    assert_eq!(ack.as_deref(), Some("AA"));

    wait_until("message to be dead-lettered", || !queues.dlq().is_empty()).await;

    let entries = queues.dlq().entries();
    assert_eq!(entries.len(), 1);
    let (key, dead) = &entries[0];
    assert!(key.starts_with(&format!("order_{}_", dead.id)));
    assert_eq!(dead.status, Status::DeadLettered);
    assert_eq!(dead.retry_count, 5, "exactly five attempts, not four, not six");

    assert_eq!(queues.orders().depth(), 0);
    assert_eq!(queues.stats().counter("total_orders"), 1);
    assert_eq!(queues.stats().counter("failed_orders"), 1);
    assert_eq!(queues.stats().counter("successful_orders"), 0);

    shutdown.start_drain();
}

#[tokio::test]
async fn dlq_replay_forwards_once_egress_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let queues = QueueSet::open(dir.path(), fast_opts()).unwrap();
    let shutdown = Shutdown::new();

    // Reserve a port, then close it so the first attempts fail.
    let egress_port = {
        let probe = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };

    forwarder::start(
        &queues,
        Direction::Order,
        MllpClient::new("127.0.0.1", egress_port),
        ForwarderConfig::default(),
        shutdown.clone(),
    );

    let ingress = start_ingress(
        &queues,
        Direction::Order,
        format!("127.0.0.1:{egress_port}"),
        &shutdown,
    )
    .await;

    submit(ingress, &hl7d::codec::wrap(ORM)).await;
    wait_until("message to be dead-lettered", || !queues.dlq().is_empty()).await;

    // Egress comes back on the same port.
    let listener = TokioTcpListener::bind(("127.0.0.1", egress_port))
        .await
        .unwrap();
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

    // Replay: reset and re-publish, then drop the DLQ entry.
    let (key, mut envelope) = queues.dlq().entries().into_iter().next().unwrap();
    let id = envelope.id.clone();
    envelope.retry_count = 0;
    envelope.status = Status::Pending;
    envelope.last_error.clear();
    queues.orders().publish(&envelope).unwrap();
    queues.dlq().remove(&key).unwrap();

    wait_until("replayed message to be forwarded", || {
        queues
            .history()
            .entries()
            .iter()
            .any(|e| e.id == id && e.status == Status::Forwarded)
    })
    .await;

    assert!(queues.dlq().is_empty());
    assert_eq!(queues.orders().depth(), 0);

    shutdown.start_drain();
}
