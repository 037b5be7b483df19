//! Per-connection MLLP read loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::bootstrap::ShutdownState;
use crate::codec::{build_ack, parse_header, AckCode, CodecError, MllpCodec};
use crate::queue::{Direction, DirectionQueue, Envelope};

/// Read deadline per frame. The timeout exists so the loop observes the
/// shutdown signal on quiet connections; it is not an error.
const READ_DEADLINE: Duration = Duration::from_secs(30);

/// Drive one inbound MLLP connection until EOF, an I/O error, or shutdown.
pub async fn handle(
    stream: TcpStream,
    peer: SocketAddr,
    direction: Direction,
    destination: String,
    queue: Arc<DirectionQueue>,
    mut shutdown: watch::Receiver<ShutdownState>,
) {
    debug!("mllp connection opened");
    let mut transport = Framed::new(stream, MllpCodec::new());

    loop {
        if *shutdown.borrow() != ShutdownState::Running {
            debug!("closing connection for shutdown");
            break;
        }

        let read = tokio::select! {
            biased;

            _ = shutdown.changed() => continue,

            read = tokio::time::timeout(READ_DEADLINE, transport.next()) => read,
        };

        let frame = match read {
            Err(_) => continue,
            Ok(None) => {
                debug!("connection closed by peer");
                break;
            }
            Ok(Some(Err(CodecError::Io(e)))) => {
                error!(error = %e, "read error");
                break;
            }
            Ok(Some(Err(e))) => {
                // Framing error: answer AE and resynchronise on the next
                // start block.
                warn!(error = %e, "framing error");
                if let Err(e) = transport.send(build_ack(&[], AckCode::Ae)).await {
                    error!(error = %e, "ack write failed");
                    break;
                }
                // A decode error fuses the framed stream; rebuild it around
                // the same socket and buffers to keep reading.
                transport = Framed::from_parts(transport.into_parts());
                continue;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let ack = accept_message(&frame, peer, direction, &destination, &queue);
        if let Err(e) = transport.send(build_ack(&frame, ack)).await {
            error!(error = %e, "ack write failed");
            break;
        }
    }
}

/// Parse and durably enqueue one message. Returns the ACK code to send:
/// AA only once the envelope is on disk.
fn accept_message(
    frame: &Bytes,
    peer: SocketAddr,
    direction: Direction,
    destination: &str,
    queue: &DirectionQueue,
) -> AckCode {
    let header = match parse_header(frame) {
        Ok(header) => header,
        Err(e) => {
            warn!(error = %e, "rejecting unparseable message");
            return AckCode::Ae;
        }
    };

    let envelope = Envelope::new(
        direction,
        &peer.to_string(),
        destination,
        frame.to_vec(),
    )
    .with_header(&header);

    match queue.publish(&envelope) {
        Ok(seq) => {
            info!(
                id = %envelope.id,
                seq,
                message_type = %envelope.message_type,
                patient_id = %envelope.patient_id,
                "message received and enqueued"
            );
            AckCode::Aa
        }
        Err(e) => {
            error!(id = %envelope.id, error = %e, "enqueue failed");
            AckCode::Ae
        }
    }
}
