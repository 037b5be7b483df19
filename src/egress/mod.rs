//! Outbound MLLP client.
//!
//! Dials the downstream peer, sends one framed message, reads the ACK, and
//! interprets the MSA code. Every failure mode is retryable from the
//! forwarder's point of view; classification exists for logging and audit.

mod pool;

pub use pool::{ConnectionPool, Transport};

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::codec::{extract_ack_code, CodecError, MllpCodec};

/// Default deadline for connect, write, and ACK read.
const IO_TIMEOUT: Duration = Duration::from_secs(30);
/// Probe dial deadline for health checks.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long an idle pooled connection stays reusable.
const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Errors from one delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write failed: {0}")]
    Write(std::io::Error),

    #[error("ACK read failed: {0}")]
    Read(std::io::Error),

    #[error("ACK framing error: {0}")]
    Frame(CodecError),

    #[error("ACK has no MSA segment")]
    Parse,

    #[error("negative ACK received: {0}")]
    NegativeAck(String),
}

/// MLLP client for one egress target.
pub struct MllpClient {
    host: String,
    port: u16,
    timeout: Duration,
    pool: ConnectionPool,
}

impl MllpClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let addr = format!("{host}:{port}");
        Self {
            host,
            port,
            timeout: IO_TIMEOUT,
            pool: ConnectionPool::new(addr, KEEP_ALIVE),
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Send one message and wait for a positive ACK (AA or CA).
    ///
    /// A pooled connection is tried first; any failure on the pooled path
    /// falls back to a fresh dial before an error is surfaced.
    pub async fn send(&self, payload: &[u8]) -> Result<(), EgressError> {
        if let Some(mut transport) = self.pool.take().await {
            match self.exchange(&mut transport, payload).await {
                Ok(()) => {
                    self.pool.put(transport).await;
                    return Ok(());
                }
                Err(e) => {
                    debug!(target = %self.pool.addr(), error = %e, "pooled send failed, redialing");
                }
            }
        }

        let mut transport = self.dial(self.timeout).await?;
        let result = self.exchange(&mut transport, payload).await;
        if result.is_ok() {
            self.pool.put(transport).await;
        }
        result
    }

    /// Probe reachability without sending a message.
    pub async fn test_connection(&self) -> Result<(), EgressError> {
        let transport = self.dial(PROBE_TIMEOUT).await?;
        drop(transport);
        Ok(())
    }

    async fn dial(&self, deadline: Duration) -> Result<Transport, EgressError> {
        let addr = self.addr();
        let stream = tokio::time::timeout(deadline, TcpStream::connect(&addr))
            .await
            .map_err(|_| EgressError::Connect {
                addr: addr.clone(),
                source: std::io::ErrorKind::TimedOut.into(),
            })?
            .map_err(|source| EgressError::Connect {
                addr: addr.clone(),
                source,
            })?;

        trace!(target = %addr, "connected");
        Ok(Framed::new(stream, MllpCodec::new()))
    }

    async fn exchange(&self, transport: &mut Transport, payload: &[u8]) -> Result<(), EgressError> {
        tokio::time::timeout(self.timeout, transport.send(Bytes::copy_from_slice(payload)))
            .await
            .map_err(|_| EgressError::Write(std::io::ErrorKind::TimedOut.into()))?
            .map_err(|e| match e {
                CodecError::Io(io) => EgressError::Write(io),
                other => EgressError::Frame(other),
            })?;

        let ack = tokio::time::timeout(self.timeout, transport.next())
            .await
            .map_err(|_| EgressError::Read(std::io::ErrorKind::TimedOut.into()))?
            .ok_or(EgressError::Frame(CodecError::MissingStartBlock))?
            .map_err(|e| match e {
                CodecError::Io(io) => EgressError::Read(io),
                other => EgressError::Frame(other),
            })?;

        let code = extract_ack_code(&ack).ok_or(EgressError::Parse)?;
        match code.as_str() {
            "AA" | "CA" => {
                trace!(target = %self.pool.addr(), ack = %code, "message accepted");
                Ok(())
            }
            other => Err(EgressError::NegativeAck(other.to_string())),
        }
    }
}
