//! MLLP ingress.
//!
//! One TCP listener per direction. Each accepted connection runs an
//! independent read loop and may carry many messages over its lifetime.
//! A message is acknowledged with AA only after it has been durably
//! enqueued; parse and persist failures are answered with AE so the sender
//! can retry.

mod acceptor;
mod connection;

pub use acceptor::Listener;
