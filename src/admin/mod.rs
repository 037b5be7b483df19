//! Admin HTTP surface.
//!
//! Read-only observability over the durable stores plus one mutator: DLQ
//! replay. JSON over HTTP with CORS enabled so the operator dashboard can
//! be served from anywhere.

mod handlers;
mod server;

pub use server::{AdminServer, AdminState};
