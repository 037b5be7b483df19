//! Process lifecycle: startup orchestration and graceful shutdown.

mod server;
mod shutdown;

pub use server::Server;
pub use shutdown::{Shutdown, State as ShutdownState};
