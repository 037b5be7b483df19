//! Tracing initialisation.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set. `json_logs` switches
/// the format for log shippers; the default human format is used otherwise.
pub fn init_tracing(log_level: &str, json_logs: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if json_logs {
        subscriber.with(fmt::layer().json().with_target(true)).init();
    } else {
        subscriber.with(fmt::layer().compact().with_target(true)).init();
    }

    info!(log_level, json_logs, "tracing initialized");
    Ok(())
}
