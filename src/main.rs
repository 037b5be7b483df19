use anyhow::Result;
use tracing::info;

use hl7d::bootstrap::Server;
use hl7d::config::Config;
use hl7d::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (to get log settings).
    let config = Config::load()?;

    let json_logs = matches!(std::env::var("LOG_FORMAT").as_deref(), Ok("json"));
    init_tracing(&config.log_level, json_logs)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        order_port = config.order_listen_port,
        report_port = config.report_listen_port,
        web_port = config.web_port,
        zenpacs = %config.zenpacs_endpoint(),
        hospital = %config.hospital_endpoint(),
        db_path = %config.db_path,
        "starting hl7d"
    );

    Server::new(config).run().await
}
