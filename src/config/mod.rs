//! Environment-driven configuration.
//!
//! Deployment configures the replicator entirely through environment
//! variables (a `.env` file is honoured for local runs). Every variable has
//! a working default so the binary starts with no configuration at all.

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

/// Runtime configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// MLLP ingress port for the order direction (HIS → PACS).
    pub order_listen_port: u16,
    /// MLLP ingress port for the report direction (PACS → HIS).
    pub report_listen_port: u16,
    /// Egress host for orders.
    pub zenpacs_host: String,
    /// Egress port for orders.
    pub zenpacs_port: u16,
    /// Egress host for reports.
    pub hospital_his_host: String,
    /// Egress port for reports.
    pub hospital_his_port: u16,
    /// Admin HTTP port.
    pub web_port: u16,
    /// On-disk root for durable storage.
    pub db_path: String,
    /// Log level: debug, info, warn, or error.
    pub log_level: String,
}

impl Config {
    /// Load from the environment, falling back to defaults.
    pub fn load() -> Result<Self> {
        // A missing .env file is the normal case outside development.
        let _ = dotenvy::dotenv();

        let config = Self {
            order_listen_port: env_port("ORDER_LISTEN_PORT", 7001),
            report_listen_port: env_port("REPORT_LISTEN_PORT", 7002),
            zenpacs_host: env_string("ZENPACS_HL7_HOST", "194.187.253.34"),
            zenpacs_port: env_port("ZENPACS_HL7_PORT", 2575),
            hospital_his_host: env_string("HOSPITAL_HIS_HOST", "localhost"),
            hospital_his_port: env_port("HOSPITAL_HIS_PORT", 9999),
            web_port: env_port("WEB_PORT", 5678),
            db_path: env_string("DB_PATH", "/data/messages.db"),
            log_level: env_string("LOG_LEVEL", "info"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ports = [
            self.order_listen_port,
            self.report_listen_port,
            self.web_port,
        ];
        for (i, a) in ports.iter().enumerate() {
            for b in ports.iter().skip(i + 1) {
                if a == b {
                    anyhow::bail!("listen ports must be distinct, {a} is used twice");
                }
            }
        }

        if self.db_path.is_empty() {
            anyhow::bail!("DB_PATH must not be empty");
        }

        match self.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("unknown LOG_LEVEL: {other}"),
        }

        Ok(())
    }

    /// Egress endpoint for the order direction.
    pub fn zenpacs_endpoint(&self) -> String {
        format!("{}:{}", self.zenpacs_host, self.zenpacs_port)
    }

    /// Egress endpoint for the report direction.
    pub fn hospital_endpoint(&self) -> String {
        format!("{}:{}", self.hospital_his_host, self.hospital_his_port)
    }
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_port(key: &str, default: u16) -> u16 {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value.parse().unwrap_or_else(|_| {
            warn!(key, value, default, "unparseable port, using default");
            default
        }),
        _ => default,
    }
}
