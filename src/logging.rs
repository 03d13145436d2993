//! Structured logging for the transaction manager binaries

use anyhow::Result;
use std::io;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Logging configuration
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON format (default: true for production)
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
        }
    }
}

impl LogConfig {
    /// Production logging config (JSON, INFO level)
    pub fn production() -> Self {
        Self::default()
    }

    /// Development logging config (pretty, DEBUG level)
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
        }
    }
}

/// Initialize structured logging with the given configuration
pub fn init_logging(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    if config.json_format {
        let fmt_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(io::stderr);
        tracing::subscriber::set_global_default(Registry::default().with(filter).with(fmt_layer))?;
    } else {
        let fmt_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_writer(io::stderr);
        tracing::subscriber::set_global_default(Registry::default().with(filter).with(fmt_layer))?;
    }

    Ok(())
}

/// Initialize logging from environment variables
/// RUST_LOG - log level (trace, debug, info, warn, error)
/// DTXN_LOG_FORMAT - json or pretty (default: json)
pub fn init_from_env() -> Result<()> {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let json_format = std::env::var("DTXN_LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(true);

    init_logging(LogConfig { level, json_format })
}
