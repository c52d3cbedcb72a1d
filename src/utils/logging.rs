//! Structured logging setup
//!
//! Installs a global `tracing` subscriber from a [`LoggingConfig`]: an
//! `EnvFilter` (honouring `RUST_LOG`, falling back to the configured level),
//! plus console and/or file output in plain or JSON form.

use crate::config::LoggingConfig;
use crate::error::{Result, TransportError};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<tracing_subscriber::layer::Layered<EnvFilter, Registry>> + Send + Sync>;

/// Build the filter: `RUST_LOG` wins, otherwise the configured level.
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()))
}

/// Initialize the global subscriber.
///
/// Fails if a subscriber is already installed or the log file cannot be opened.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let mut outputs: Vec<BoxedLayer> = Vec::new();

    if config.log_to_console {
        let layer = tracing_subscriber::fmt::layer().with_target(true);
        if config.json_format {
            outputs.push(Box::new(layer.json()));
        } else {
            outputs.push(Box::new(layer));
        }
    }

    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            TransportError::ConfigError(
                "log_file_path must be specified when log_to_file is true".into(),
            )
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TransportError::ConfigError(format!("Failed to open log file: {e}")))?;

        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file));
        if config.json_format {
            outputs.push(Box::new(layer.json()));
        } else {
            outputs.push(Box::new(layer));
        }
    }

    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(outputs)
        .try_init()
        .map_err(|e| TransportError::ConfigError(format!("Failed to install logger: {e}")))?;

    info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}
