//! # Utility Modules
//!
//! Supporting utilities for observability.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup from `LoggingConfig`
//! - **Metrics**: Thread-safe transport counters and per-connection
//!   sliding-window bandwidth statistics

pub mod logging;
pub mod metrics;

// Re-export public types for advanced users
pub use metrics::{global_metrics, BufferStatistics, Metrics, MetricsSnapshot};
