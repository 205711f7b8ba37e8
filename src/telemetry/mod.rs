//! Telemetry module for logging and metrics.
//!
//! Provides:
//! - Logging configuration and initialization
//! - Counters for verdict bridge statistics

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig};
pub use metrics::{BridgeMetrics, Counter};
