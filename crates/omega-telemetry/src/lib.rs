//! # Omega Telemetry
//!
//! Logging and metrics for Omega processes.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` with an env filter, plain or JSON output
//! - **Metrics**: Prometheus counters and gauges for the replication scheduler
//!
//! ## Usage
//!
//! ```rust,ignore
//! use omega_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() {
//!     init_telemetry(&TelemetryConfig::from_env()).expect("telemetry");
//!     // Logs and metrics are now being collected
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OMEGA_SERVICE_NAME` | `omega` | Service name in logs |
//! | `OMEGA_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `OMEGA_JSON_LOGS` | `false` | JSON output |

#![warn(missing_docs)]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{env_filter, init_logging};
pub use metrics::{
    gather_text, register_metrics, BLOCKS_DOWNLOADED, BLOCKS_UPLOADED, INFLIGHT_REQUESTS,
    INVALID_RESPONSES, PEERS_CONNECTED, REORGS_APPLIED, REGISTRY,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    /// A global subscriber is already installed.
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),

    /// Metric registration or encoding failed.
    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    /// Configuration could not be applied.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Install logging and register metrics.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    register_metrics()?;
    init_logging(config)
}

/// Convenience macro for recording a metric increment.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}
