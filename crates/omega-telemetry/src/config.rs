//! Telemetry configuration from environment variables.

use serde::{Deserialize, Serialize};
use std::env;

/// Configuration for logging and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error) or a full
    /// `EnvFilter` directive
    pub log_level: String,

    /// Whether to emit JSON formatted logs
    pub json_logs: bool,

    /// Whether to emit ANSI colours in plain-text logs
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "omega".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `OMEGA_SERVICE_NAME`: Service name (default: omega)
    /// - `OMEGA_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `OMEGA_JSON_LOGS`: Enable JSON logs (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let json_logs = lookup("OMEGA_JSON_LOGS")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        Self {
            service_name: lookup("OMEGA_SERVICE_NAME").unwrap_or_else(|| "omega".to_string()),
            log_level: lookup("OMEGA_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or_else(|| "info".to_string()),
            json_logs,
            ansi: !json_logs,
        }
    }

    /// Configuration for tests: debug level, no colours.
    pub fn for_testing() -> Self {
        Self {
            service_name: "omega-test".to_string(),
            log_level: "debug".to_string(),
            json_logs: false,
            ansi: false,
        }
    }
}
