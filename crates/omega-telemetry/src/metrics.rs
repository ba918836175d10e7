//! Prometheus metrics for replication.
//!
//! All metrics follow the naming convention: `omega_<area>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., blocks_downloaded_total)
//! - **Gauge**: Value that can go up or down (e.g., peers_connected)

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // BLOCK TRANSFER
    // =========================================================================

    /// Blocks verified and stored from peers
    pub static ref BLOCKS_DOWNLOADED: Counter = Counter::new(
        "omega_replication_blocks_downloaded_total",
        "Total number of blocks verified and stored from peers"
    ).expect("metric creation failed");

    /// Blocks served to peers
    pub static ref BLOCKS_UPLOADED: Counter = Counter::new(
        "omega_replication_blocks_uploaded_total",
        "Total number of blocks sent to peers"
    ).expect("metric creation failed");

    // =========================================================================
    // VERIFICATION
    // =========================================================================

    /// Responses rejected during verification, by reason
    pub static ref INVALID_RESPONSES: CounterVec = CounterVec::new(
        Opts::new("omega_replication_invalid_responses_total", "Responses that failed verification"),
        &["reason"]  // reason: proof/signature
    ).expect("metric creation failed");

    /// Fork switches applied
    pub static ref REORGS_APPLIED: Counter = Counter::new(
        "omega_replication_reorgs_applied_total",
        "Total number of fork switches applied"
    ).expect("metric creation failed");

    // =========================================================================
    // SCHEDULER
    // =========================================================================

    /// Requests currently awaiting an answer
    pub static ref INFLIGHT_REQUESTS: Gauge = Gauge::new(
        "omega_replication_inflight_requests",
        "Number of requests awaiting an answer"
    ).expect("metric creation failed");

    /// Peers with an open channel
    pub static ref PEERS_CONNECTED: Gauge = Gauge::new(
        "omega_replication_peers_connected",
        "Number of peers with an open channel"
    ).expect("metric creation failed");
}

/// Register all metrics with the global registry.
///
/// Fails with [`TelemetryError::MetricsInit`] when called twice.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(BLOCKS_DOWNLOADED.clone()),
        Box::new(BLOCKS_UPLOADED.clone()),
        Box::new(INVALID_RESPONSES.clone()),
        Box::new(REORGS_APPLIED.clone()),
        Box::new(INFLIGHT_REQUESTS.clone()),
        Box::new(PEERS_CONNECTED.clone()),
    ];

    for metric in metrics {
        REGISTRY
            .register(metric)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }
    Ok(())
}

/// Encode all registered metrics as Prometheus text format.
pub fn gather_text() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
