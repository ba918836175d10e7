//! Shared setup for the integration flows.

use std::sync::{Arc, Once};
use std::time::Duration;

use omega_core::{CoreConfig, CoreStorage, Ed25519Authorization};
use omega_replication::{duplex, CoreEvent, Hypercore, ReplicationConfig};
use omega_telemetry::TelemetryConfig;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Upper bound for anything that crosses a connection.
pub const WAIT: Duration = Duration::from_secs(10);

static TRACING: Once = Once::new();

/// Install test logging once per process. Later calls are no-ops.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = omega_telemetry::init_logging(&TelemetryConfig::for_testing());
    });
}

/// Writable in-memory session.
pub fn writer() -> Hypercore {
    writer_with(CoreConfig::for_testing())
}

/// Writable in-memory session with a custom core configuration.
pub fn writer_with(core_config: CoreConfig) -> Hypercore {
    init_tracing();
    Hypercore::memory(core_config, ReplicationConfig::for_testing())
        .expect("in-memory writer")
}

/// Read-only in-memory session for `writer`'s key.
pub fn reader_of(writer: &Hypercore) -> Hypercore {
    reader_with(writer, CoreConfig::for_testing())
}

/// Read-only session for `writer`'s key with a custom core configuration.
pub fn reader_with(writer: &Hypercore, core_config: CoreConfig) -> Hypercore {
    init_tracing();
    let auth = Ed25519Authorization::from_public_key(writer.key()).expect("valid public key");
    Hypercore::open(
        CoreStorage::memory(),
        Arc::new(auth),
        core_config,
        ReplicationConfig::for_testing(),
    )
    .expect("in-memory reader")
}

/// Replicate `a` and `b` over a fresh duplex. `a` initiates.
pub async fn connect(a: &Hypercore, b: &Hypercore) {
    let (left, right) = duplex();
    a.replicate(left).await.expect("replicate initiator");
    b.replicate(right).await.expect("replicate responder");
}

/// Block until `wanted` shows up on `events`.
pub async fn wait_for(events: &mut broadcast::Receiver<CoreEvent>, wanted: CoreEvent) {
    let found = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if event == wanted => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await;
    assert_eq!(found, Ok(true), "never saw {:?}", wanted);
}

/// Events already buffered on `events`.
pub fn drain(events: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return seen,
        }
    }
}
