//! # Omega Replication
//!
//! Fetches blocks of a core from untrusted peers and serves our own.
//!
//! **Architecture:** Hexagonal (Domain + Ports/Adapters)
//!
//! ## Purpose
//!
//! Turns application wants (a block, a byte offset, a range, the latest
//! length) into proof requests spread over every connected peer, and routes
//! verified answers back to the callers waiting on them.
//!
//! ## Guarantees
//!
//! | Guarantee | Mechanism |
//! |-----------|-----------|
//! | One request per block | `BlockTracker` entry per `(fork, index)` with fan-out listeners |
//! | One upgrade at a time | Upgrades at the local fork are never sent while one is in flight |
//! | No trust in peers | Every answer goes through `Core::verify` before anything resolves |
//! | Bounded misbehavior | Refused or invalid answers drop the peer's claim; repeat offenders are closed |
//! | Same core, same session | Per-connection capability checked on `open` |
//!
//! ## Module Structure
//!
//! ```text
//! omega-replication/
//! ├── domain/          # RemoteBitfield, trackers, listeners, Peer, Replicator, messages, events
//! ├── ports/           # Transport
//! ├── adapters/        # frame codec, channel multiplexer, in-memory duplex
//! ├── application/     # Hypercore session actor, read and write streams
//! └── config.rs        # ReplicationConfig
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use omega_replication::{duplex, GetOptions, Hypercore, ReplicationConfig};
//!
//! let (a, b) = duplex();
//! writer.replicate(a).await?;
//! reader.replicate(b).await?;
//! let block = reader.get(0, GetOptions::default()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

// Re-exports
pub use adapters::{duplex, encode_frame, DuplexConnection, FrameDecoder, Multiplexer, MuxEvent};
pub use application::{
    DownloadRange, Extension, GetOptions, Hypercore, RangeHandle, ReadStreamOptions, SessionStats,
    WriteStream,
};
pub use config::ReplicationConfig;
pub use domain::{
    BlockTracker, CoreEvent, InflightTracker, Listeners, Message, Peer, PeerId, PeerMessage,
    PeerState, RemoteBitfield, ReplicationError, ReplicationStats, Replicator, Waiter,
};
pub use ports::Transport;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
