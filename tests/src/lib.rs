//! # Omega Test Suite
//!
//! Scenarios that need more than one crate: two sessions replicating over
//! an in-memory duplex, persisted cores reopened from disk, and property
//! checks of the log against a plain vector model.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── fixtures.rs       # Writer/reader sessions, connect, event waits
//! └── integration/      # Cross-crate flows
//!     ├── replication.rs
//!     ├── reorg.rs
//!     ├── persistence.rs
//!     └── properties.rs
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p omega-tests
//!
//! # By category
//! cargo test -p omega-tests integration::reorg::
//!
//! # Benchmarks
//! cargo bench -p omega-tests
//! ```

#![allow(dead_code)]

pub mod fixtures;
pub mod integration;
