//! # Integration Flows
//!
//! Two or more sessions wired together over in-memory duplex connections.

pub mod adversarial;
pub mod persistence;
pub mod properties;
pub mod reorg;
pub mod replication;
