//! Ports (hexagonal architecture).

pub mod outbound;

pub use outbound::{Authorization, RandomAccess};
