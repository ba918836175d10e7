//! Application layer - the core service.

pub mod core;

pub use self::core::{
    AppendOutcome, Core, CoreInfo, CoreStats, CoreStorage, ReorgOutcome, VerifyOutcome,
};
