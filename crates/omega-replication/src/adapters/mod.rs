//! Adapters layer - wire encoding and transports.
//!
//! - `codec`: length-prefixed bincode frames
//! - `mux`: per-connection channel aliases
//! - `duplex`: in-memory transport pair

pub mod codec;
pub mod duplex;
pub mod mux;

pub use codec::{encode_frame, FrameDecoder, MAX_FRAME_SIZE};
pub use duplex::{duplex, DuplexConnection};
pub use mux::{Multiplexer, MuxEvent};
