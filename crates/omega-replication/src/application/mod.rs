//! Application layer - the async session handle and its block streams.

pub mod session;
pub mod streams;

pub use session::{DownloadRange, Extension, GetOptions, Hypercore, RangeHandle, SessionStats};
pub use streams::{ReadStreamOptions, WriteStream};
