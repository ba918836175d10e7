//! # Core Configuration
//!
//! Options fixed when a core is opened.

use serde::{Deserialize, Serialize};

/// Default largest block produced by chunked appends (64 KiB).
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Core configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Largest block `append_chunked` produces.
    pub max_chunk_size: usize,

    /// Block encryption key. Blocks are stored and replicated encrypted.
    pub encryption_key: Option<[u8; 32]>,

    /// Ignore an existing header and start an empty core.
    pub overwrite: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            encryption_key: None,
            overwrite: false,
        }
    }
}

impl CoreConfig {
    /// Create a config for testing (small chunks).
    pub fn for_testing() -> Self {
        Self {
            max_chunk_size: 1024,
            encryption_key: None,
            overwrite: true,
        }
    }

    /// Encrypt blocks with `key`.
    pub fn with_encryption_key(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Set the chunk size for chunked appends.
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }
}
