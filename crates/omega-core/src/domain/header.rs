//! Core info header.
//!
//! Stored at offset 0 of the info storage as `u32le(len) || bincode(Header)`.

use crate::domain::errors::CoreError;
use crate::ports::outbound::RandomAccess;
use serde::{Deserialize, Serialize};

/// Persistent identity and tree state of a core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Public key identifying the core.
    pub public_key: [u8; 32],
    /// Secret seed of the signing key, for writable cores.
    pub secret_key: Option<[u8; 32]>,
    /// Signature over the current tree state.
    pub signature: Option<Vec<u8>>,
    /// Current fork id.
    pub fork: u64,
    /// Current length in blocks.
    pub length: u64,
}

impl Header {
    /// Fresh header for an empty core.
    pub fn new(public_key: [u8; 32], secret_key: Option<[u8; 32]>) -> Self {
        Self {
            public_key,
            secret_key,
            signature: None,
            fork: 0,
            length: 0,
        }
    }

    /// Encode with a length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let body = bincode::serialize(self).map_err(|e| CoreError::Header(e.to_string()))?;
        let len = u32::try_from(body.len())
            .map_err(|_| CoreError::Header("header too large".to_string()))?;

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a length-prefixed header.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < 4 {
            return Err(CoreError::Header("truncated length prefix".to_string()));
        }
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&bytes[..4]);
        let len = u32::from_le_bytes(prefix) as usize;

        let body = bytes
            .get(4..4 + len)
            .ok_or_else(|| CoreError::Header("truncated body".to_string()))?;
        bincode::deserialize(body).map_err(|e| CoreError::Header(e.to_string()))
    }

    /// Read the header, or `None` if nothing was ever written.
    pub fn read_from(storage: &dyn RandomAccess) -> Result<Option<Self>, CoreError> {
        let size = storage.len()?;
        if size == 0 {
            return Ok(None);
        }
        let bytes = storage
            .read(0, size)?
            .ok_or_else(|| CoreError::Header("header vanished while reading".to_string()))?;
        Self::decode(&bytes).map(Some)
    }

    /// Replace the stored header.
    pub fn write_to(&self, storage: &mut dyn RandomAccess) -> Result<(), CoreError> {
        let bytes = self.encode()?;
        storage.write(0, &bytes)?;
        storage.truncate(bytes.len() as u64)?;
        storage.sync()
    }
}
