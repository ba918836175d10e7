//! In-memory storage adapters.

use crate::domain::errors::CoreError;
use crate::ports::outbound::RandomAccess;
use parking_lot::Mutex;
use std::sync::Arc;

/// In-memory storage for tests and ephemeral cores.
///
/// Clones share the same buffer, so a core can be closed and reopened over
/// the same bytes.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStorage {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }
}

impl RandomAccess for MemoryStorage {
    fn read(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>, CoreError> {
        let buf = self.buf.lock();
        let end = offset.saturating_add(length);
        if end > buf.len() as u64 {
            return Ok(None);
        }
        Ok(Some(buf[offset as usize..end as usize].to_vec()))
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), CoreError> {
        let mut buf = self.buf.lock();
        let start = offset as usize;
        let end = start + data.len();
        if end > buf.len() {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, length: u64) -> Result<(), CoreError> {
        self.buf.lock().resize(length as usize, 0);
        Ok(())
    }

    fn len(&self) -> Result<u64, CoreError> {
        Ok(self.buf.lock().len() as u64)
    }
}

/// Storage whose writes fail once armed, for exercising I/O error paths.
#[derive(Clone, Default)]
pub struct FailingStorage {
    inner: MemoryStorage,
    failing: Arc<Mutex<bool>>,
}

impl FailingStorage {
    /// Storage that succeeds until [`fail_writes`](Self::fail_writes) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write and truncate fail.
    pub fn fail_writes(&self) {
        *self.failing.lock() = true;
    }

    fn check(&self) -> Result<(), CoreError> {
        if *self.failing.lock() {
            return Err(CoreError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl RandomAccess for FailingStorage {
    fn read(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>, CoreError> {
        self.inner.read(offset, length)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), CoreError> {
        self.check()?;
        self.inner.write(offset, data)
    }

    fn truncate(&mut self, length: u64) -> Result<(), CoreError> {
        self.check()?;
        self.inner.truncate(length)
    }

    fn len(&self) -> Result<u64, CoreError> {
        self.inner.len()
    }
}
