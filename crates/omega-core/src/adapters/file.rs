//! File-backed storage.
//!
//! Each region lives in its own file; the file is locked exclusively with
//! `fs2` so two processes never open the same core.

use crate::domain::errors::CoreError;
use crate::ports::outbound::RandomAccess;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Random-access storage over a single file.
pub struct FileStorage {
    file: File,
    path: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) and lock the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|e| {
            CoreError::Storage(format!("{} is locked: {}", path.display(), e))
        })?;

        tracing::debug!(path = %path.display(), "opened file storage");

        Ok(Self { file, path })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RandomAccess for FileStorage {
    fn read(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>, CoreError> {
        let size = self.file.metadata()?.len();
        if offset.saturating_add(length) > size {
            return Ok(None);
        }

        let mut buf = vec![0u8; length as usize];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), CoreError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn truncate(&mut self, length: u64) -> Result<(), CoreError> {
        self.file.set_len(length)?;
        Ok(())
    }

    fn len(&self) -> Result<u64, CoreError> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&mut self) -> Result<(), CoreError> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        // Release the flock
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
