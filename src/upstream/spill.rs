//! Temp-file overflow for the buffered relay.
//!
//! The file is created on first use and read back through an independent
//! handle, so appends and reads keep their own offsets. `release` drops
//! the file (deleting it); `persist` moves it to its final place. Either
//! happens at most once.

use std::io;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum SpillError {
    #[error("spill file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("cannot persist spill file to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("spill file already released")]
    Released,
}

#[derive(Debug)]
struct SpillFile {
    temp: NamedTempFile,
    writer: File,
    reader: File,
    written: u64,
    read: u64,
}

#[derive(Debug)]
pub struct TempFileSpill {
    dir: Option<PathBuf>,
    file: Option<SpillFile>,
    released: bool,
}

impl TempFileSpill {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            file: None,
            released: false,
        }
    }

    pub fn is_created(&self) -> bool {
        self.file.is_some()
    }

    /// Create the file unless it already exists.
    pub async fn ensure(&mut self) -> Result<(), SpillError> {
        if self.released {
            return Err(SpillError::Released);
        }
        if self.file.is_some() {
            return Ok(());
        }
        let temp = match &self.dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        let writer = File::from_std(temp.reopen()?);
        let reader = File::from_std(temp.reopen()?);
        self.file = Some(SpillFile {
            temp,
            writer,
            reader,
            written: 0,
            read: 0,
        });
        Ok(())
    }

    pub async fn append(&mut self, data: &[u8]) -> Result<(), SpillError> {
        self.ensure().await?;
        let file = self.file.as_mut().ok_or(SpillError::Released)?;
        file.writer.write_all(data).await?;
        file.writer.flush().await?;
        file.written += data.len() as u64;
        metrics::record_spill_bytes(data.len() as u64);
        Ok(())
    }

    /// Next unread bytes, at most `max`. Empty when caught up.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Bytes, SpillError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(Bytes::new());
        };
        let want = (file.written - file.read).min(max as u64) as usize;
        if want == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = BytesMut::zeroed(want);
        file.reader.read_exact(&mut buf).await?;
        file.read += want as u64;
        Ok(buf.freeze())
    }

    /// Written but not yet read back.
    pub fn pending(&self) -> u64 {
        self.file.as_ref().map_or(0, |f| f.written - f.read)
    }

    pub fn len(&self) -> u64 {
        self.file.as_ref().map_or(0, |f| f.written)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.temp.path())
    }

    /// Whole file contents, independent of the read cursor.
    pub async fn read_all(&self) -> Result<Bytes, SpillError> {
        match &self.file {
            Some(file) => Ok(Bytes::from(tokio::fs::read(file.temp.path()).await?)),
            None => Ok(Bytes::new()),
        }
    }

    /// Move the file to `dest`, creating parent directories.
    pub async fn persist(&mut self, dest: &Path) -> Result<(), SpillError> {
        if self.released {
            return Err(SpillError::Released);
        }
        self.ensure().await?;
        let file = self.file.take().ok_or(SpillError::Released)?;
        self.released = true;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        drop(file.writer);
        drop(file.reader);
        file.temp.persist(dest).map_err(|e| SpillError::Persist {
            path: dest.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Delete the file. Returns whether anything was released.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.file.take().is_some()
    }
}
