//! Durable, lock-guarded per-container configuration file.
//!
//! The file is opened once when the container is created and held with an
//! exclusive `flock` until the container is reaped, so no second process can
//! mutate the same container's declared arguments.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use tracing::{trace, warn};

use super::args::ContainerArgs;
use crate::error::StoreError;

/// Locked JSON file holding a container's [`ContainerArgs`].
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    file: Option<File>,
}

impl ConfigStore {
    /// Opens (creating if needed) and exclusively locks the file at `path`.
    ///
    /// Blocks while another holder keeps the lock.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::IoError` if the file cannot be opened or locked.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::IoError {
                context: format!("failed to open {}", path.display()),
                source: e,
            })?;
        file.lock_exclusive().map_err(|e| StoreError::IoError {
            context: format!("failed to lock {}", path.display()),
            source: e,
        })?;
        trace!(path = %path.display(), "Config store locked");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> Result<&mut File, StoreError> {
        let path = self.path.display().to_string();
        self.file.as_mut().ok_or_else(|| StoreError::IoError {
            context: format!("config store {path} was released"),
            source: std::io::Error::from(std::io::ErrorKind::NotConnected),
        })
    }

    /// Replaces the file content with `args`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::IoError` on write failure.
    pub fn write(&mut self, args: &ContainerArgs) -> Result<(), StoreError> {
        let mut content = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut content, PrettyFormatter::with_indent(b" "));
        args.serialize(&mut serializer)
            .map_err(|e| StoreError::Corrupt {
                path: self.path.clone(),
                source: e,
            })?;
        content.push(b'\n');

        let path = self.path.clone();
        let io = |context: &str, e: std::io::Error| StoreError::IoError {
            context: format!("failed to {context} {}", path.display()),
            source: e,
        };

        let file = self.file()?;
        file.set_len(0).map_err(|e| io("truncate", e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| io("seek", e))?;
        file.write_all(&content).map_err(|e| io("write", e))?;
        file.sync_all().map_err(|e| io("sync", e))
    }

    /// Reads the arguments back from the file.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Corrupt` if the content does not decode.
    pub fn load(&mut self) -> Result<ContainerArgs, StoreError> {
        let path = self.path.clone();
        let file = self.file()?;
        let mut content = String::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_string(&mut content))
            .map_err(|e| StoreError::IoError {
                context: format!("failed to read {}", path.display()),
                source: e,
            })?;
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt { path, source: e })
    }

    /// Unlocks and closes the file; later reads and writes fail.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(path = %self.path.display(), error = %e, "Failed to unlock config store");
            }
        }
    }
}

impl Drop for ConfigStore {
    fn drop(&mut self) {
        self.release();
    }
}
