//! Durable LSN watermark.
//!
//! The watermark `w` means every effect with LSN <= `w` is captured in the
//! latest snapshot. It only ever moves forward.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Result, WatermarkError};

/// File name of the watermark inside the WAL root.
pub const PERSISTED_LSN_FILE: &str = "persisted.lsn";

/// Reads and monotonically advances the persisted watermark file.
#[derive(Debug)]
pub struct PersistedLsnStore {
    path: PathBuf,
    update: Mutex<()>,
}

impl PersistedLsnStore {
    /// Store for the watermark file in WAL directory `root`.
    pub fn open(root: impl AsRef<Path>) -> Self {
        Self::at(root.as_ref().join(PERSISTED_LSN_FILE))
    }

    /// Store backed by an explicit file path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            update: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the watermark. A missing file reads as 0.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::Io`] if the file cannot be read, or
    /// [`WatermarkError::Corrupted`] if it does not hold an integer.
    pub fn read(&self) -> Result<u64> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(WatermarkError::Io {
                    path: self.path.display().to_string(),
                    source,
                }
                .into());
            }
        };
        content.trim().parse::<u64>().map_err(|_| {
            WatermarkError::Corrupted {
                path: self.path.display().to_string(),
                content,
            }
            .into()
        })
    }

    /// Overwrites the watermark and fsyncs it.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::Io`] if the write, sync or rename fails.
    pub fn write(&self, lsn: u64) -> Result<()> {
        let _guard = self.update.lock();
        self.write_locked(lsn)
    }

    /// Advances the watermark to `lsn` if it is greater than the stored value.
    ///
    /// Returns `true` if the file was updated.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError`] if the current value cannot be read or the
    /// new one cannot be written.
    pub fn update_if_greater(&self, lsn: u64) -> Result<bool> {
        let _guard = self.update.lock();
        let current = self.read()?;
        if lsn <= current {
            return Ok(false);
        }
        self.write_locked(lsn)?;
        tracing::debug!("persisted watermark advanced {current} -> {lsn}");
        Ok(true)
    }

    fn write_locked(&self, lsn: u64) -> Result<()> {
        let io_err = |source| WatermarkError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp).map_err(io_err)?;
        writeln!(file, "{lsn}").map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}
