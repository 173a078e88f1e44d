//! Engine configuration.
//!
//! Configuration is plain serde data, stored as JSON. Every section has
//! defaults so a config file only needs to name what it changes. Durations
//! are encoded as fractional seconds.
//!
//! # Example
//!
//! ```rust,no_run
//! use rollwal::config::EngineConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = EngineConfig::with_root("/var/lib/rollwal");
//! config.node_id = "node-a".to_string();
//! config.validate()?;
//! config.save("/etc/rollwal.json")?;
//!
//! let loaded = EngineConfig::load("/etc/rollwal.json")?;
//! assert_eq!(loaded.node_id, "node-a");
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::wal::spillover::FsyncPolicy;

/// Top-level configuration for a node's storage engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity of this node, compared against the shard router's owner.
    pub node_id: String,

    /// Write-ahead log settings.
    pub wal: WalConfig,

    /// Batch writer limits.
    pub batch: BatchConfig,

    /// Segment cleaner settings.
    pub cleaner: CleanerConfig,

    /// Rollup store settings.
    pub rollup: RollupConfig,

    /// Snapshot scheduling.
    pub snapshot: SnapshotConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_root("data")
    }
}

impl EngineConfig {
    /// Default configuration with the WAL in `<root>/wal` and the snapshot
    /// at `<root>/shards.snapshot`.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            node_id: "local".to_string(),
            wal: WalConfig {
                root: root.join("wal"),
                ..WalConfig::default()
            },
            batch: BatchConfig::default(),
            cleaner: CleanerConfig::default(),
            rollup: RollupConfig::default(),
            snapshot: SnapshotConfig {
                path: root.join("shards.snapshot"),
                ..SnapshotConfig::default()
            },
        }
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid, or [`ConfigError::Invalid`]
    /// if validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(invalid("node_id cannot be empty"));
        }
        if self.wal.max_segment_bytes == 0 {
            return Err(invalid("wal.max_segment_bytes cannot be zero"));
        }
        self.wal.fsync.validate()?;
        self.batch.validate()?;
        if self.batch.max_bytes as u64 > self.wal.max_segment_bytes {
            return Err(invalid(format!(
                "batch.max_bytes ({}) exceeds wal.max_segment_bytes ({})",
                self.batch.max_bytes, self.wal.max_segment_bytes
            )));
        }
        if self.cleaner.trash_dir.is_empty()
            || self.cleaner.trash_dir.contains(std::path::MAIN_SEPARATOR)
        {
            return Err(invalid("cleaner.trash_dir must be a single directory name"));
        }
        if self.rollup.shard_count == 0 {
            return Err(invalid("rollup.shard_count cannot be zero"));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> crate::error::RollwalError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
    .into()
}

/// Write-ahead log settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory holding segments, side indexes and the persisted watermark.
    pub root: PathBuf,

    /// Size at which the active segment is rolled over.
    pub max_segment_bytes: u64,

    /// When appended bytes are forced to disk.
    pub fsync: FsyncPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("wal"),
            max_segment_bytes: 64 * 1024 * 1024,
            fsync: FsyncPolicy::Interval {
                every: Duration::from_secs(1),
            },
        }
    }
}

/// Limits for coalescing events into one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Events per record before a flush is forced.
    pub max_events: usize,

    /// Upper bound on the framed size of one record.
    pub max_bytes: usize,

    /// How long a non-empty buffer may wait before it is flushed.
    /// Zero disables the timer.
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_events: 256,
            max_bytes: 1024 * 1024,
            max_delay: Duration::from_millis(50),
        }
    }
}

impl BatchConfig {
    /// Checks the batch limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if either limit is zero or the byte
    /// limit cannot hold even an empty record.
    pub fn validate(&self) -> Result<()> {
        if self.max_events == 0 {
            return Err(invalid("batch.max_events cannot be zero"));
        }
        if self.max_bytes <= crate::wal::frame::framed_len(4) {
            return Err(invalid(format!(
                "batch.max_bytes ({}) is too small to hold a record",
                self.max_bytes
            )));
        }
        Ok(())
    }
}

/// Segment cleaner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Number of newest sealed segments that are never reclaimed.
    pub keep_last_sealed: usize,

    /// How long quarantined segments are kept before deletion.
    #[serde(with = "duration_serde")]
    pub grace_period: Duration,

    /// Compute decisions without moving or deleting anything.
    pub dry_run: bool,

    /// Name of the quarantine directory inside the WAL root.
    pub trash_dir: String,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            keep_last_sealed: 2,
            grace_period: Duration::from_secs(30 * 60),
            dry_run: false,
            trash_dir: ".wal_trash".to_string(),
        }
    }
}

/// Rollup store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    /// Maximum age of an accepted timestamp. Zero disables the check.
    #[serde(with = "duration_serde")]
    pub admission_window: Duration,

    /// Number of shards used by the default router.
    pub shard_count: u32,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            admission_window: Duration::from_secs(24 * 3600),
            shard_count: 16,
        }
    }
}

/// Snapshot scheduling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Where the shard map snapshot is written.
    pub path: PathBuf,

    /// Commits within this window collapse into one snapshot.
    #[serde(with = "duration_serde")]
    pub debounce: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("shards.snapshot"),
            debounce: Duration::from_secs(1),
        }
    }
}

/// Serde adapter encoding [`Duration`] as fractional seconds.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::with_root("/tmp/rollwal");
        config.validate().unwrap();
        assert_eq!(config.wal.root, PathBuf::from("/tmp/rollwal/wal"));
        assert_eq!(config.cleaner.trash_dir, ".wal_trash");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "node_id": "node-b",
            "rollup": { "admission_window": 3600.0 },
            "wal": { "root": "/data/wal", "fsync": { "mode": "every_record" } }
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.node_id, "node-b");
        assert_eq!(config.rollup.admission_window, Duration::from_secs(3600));
        assert_eq!(config.rollup.shard_count, 16);
        assert_eq!(config.wal.fsync, FsyncPolicy::EveryRecord);
        assert_eq!(config.wal.max_segment_bytes, 64 * 1024 * 1024);
        assert_eq!(config.batch, BatchConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");

        let mut config = EngineConfig::with_root(dir.path());
        config.cleaner.keep_last_sealed = 0;
        config.cleaner.grace_period = Duration::from_millis(1500);
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = EngineConfig::default();
        config.node_id = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.batch.max_events = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.wal.max_segment_bytes = 1024;
        assert!(config.validate().is_err(), "batch larger than segment");

        let mut config = EngineConfig::default();
        config.cleaner.trash_dir = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ nope").unwrap();

        let err = EngineConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
