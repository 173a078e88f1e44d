//! Collaborators supplied by the surrounding node.
//!
//! The storage engine does not decide shard ownership, leadership, or how
//! checkpoints leave the machine. It asks these traits, and ships simple
//! single-node implementations for embedding and tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait ClockSource: Send + Sync {
    /// Current time in milliseconds.
    fn current_time_millis(&self) -> u64;
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    #[allow(clippy::cast_possible_truncation)] // u64 millis covers ~584 million years
    fn current_time_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `now` milliseconds.
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Sets the current time.
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn current_time_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Maps series to shards and shards to owning nodes.
pub trait ShardRouter: Send + Sync {
    /// Shard holding `series`.
    fn shard_for(&self, series: &str) -> u32;

    /// Node that owns `shard`.
    fn node_for(&self, shard: u32) -> String;
}

/// Hashes series over a fixed shard count, all owned by one node.
#[derive(Debug, Clone)]
pub struct LocalRouter {
    node_id: String,
    shard_count: u32,
}

impl LocalRouter {
    /// Router placing every shard on `node_id`. A zero count is treated as one.
    pub fn new(node_id: impl Into<String>, shard_count: u32) -> Self {
        Self {
            node_id: node_id.into(),
            shard_count: shard_count.max(1),
        }
    }
}

impl ShardRouter for LocalRouter {
    fn shard_for(&self, series: &str) -> u32 {
        crc32c::crc32c(series.as_bytes()) % self.shard_count
    }

    fn node_for(&self, _shard: u32) -> String {
        self.node_id.clone()
    }
}

/// Cluster-level gate on whether this node may accept writes.
pub trait ClusterCoordinator: Send + Sync {
    /// Whether writes may be consumed right now.
    fn can_consume(&self) -> bool;
}

/// A gate that can be opened and closed at runtime.
#[derive(Debug)]
pub struct ConsumeGate {
    open: AtomicBool,
}

impl ConsumeGate {
    /// Creates a gate in the given state.
    pub fn new(open: bool) -> Self {
        Self {
            open: AtomicBool::new(open),
        }
    }

    /// Opens or closes the gate.
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

impl Default for ConsumeGate {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ClusterCoordinator for ConsumeGate {
    fn can_consume(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Error type returned by uploaders; never inspected beyond logging.
pub type UploadError = Box<dyn std::error::Error + Send + Sync>;

/// Best-effort export of snapshots to remote storage.
pub trait ObjectStoreUploader: Send + Sync {
    /// Uploads the snapshot at `path`, which covers LSNs up to `watermark`.
    ///
    /// # Errors
    ///
    /// Any error is logged by the caller and otherwise ignored.
    fn upload_checkpoint(&self, path: &Path, watermark: u64) -> Result<(), UploadError>;
}

/// Uploader that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUploader;

impl ObjectStoreUploader for NoopUploader {
    fn upload_checkpoint(&self, _path: &Path, _watermark: u64) -> Result<(), UploadError> {
        Ok(())
    }
}
