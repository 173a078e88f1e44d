//! The sharded in-memory rollup store.
//!
//! [`ShardMap`] owns the engine's LSN counter. Every successful
//! [`RollupBackend::apply`] increments it exactly once and returns the new
//! value, which the caller must use as the LSN of the matching WAL record.
//!
//! The shard registry is an immutable `HashMap` behind an [`ArcSwap`].
//! Readers load the current map once per operation and never block; lazy
//! shard creation, [`RollupBackend::reset`] and [`RollupBackend::load_shard`]
//! publish a new map. Series stores inside the map are mutated in place.
//!
//! # Snapshot format
//!
//! ```text
//! [str "RollwalSnapshot"][str "ShardMapV1"][u64 watermark][u32 shard count]
//! { [u32 shard id][series checkpoint] }*   sorted by shard id
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::cluster::ClockSource;
use crate::codec::{StreamReader, put_str, put_u32, put_u64};
use crate::config::RollupConfig;
use crate::error::{Result, RollupError, SnapshotError};
use crate::rollup::{RollupSeries, expect_magic};

/// Leading marker of a snapshot file.
pub const SNAPSHOT_MAGIC: &str = "RollwalSnapshot";

/// Format tag following [`SNAPSHOT_MAGIC`].
pub const SNAPSHOT_FORMAT: &str = "ShardMapV1";

type Registry = HashMap<u32, Arc<RollupSeries>>;

/// Per-request metadata carried alongside a write.
#[derive(Debug, Clone, Default)]
pub struct WriteContext {
    /// Correlation id for logs.
    pub trace_id: Option<String>,
}

impl WriteContext {
    /// Context tagged with a correlation id.
    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
        }
    }
}

/// Storage backend behind the write coordinator.
///
/// Implementations own the LSN counter and must assign exactly one LSN per
/// successful [`apply`](RollupBackend::apply).
pub trait RollupBackend: Send + Sync {
    /// Validates and applies a batch, returning its LSN.
    ///
    /// # Errors
    ///
    /// Returns a [`RollupError`] without any state change if the arrays
    /// differ in length, are empty, or hold a timestamp outside the
    /// admission window.
    fn apply(
        &self,
        shard: u32,
        ctx: &WriteContext,
        series: &str,
        timestamps: &[u64],
        values: &[f64],
    ) -> Result<u64>;

    /// Re-applies a logged batch with a known LSN, skipping the admission
    /// window, and raises the counter to at least `lsn`.
    ///
    /// # Errors
    ///
    /// Returns [`RollupError::LengthMismatch`] for inconsistent arrays.
    fn replay(
        &self,
        lsn: u64,
        shard: u32,
        series: &str,
        timestamps: &[u64],
        values: &[f64],
    ) -> Result<()>;

    /// The series store of `shard`, if it has been written.
    fn get(&self, shard: u32) -> Option<Arc<RollupSeries>>;

    /// Ids of every populated shard, ascending.
    fn shards(&self) -> Vec<u32>;

    /// Serializes every shard and returns the watermark written.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if writing fails.
    fn snapshot(&self, out: &mut dyn Write) -> Result<u64>;

    /// Replaces all state with a snapshot and returns its watermark.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the snapshot cannot be decoded; the
    /// current state is left untouched.
    fn reset(&self, input: &mut dyn Read) -> Result<u64>;

    /// Replaces one shard with a series checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the checkpoint cannot be decoded.
    fn load_shard(&self, shard: u32, input: &mut dyn Read) -> Result<()>;

    /// Forces the LSN counter to `lsn`.
    fn set_watermark(&self, lsn: u64);

    /// The last LSN assigned.
    fn current_lsn(&self) -> u64;
}

/// Copy-on-write map of shard id to [`RollupSeries`].
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use rollwal::cluster::ManualClock;
/// use rollwal::shard_map::{RollupBackend, ShardMap, WriteContext};
///
/// let clock = Arc::new(ManualClock::new(10_000));
/// let map = ShardMap::new(clock, Duration::from_secs(3600));
///
/// let lsn = map.apply(0, &WriteContext::default(), "cpu", &[9_000], &[0.5])?;
/// assert_eq!(lsn, 1);
/// assert_eq!(map.shards(), vec![0]);
/// # Ok::<(), rollwal::error::RollwalError>(())
/// ```
pub struct ShardMap {
    registry: ArcSwap<Registry>,
    lsn: AtomicU64,
    admission_window_ms: u64,
    clock: Arc<dyn ClockSource>,
    publish: Mutex<()>,
}

impl std::fmt::Debug for ShardMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardMap")
            .field("shards", &self.registry.load().len())
            .field("lsn", &self.lsn.load(Ordering::SeqCst))
            .field("admission_window_ms", &self.admission_window_ms)
            .finish_non_exhaustive()
    }
}

impl ShardMap {
    /// Creates an empty map. A zero `admission_window` disables the check.
    #[allow(clippy::cast_possible_truncation)] // windows beyond u64 millis are not meaningful
    pub fn new(clock: Arc<dyn ClockSource>, admission_window: Duration) -> Self {
        Self {
            registry: ArcSwap::from_pointee(Registry::new()),
            lsn: AtomicU64::new(0),
            admission_window_ms: admission_window.as_millis() as u64,
            clock,
            publish: Mutex::new(()),
        }
    }

    /// Creates an empty map from configuration.
    pub fn from_config(config: &RollupConfig, clock: Arc<dyn ClockSource>) -> Self {
        Self::new(clock, config.admission_window)
    }

    fn shard_or_create(&self, shard: u32) -> Arc<RollupSeries> {
        if let Some(series) = self.registry.load().get(&shard) {
            return Arc::clone(series);
        }
        let _guard = self.publish.lock();
        let current = self.registry.load_full();
        if let Some(series) = current.get(&shard) {
            return Arc::clone(series);
        }
        let series = Arc::new(RollupSeries::new());
        let mut next = Registry::clone(&current);
        next.insert(shard, Arc::clone(&series));
        self.registry.store(Arc::new(next));
        tracing::debug!("created shard {shard}");
        series
    }

    fn check_window(&self, timestamps: &[u64]) -> std::result::Result<(), RollupError> {
        if self.admission_window_ms == 0 {
            return Ok(());
        }
        let now = self.clock.current_time_millis();
        let cutoff = now.saturating_sub(self.admission_window_ms);
        if let Some(&timestamp) = timestamps.iter().find(|&&t| t < cutoff) {
            return Err(RollupError::OutsideWindow {
                timestamp,
                now,
                window_ms: self.admission_window_ms,
            });
        }
        Ok(())
    }
}

fn check_lengths(timestamps: &[u64], values: &[f64]) -> std::result::Result<(), RollupError> {
    if timestamps.len() != values.len() {
        return Err(RollupError::LengthMismatch {
            timestamps: timestamps.len(),
            values: values.len(),
        });
    }
    if timestamps.is_empty() {
        return Err(RollupError::EmptyBatch);
    }
    Ok(())
}

impl RollupBackend for ShardMap {
    fn apply(
        &self,
        shard: u32,
        ctx: &WriteContext,
        series: &str,
        timestamps: &[u64],
        values: &[f64],
    ) -> Result<u64> {
        check_lengths(timestamps, values)?;
        self.check_window(timestamps)?;

        self.shard_or_create(shard)
            .write_batch(series, timestamps, values)?;
        let lsn = self.lsn.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(
            "applied {} point(s) to {series} in shard {shard} at LSN {lsn} (trace {:?})",
            timestamps.len(),
            ctx.trace_id
        );
        Ok(lsn)
    }

    fn replay(
        &self,
        lsn: u64,
        shard: u32,
        series: &str,
        timestamps: &[u64],
        values: &[f64],
    ) -> Result<()> {
        if timestamps.len() != values.len() {
            return Err(RollupError::LengthMismatch {
                timestamps: timestamps.len(),
                values: values.len(),
            }
            .into());
        }
        self.shard_or_create(shard)
            .write_batch(series, timestamps, values)?;
        self.lsn.fetch_max(lsn, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, shard: u32) -> Option<Arc<RollupSeries>> {
        self.registry.load().get(&shard).cloned()
    }

    fn shards(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.registry.load().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn snapshot(&self, mut out: &mut dyn Write) -> Result<u64> {
        let watermark = self.lsn.load(Ordering::SeqCst);
        let registry = self.registry.load_full();
        let mut ids: Vec<u32> = registry.keys().copied().collect();
        ids.sort_unstable();
        let count = u32::try_from(ids.len()).map_err(|_| SnapshotError::Corrupted {
            reason: "too many shards".to_string(),
        })?;

        put_str(&mut out, SNAPSHOT_MAGIC).map_err(SnapshotError::from)?;
        put_str(&mut out, SNAPSHOT_FORMAT).map_err(SnapshotError::from)?;
        put_u64(&mut out, watermark).map_err(SnapshotError::from)?;
        put_u32(&mut out, count).map_err(SnapshotError::from)?;
        for id in ids {
            put_u32(&mut out, id).map_err(SnapshotError::from)?;
            if let Some(series) = registry.get(&id) {
                series.checkpoint(&mut out)?;
            }
        }
        tracing::debug!("serialized {count} shard(s) at watermark {watermark}");
        Ok(watermark)
    }

    fn reset(&self, input: &mut dyn Read) -> Result<u64> {
        let mut reader = StreamReader::new(input);
        expect_magic(&mut reader, SNAPSHOT_MAGIC)?;
        expect_magic(&mut reader, SNAPSHOT_FORMAT)?;
        let watermark = reader.u64().map_err(SnapshotError::from)?;
        let count = reader.u32().map_err(SnapshotError::from)?;

        let mut next = Registry::with_capacity(count.min(1 << 16) as usize);
        for _ in 0..count {
            let id = reader.u32().map_err(SnapshotError::from)?;
            let series = RollupSeries::from_checkpoint(reader.get_mut())?;
            next.insert(id, Arc::new(series));
        }

        let _guard = self.publish.lock();
        self.registry.store(Arc::new(next));
        self.lsn.store(watermark, Ordering::SeqCst);
        tracing::info!("restored {count} shard(s) at watermark {watermark}");
        Ok(watermark)
    }

    fn load_shard(&self, shard: u32, mut input: &mut dyn Read) -> Result<()> {
        let series = Arc::new(RollupSeries::from_checkpoint(&mut input)?);
        let _guard = self.publish.lock();
        let mut next = Registry::clone(&self.registry.load_full());
        next.insert(shard, series);
        self.registry.store(Arc::new(next));
        tracing::info!("loaded checkpoint into shard {shard}");
        Ok(())
    }

    fn set_watermark(&self, lsn: u64) {
        self.lsn.store(lsn, Ordering::SeqCst);
    }

    fn current_lsn(&self) -> u64 {
        self.lsn.load(Ordering::SeqCst)
    }
}

/// Writes `bytes` to `path` atomically: temp file, fsync, rename, then
/// fsync of the parent directory.
///
/// # Errors
///
/// Returns [`SnapshotError::File`] if any step fails.
pub fn write_snapshot_file(path: &Path, bytes: &[u8]) -> std::result::Result<(), SnapshotError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(file_err(parent))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let file = File::create(&tmp).map_err(file_err(&tmp))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes).map_err(file_err(&tmp))?;
    let file = writer
        .into_inner()
        .map_err(|e| file_err(&tmp)(e.into_error()))?;
    file.sync_all().map_err(file_err(&tmp))?;
    fs::rename(&tmp, path).map_err(file_err(path))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        // Directory fsync is not supported everywhere; the rename itself is
        // already atomic.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn file_err(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + use<> {
    let path = path.display().to_string();
    move |source| SnapshotError::File { path, source }
}

/// Serializes `backend` into `path` atomically and returns the watermark.
///
/// # Errors
///
/// Returns [`SnapshotError`] if serialization or the file write fails.
pub fn snapshot_to_file(backend: &dyn RollupBackend, path: &Path) -> Result<u64> {
    let mut buf = Vec::new();
    let watermark = backend.snapshot(&mut buf)?;
    write_snapshot_file(path, &buf)?;
    Ok(watermark)
}

/// Restores `backend` from `path`, returning `None` if the file does not exist.
///
/// # Errors
///
/// Returns [`SnapshotError`] if the file exists but cannot be read or decoded.
pub fn restore_from_file(backend: &dyn RollupBackend, path: &Path) -> Result<Option<u64>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SnapshotError::File {
                path: path.display().to_string(),
                source,
            }
            .into());
        }
    };
    let mut reader = BufReader::new(file);
    backend.reset(&mut reader).map(Some)
}
