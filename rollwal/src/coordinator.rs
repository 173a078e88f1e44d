//! The write coordinator binds the rollup store to the WAL.
//!
//! # Lifecycle
//!
//! ```text
//! Init -> (restore snapshot) -> Recovering (strict WAL replay) -> Ready -> Stopped
//! ```
//!
//! In `Ready`, [`WriteCoordinator::ingest`] applies a batch to the rollup
//! store, which assigns its LSN, and then appends a WAL record stamped with
//! that same LSN. Both steps run under the WAL writer lock so the on-disk
//! order of records is the order in which LSNs were assigned.
//!
//! Each append notifies a background scheduler thread over a channel. The
//! scheduler debounces those notifications into one checkpoint run at a
//! time: serialize the store, write the snapshot file, advance the persisted
//! watermark, hand the snapshot to the uploader, then run the cleaner.
//! Failures in that pipeline are logged and retried on the next trigger.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cluster::{
    ClockSource, ClusterCoordinator, ConsumeGate, LocalRouter, NoopUploader, ObjectStoreUploader,
    ShardRouter, SystemClock,
};
use crate::config::EngineConfig;
use crate::error::{CoordinatorError, RecoveryError, Result, RollwalError, SegmentError};
use crate::query::{SeriesReader, Slice};
use crate::rollup::{RollupSeries, ScanResult};
use crate::shard_map::{
    RollupBackend, ShardMap, WriteContext, restore_from_file, write_snapshot_file,
};
use crate::wal::batch::{WalEvent, decode_batch, encode_batch};
use crate::wal::cleaner::{CleanerReport, SegmentCleaner};
use crate::wal::frame::ManualLsnFramer;
use crate::wal::recovery::{StreamOptions, WalConsumer, WalStreamer};
use crate::wal::spillover::{CommitInfo, SpilloverWriter};
use crate::wal::watermark::PersistedLsnStore;

/// How often the scheduler wakes to apply the fsync policy.
const SCHEDULER_TICK: Duration = Duration::from_millis(100);

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoordinatorState {
    /// Constructed, nothing restored.
    Init = 0,
    /// Replaying the WAL tail.
    Recovering = 1,
    /// Accepting writes.
    Ready = 2,
    /// Closed.
    Stopped = 3,
}

impl CoordinatorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Recovering,
            2 => Self::Ready,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Recovering => "recovering",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// External services the coordinator consults.
#[derive(Clone)]
pub struct Collaborators {
    /// Wall clock for the admission window and quarantine ages.
    pub clock: Arc<dyn ClockSource>,
    /// Series to shard to node routing.
    pub router: Arc<dyn ShardRouter>,
    /// Gate on whether writes are accepted.
    pub cluster: Arc<dyn ClusterCoordinator>,
    /// Destination for finished snapshots.
    pub uploader: Arc<dyn ObjectStoreUploader>,
}

impl Collaborators {
    /// Single-node defaults: system clock, every shard owned by `node_id`,
    /// writes always accepted, no upload.
    pub fn local(node_id: &str, shard_count: u32) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            router: Arc::new(LocalRouter::new(node_id, shard_count)),
            cluster: Arc::new(ConsumeGate::default()),
            uploader: Arc::new(NoopUploader),
        }
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }
}

/// Result of one checkpoint run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Highest LSN captured by the snapshot.
    pub watermark: u64,
    /// Where the snapshot was written.
    pub path: PathBuf,
    /// Whether the persisted watermark moved forward.
    pub advanced: bool,
    /// Cleaner outcome, absent if the cleaner failed.
    pub cleaner: Option<CleanerReport>,
}

enum SchedulerMsg {
    Commit,
    SnapshotNow(Sender<Result<CheckpointReport>>),
    Shutdown,
}

struct Shared {
    backend: Arc<dyn RollupBackend>,
    wal: Mutex<SpilloverWriter<ManualLsnFramer>>,
    watermark: PersistedLsnStore,
    cleaner: SegmentCleaner,
    uploader: Arc<dyn ObjectStoreUploader>,
    snapshot_path: PathBuf,
    /// Set by the commit listener, cleared when a checkpoint starts.
    snapshot_pending: Arc<AtomicBool>,
}

impl Shared {
    fn checkpoint(&self) -> Result<CheckpointReport> {
        self.snapshot_pending.store(false, Ordering::SeqCst);

        // Holding the WAL lock while serializing pins the watermark: every
        // LSN up to it is in the buffer and none beyond it.
        let (watermark, bytes) = {
            let _wal = self.wal.lock();
            let mut buf = Vec::new();
            let watermark = self.backend.snapshot(&mut buf)?;
            (watermark, buf)
        };

        write_snapshot_file(&self.snapshot_path, &bytes)?;
        let advanced = self.watermark.update_if_greater(watermark)?;
        tracing::info!(
            "snapshot written to {} at watermark {watermark} ({} bytes)",
            self.snapshot_path.display(),
            bytes.len()
        );

        if let Err(e) = self.uploader.upload_checkpoint(&self.snapshot_path, watermark) {
            tracing::warn!("checkpoint upload at watermark {watermark} failed: {e}");
        }

        let cleaner = match self.cleaner.run() {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!("cleaner run failed: {e}");
                None
            }
        };

        Ok(CheckpointReport {
            watermark,
            path: self.snapshot_path.clone(),
            advanced,
            cleaner,
        })
    }

    fn sync_if_due(&self) {
        if let Err(e) = self.wal.lock().sync_if_due() {
            tracing::warn!("WAL fsync failed: {e}");
        }
    }
}

fn run_scheduler(shared: &Shared, rx: &Receiver<SchedulerMsg>, debounce: Duration) {
    let mut due: Option<Instant> = None;
    loop {
        let timeout = due.map_or(SCHEDULER_TICK, |d| {
            d.saturating_duration_since(Instant::now()).min(SCHEDULER_TICK)
        });
        match rx.recv_timeout(timeout) {
            Ok(SchedulerMsg::Commit) => {
                due.get_or_insert_with(|| Instant::now() + debounce);
            }
            Ok(SchedulerMsg::SnapshotNow(reply)) => {
                due = None;
                let result = shared.checkpoint();
                if let Err(e) = &result {
                    tracing::error!("checkpoint failed: {e}");
                }
                let _ = reply.send(result);
            }
            Ok(SchedulerMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if due.is_some_and(|d| Instant::now() >= d) {
            due = None;
            if let Err(e) = shared.checkpoint() {
                // The watermark did not move; try again after another debounce.
                tracing::error!("scheduled checkpoint failed: {e}");
                due = Some(Instant::now() + debounce);
            }
        }
        shared.sync_if_due();
    }
    tracing::debug!("snapshot scheduler stopped");
}

/// Replays logged batches into the backend.
struct ReplayConsumer<'a> {
    backend: &'a dyn RollupBackend,
    last_applied: u64,
    events: u64,
}

impl WalConsumer for ReplayConsumer<'_> {
    fn consume(&mut self, lsn: u64, payload: &[u8]) -> Result<()> {
        for blob in decode_batch(payload)? {
            let event = WalEvent::decode(&blob)?;
            self.backend
                .replay(lsn, event.shard, &event.series, &event.timestamps, &event.values)?;
            self.events += 1;
        }
        self.last_applied = lsn;
        Ok(())
    }

    fn last_applied_lsn(&self) -> u64 {
        self.last_applied
    }
}

/// Accepts writes, keeps the WAL and rollup store in step, and drives
/// checkpoints.
pub struct WriteCoordinator {
    node_id: String,
    shared: Arc<Shared>,
    router: Arc<dyn ShardRouter>,
    cluster: Arc<dyn ClusterCoordinator>,
    state: AtomicU8,
    scheduler_tx: Mutex<Option<Sender<SchedulerMsg>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for WriteCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteCoordinator")
            .field("node_id", &self.node_id)
            .field("state", &self.state())
            .field("lsn", &self.shared.backend.current_lsn())
            .finish_non_exhaustive()
    }
}

impl WriteCoordinator {
    /// Restores state, replays the WAL tail and starts accepting writes,
    /// using a [`ShardMap`] as the backend.
    ///
    /// # Errors
    ///
    /// See [`WriteCoordinator::open_with_backend`].
    pub fn open(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        let backend = Arc::new(ShardMap::from_config(
            &config.rollup,
            Arc::clone(&collaborators.clock),
        ));
        Self::open_with_backend(config, collaborators, backend)
    }

    /// Restores `backend` from the snapshot, replays the WAL tail into it,
    /// opens the WAL for appends and starts the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::error::ConfigError) for an invalid
    /// configuration, [`RecoveryError::SnapshotBehindWatermark`] if the
    /// snapshot predates the persisted watermark, and any snapshot, WAL
    /// corruption or I/O error met during recovery.
    pub fn open_with_backend(
        config: EngineConfig,
        collaborators: Collaborators,
        backend: Arc<dyn RollupBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let wal_root = config.wal.root.clone();
        tracing::info!("coordinator {} starting on {}", config.node_id, wal_root.display());
        std::fs::create_dir_all(&wal_root).map_err(|source| SegmentError::DirectoryAccess {
            path: wal_root.display().to_string(),
            source,
        })?;

        let restored = restore_from_file(backend.as_ref(), &config.snapshot.path)?.unwrap_or(0);
        let watermark = PersistedLsnStore::open(&wal_root);
        let persisted = watermark.read()?;
        if persisted > restored {
            return Err(RecoveryError::SnapshotBehindWatermark {
                snapshot: restored,
                persisted,
            }
            .into());
        }

        tracing::info!("state {} -> {}", CoordinatorState::Init, CoordinatorState::Recovering);
        let mut consumer = ReplayConsumer {
            backend: backend.as_ref(),
            last_applied: restored,
            events: 0,
        };
        let options = StreamOptions {
            run_recovery: true,
            verify_crc: true,
            fence_to_persisted_lsn: false,
            up_to_lsn: None,
        };
        let replayed = WalStreamer::new(&wal_root).stream(&mut consumer, &options)?;
        let last_lsn = replayed.last_delivered_lsn.max(restored);
        backend.set_watermark(last_lsn);
        tracing::info!(
            "recovered to LSN {last_lsn}: snapshot {restored}, replayed {} record(s) with {} event(s)",
            replayed.records_delivered,
            consumer.events
        );

        let (tx, rx) = mpsc::channel();
        let listener_tx = tx.clone();
        let pending = Arc::new(AtomicBool::new(false));
        let listener_pending = Arc::clone(&pending);
        let writer = SpilloverWriter::open(
            &wal_root,
            ManualLsnFramer::starting_after(last_lsn),
            config.wal.max_segment_bytes,
            config.wal.fsync.clone(),
        )?
        .with_listener(Arc::new(move |_: &CommitInfo| {
            if !listener_pending.swap(true, Ordering::SeqCst) {
                let _ = listener_tx.send(SchedulerMsg::Commit);
            }
        }));

        let shared = Arc::new(Shared {
            backend,
            wal: Mutex::new(writer),
            watermark,
            cleaner: SegmentCleaner::new(
                &wal_root,
                config.cleaner.clone(),
                Arc::clone(&collaborators.clock),
            ),
            uploader: collaborators.uploader,
            snapshot_path: config.snapshot.path.clone(),
            snapshot_pending: pending,
        });

        let debounce = config.snapshot.debounce;
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("rollwal-scheduler".to_string())
            .spawn(move || run_scheduler(&thread_shared, &rx, debounce))
            .map_err(|e| {
                tracing::error!("failed to start snapshot scheduler: {e}");
                RollwalError::from(CoordinatorError::SchedulerStopped)
            })?;

        let coordinator = Self {
            node_id: config.node_id,
            shared,
            router: collaborators.router,
            cluster: collaborators.cluster,
            state: AtomicU8::new(CoordinatorState::Ready as u8),
            scheduler_tx: Mutex::new(Some(tx)),
            scheduler: Mutex::new(Some(handle)),
        };
        tracing::info!("state {} -> {}", CoordinatorState::Recovering, CoordinatorState::Ready);
        Ok(coordinator)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The rollup backend.
    pub fn backend(&self) -> &Arc<dyn RollupBackend> {
        &self.shared.backend
    }

    /// The last LSN assigned.
    pub fn current_lsn(&self) -> u64 {
        self.shared.backend.current_lsn()
    }

    /// The durable watermark.
    ///
    /// # Errors
    ///
    /// Returns a watermark error if the file cannot be read.
    pub fn persisted_lsn(&self) -> Result<u64> {
        self.shared.watermark.read()
    }

    /// Applies a batch and logs it, returning its LSN.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::NotReady`] outside the `Ready` state
    /// - [`CoordinatorError::NotConsuming`] if the cluster gate is closed
    /// - [`CoordinatorError::NotOwner`] if another node owns the series' shard
    /// - a [`RollupError`](crate::error::RollupError) if validation fails,
    ///   or [`FrameError::InvalidPayload`](crate::error::FrameError::InvalidPayload)
    ///   if the batch cannot be encoded; either way nothing is applied or logged
    /// - [`CoordinatorError::WalAppend`] if the batch was applied but the
    ///   WAL append failed; the write is in memory but not durable until
    ///   the next snapshot
    pub fn ingest(
        &self,
        ctx: &WriteContext,
        series: &str,
        timestamps: &[u64],
        values: &[f64],
    ) -> Result<u64> {
        let state = self.state();
        if state != CoordinatorState::Ready {
            return Err(CoordinatorError::NotReady {
                state: state.to_string(),
            }
            .into());
        }
        if !self.cluster.can_consume() {
            return Err(CoordinatorError::NotConsuming.into());
        }
        let shard = self.router.shard_for(series);
        let owner = self.router.node_for(shard);
        if owner != self.node_id {
            return Err(CoordinatorError::NotOwner {
                series: series.to_string(),
                shard,
                owner,
            }
            .into());
        }

        let event = WalEvent {
            shard,
            series: series.to_string(),
            timestamps: timestamps.to_vec(),
            values: values.to_vec(),
        };
        let payload = encode_batch(&[event.encode()?])?;

        let mut wal = self.shared.wal.lock();
        let lsn = self
            .shared
            .backend
            .apply(shard, ctx, series, timestamps, values)?;
        wal.framer_mut().set_lsn(lsn);
        if let Err(e) = wal.write(&payload) {
            tracing::error!("batch {lsn} applied in memory but WAL append failed: {e}");
            return Err(CoordinatorError::WalAppend {
                lsn,
                source: Box::new(e),
            }
            .into());
        }
        Ok(lsn)
    }

    /// Scans one series, routed to its shard.
    ///
    /// # Errors
    ///
    /// Returns [`RollupError::InvalidTimeRange`](crate::error::RollupError::InvalidTimeRange)
    /// if `slice.from > slice.to`.
    pub fn scan(&self, slice: &Slice) -> Result<ScanResult> {
        let shard = self.router.shard_for(&slice.series);
        match self.shared.backend.get(shard) {
            Some(series) => SeriesReader::scan(series.as_ref(), slice),
            None => SeriesReader::scan(&RollupSeries::new(), slice),
        }
    }

    /// Runs a checkpoint now on the scheduler thread and waits for it.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::SchedulerStopped`] after [`close`](Self::close),
    /// or the checkpoint's own error.
    pub fn checkpoint_now(&self) -> Result<CheckpointReport> {
        let (reply_tx, reply_rx) = mpsc::channel();
        {
            let tx = self.scheduler_tx.lock();
            let tx = tx.as_ref().ok_or(CoordinatorError::SchedulerStopped)?;
            tx.send(SchedulerMsg::SnapshotNow(reply_tx))
                .map_err(|_| CoordinatorError::SchedulerStopped)?;
        }
        reply_rx
            .recv()
            .map_err(|_| CoordinatorError::SchedulerStopped)?
    }

    /// Forces buffered WAL bytes to disk.
    ///
    /// # Errors
    ///
    /// Returns a segment error if the fsync fails.
    pub fn sync(&self) -> Result<()> {
        self.shared.wal.lock().sync()
    }

    /// Stops accepting writes, takes a final checkpoint, stops the scheduler
    /// and syncs the WAL.
    ///
    /// # Errors
    ///
    /// Returns the final checkpoint's or fsync's error; the coordinator is
    /// stopped either way.
    pub fn close(&self) -> Result<()> {
        let previous = self.state.swap(CoordinatorState::Stopped as u8, Ordering::SeqCst);
        if CoordinatorState::from_u8(previous) == CoordinatorState::Stopped {
            return Ok(());
        }
        tracing::info!("state {} -> {}", CoordinatorState::from_u8(previous), CoordinatorState::Stopped);

        let checkpoint = self.checkpoint_now().map(|_| ());
        self.stop_scheduler();
        let synced = self.sync();
        checkpoint.and(synced)
    }

    fn stop_scheduler(&self) {
        if let Some(tx) = self.scheduler_tx.lock().take() {
            let _ = tx.send(SchedulerMsg::Shutdown);
        }
        if let Some(handle) = self.scheduler.lock().take()
            && handle.join().is_err()
        {
            tracing::error!("snapshot scheduler panicked");
        }
    }
}

impl SeriesReader for WriteCoordinator {
    fn scan(&self, slice: &Slice) -> Result<ScanResult> {
        WriteCoordinator::scan(self, slice)
    }
}

impl Drop for WriteCoordinator {
    fn drop(&mut self) {
        self.state
            .store(CoordinatorState::Stopped as u8, Ordering::SeqCst);
        self.stop_scheduler();
        if let Err(e) = self.shared.wal.lock().sync() {
            tracing::warn!("WAL fsync on drop failed: {e}");
        }
    }
}
