//! Segment-rolling WAL writer.
//!
//! [`SpilloverWriter`] appends framed records to the active segment, rolls
//! to a new segment before a record would push the active one past its size
//! budget, and applies the configured fsync policy. Every successful append
//! is reported to an optional [`CommitListener`]; a failed one is cut back
//! out of the segment.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result, SegmentError};
use crate::wal::frame::RecordFramer;
use crate::wal::segment::{Segment, SegmentAllocator, SegmentIndex};

/// When appended bytes are forced to stable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Only [`SpilloverWriter::sync`] and rollover force data to disk.
    Manual,
    /// Every record is synced before the commit listener runs.
    EveryRecord,
    /// Sync when this much time has passed since the last sync.
    Interval {
        /// Minimum time between syncs.
        #[serde(with = "crate::config::duration_serde")]
        every: Duration,
    },
    /// Sync once this many bytes have been written since the last sync.
    Bytes {
        /// Unsynced byte threshold.
        threshold: u64,
    },
}

impl FsyncPolicy {
    /// Checks that the policy parameters are non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero interval or threshold.
    pub fn validate(&self) -> Result<()> {
        let reason = match self {
            Self::Interval { every } if every.is_zero() => "fsync interval cannot be zero",
            Self::Bytes { threshold: 0 } => "fsync byte threshold cannot be zero",
            _ => return Ok(()),
        };
        Err(ConfigError::Invalid {
            reason: reason.to_string(),
        }
        .into())
    }
}

/// Details of one appended record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// LSN of the record.
    pub lsn: u64,
    /// CRC32C of the payload.
    pub crc: u32,
    /// Segment the record was written to.
    pub segment: PathBuf,
    /// Segment size before the append.
    pub offset_before: u64,
    /// Segment size after the append.
    pub offset_after: u64,
    /// Bytes written for this record.
    pub bytes_written: u64,
}

/// Receives a notification after every successful append.
///
/// Runs on the writer's thread while the writer is borrowed, so it must not
/// block for long.
pub trait CommitListener: Send + Sync {
    /// Called once per appended record.
    fn on_commit(&self, info: &CommitInfo);
}

impl<F> CommitListener for F
where
    F: Fn(&CommitInfo) + Send + Sync,
{
    fn on_commit(&self, info: &CommitInfo) {
        self(info);
    }
}

/// Appends framed records, rolling segments at a size budget.
pub struct SpilloverWriter<F> {
    allocator: SegmentAllocator,
    framer: F,
    max_segment_bytes: u64,
    fsync: FsyncPolicy,
    listener: Option<Arc<dyn CommitListener>>,
    file: File,
    offset: u64,
    index: SegmentIndex,
    unsynced_bytes: u64,
    last_sync: Instant,
    poisoned: bool,
}

impl<F: RecordFramer> SpilloverWriter<F> {
    /// Opens the WAL directory and positions at the end of the active segment.
    ///
    /// If the active segment's index says it is sealed, a new segment is
    /// allocated so sealed segments are never appended to.
    ///
    /// # Arguments
    ///
    /// * `root` - WAL directory
    /// * `framer` - Framer used to stamp records
    /// * `max_segment_bytes` - Size at which the active segment rolls over
    /// * `fsync` - Fsync policy
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError`] if the directory, active segment or its
    /// index cannot be opened.
    pub fn open(
        root: impl AsRef<Path>,
        framer: F,
        max_segment_bytes: u64,
        fsync: FsyncPolicy,
    ) -> Result<Self> {
        let mut allocator = SegmentAllocator::open(root)?;
        let mut index = SegmentIndex::load_or_new(allocator.active())?;
        if index.sealed {
            let segment = allocator.allocate()?;
            index = SegmentIndex::new(segment.epoch);
        }

        let active = allocator.active().clone();
        let file = open_append(&active)?;
        let offset = active.len()?;
        tracing::debug!(
            "opened WAL segment {} at offset {offset}",
            active.path.display()
        );

        Ok(Self {
            allocator,
            framer,
            max_segment_bytes,
            fsync,
            listener: None,
            file,
            offset,
            index,
            unsynced_bytes: 0,
            last_sync: Instant::now(),
            poisoned: false,
        })
    }

    /// Installs the listener notified after each append.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn CommitListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Mutable access to the framer, used to inject the next LSN.
    pub fn framer_mut(&mut self) -> &mut F {
        &mut self.framer
    }

    /// The segment currently being written.
    pub fn active_segment(&self) -> &Segment {
        self.allocator.active()
    }

    /// Current size of the active segment.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// In-memory index of the active segment.
    pub fn active_index(&self) -> &SegmentIndex {
        &self.index
    }

    /// Appends one record.
    ///
    /// Rolls to a new segment first if the conservative frame size would
    /// push the active segment past its budget. A record larger than the
    /// budget is still written, alone, into a fresh segment.
    ///
    /// # Errors
    ///
    /// Propagates framer and I/O errors. On error the commit listener is not
    /// called and the segment is cut back to its size before the call. If
    /// that cut fails the writer is poisoned and every later call returns
    /// [`SegmentError::Poisoned`].
    pub fn write(&mut self, payload: &[u8]) -> Result<CommitInfo> {
        if self.poisoned {
            return Err(SegmentError::Poisoned {
                path: self.allocator.active().path.display().to_string(),
            }
            .into());
        }
        let estimate = (self.framer.overhead() + 4 + payload.len()) as u64;
        if self.offset > 0 && self.offset + estimate > self.max_segment_bytes {
            self.roll()?;
        }

        let offset_before = self.offset;
        let frame = match self.framer.write_framed(&mut self.file, payload) {
            Ok(frame) => frame,
            Err(e) => {
                self.rewind(offset_before);
                return Err(e);
            }
        };

        self.offset += frame.bytes_written;
        self.unsynced_bytes += frame.bytes_written;
        self.index.observe(frame.lsn);
        self.sync_if_due()?;

        let info = CommitInfo {
            lsn: frame.lsn,
            crc: frame.crc,
            segment: self.allocator.active().path.clone(),
            offset_before,
            offset_after: self.offset,
            bytes_written: frame.bytes_written,
        };
        if let Some(listener) = &self.listener {
            listener.on_commit(&info);
        }
        Ok(info)
    }

    /// Forces appended data and the active index to disk.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError`] if the sync or index write fails.
    pub fn sync(&mut self) -> Result<()> {
        let active = self.allocator.active();
        self.file.sync_data().map_err(|source| SegmentError::Io {
            path: active.path.display().to_string(),
            source,
        })?;
        self.index.save(active)?;
        self.unsynced_bytes = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Syncs if the fsync policy says one is due.
    ///
    /// Called after every write and periodically by the background scheduler
    /// so an idle writer under an interval policy still reaches disk.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError`] if a due sync fails.
    pub fn sync_if_due(&mut self) -> Result<()> {
        if self.unsynced_bytes == 0 {
            return Ok(());
        }
        let due = match &self.fsync {
            FsyncPolicy::Manual => false,
            FsyncPolicy::EveryRecord => true,
            FsyncPolicy::Interval { every } => self.last_sync.elapsed() >= *every,
            FsyncPolicy::Bytes { threshold } => self.unsynced_bytes >= *threshold,
        };
        if due { self.sync() } else { Ok(()) }
    }

    /// Syncs and persists the active index.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError`] if the final sync fails.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }

    /// Drops whatever a failed append left after `offset`.
    fn rewind(&mut self, offset: u64) {
        let cut = self.file.set_len(offset).and_then(|()| self.file.sync_data());
        match cut {
            Ok(()) => self.offset = offset,
            Err(e) => {
                tracing::error!(
                    "cannot drop partial record from {} at offset {offset}: {e}",
                    self.allocator.active().path.display()
                );
                self.poisoned = true;
            }
        }
    }

    fn roll(&mut self) -> Result<()> {
        self.sync()?;
        self.index.sealed = true;
        self.index.save(self.allocator.active())?;
        let sealed = self.index.clone();

        let next = self.allocator.allocate()?;
        self.file = open_append(&next)?;
        self.offset = 0;
        self.index = SegmentIndex::new(next.epoch);
        self.index.save(&next)?;

        tracing::info!(
            "rolled WAL segment {} (lsn {}..={}, {} records) -> epoch {}",
            sealed.epoch,
            sealed.min_lsn,
            sealed.max_lsn,
            sealed.record_count,
            next.epoch
        );
        Ok(())
    }
}

impl<F: RecordFramer> crate::wal::batch::RecordSink for SpilloverWriter<F> {
    fn write_record(&mut self, payload: &[u8]) -> Result<u64> {
        self.write(payload).map(|info| info.lsn)
    }
}

fn open_append(segment: &Segment) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&segment.path)
        .map_err(|source| {
            SegmentError::Open {
                path: segment.path.display().to_string(),
                source,
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::frame::{CounterFramer, FrameInfo, ManualLsnFramer, framed_len};
    use crate::wal::segment::list_segments;
    use parking_lot::Mutex;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_write_reports_offsets() {
        let dir = tempdir().unwrap();
        let mut writer =
            SpilloverWriter::open(dir.path(), CounterFramer::new(), 1 << 20, FsyncPolicy::Manual)
                .unwrap();

        let first = writer.write(b"alpha").unwrap();
        let second = writer.write(b"beta").unwrap();

        assert_eq!(first.lsn, 1);
        assert_eq!(first.offset_before, 0);
        assert_eq!(first.offset_after, framed_len(5) as u64);
        assert_eq!(second.offset_before, first.offset_after);
        assert_eq!(second.bytes_written, framed_len(4) as u64);
        assert_eq!(writer.offset(), second.offset_after);
    }

    #[test]
    fn test_rollover_seals_previous_segment() {
        let dir = tempdir().unwrap();
        let budget = (framed_len(100) * 3) as u64;
        let mut writer =
            SpilloverWriter::open(dir.path(), CounterFramer::new(), budget, FsyncPolicy::Manual)
                .unwrap();
        let first_segment = writer.active_segment().clone();

        for _ in 0..4 {
            writer.write(&[0u8; 100]).unwrap();
        }
        assert_ne!(writer.active_segment(), &first_segment);
        assert_eq!(writer.active_segment().epoch, 2);

        let sealed = SegmentIndex::load_or_new(&first_segment).unwrap();
        assert!(sealed.sealed);
        assert_eq!(sealed.min_lsn, 1);
        assert_eq!(sealed.max_lsn, 3);
        assert_eq!(sealed.record_count, 3);

        writer.close().unwrap();
        let segments = list_segments(dir.path()).unwrap();
        let active = SegmentIndex::load_or_new(&segments[1]).unwrap();
        assert!(!active.sealed);
        assert_eq!(active.max_lsn, 4);
    }

    #[test]
    fn test_listener_sees_every_commit() {
        let dir = tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut writer =
            SpilloverWriter::open(dir.path(), ManualLsnFramer::new(), 1 << 20, FsyncPolicy::EveryRecord)
                .unwrap()
                .with_listener(Arc::new(move |info: &CommitInfo| sink.lock().push(info.lsn)));

        for lsn in [1, 2, 5] {
            writer.framer_mut().set_lsn(lsn);
            writer.write(b"x").unwrap();
        }
        assert_eq!(*seen.lock(), vec![1, 2, 5]);
    }

    #[test]
    fn test_framer_failure_skips_listener() {
        struct Failing;
        impl RecordFramer for Failing {
            fn write_framed(&mut self, out: &mut dyn Write, _: &[u8]) -> Result<FrameInfo> {
                out.write_all(b"partial").map_err(|source| crate::error::FrameError::Write {
                    lsn: 1,
                    source,
                })?;
                Err(crate::error::FrameError::LsnNotSet.into())
            }
        }

        let dir = tempdir().unwrap();
        let calls = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&calls);
        let mut writer = SpilloverWriter::open(dir.path(), Failing, 1 << 20, FsyncPolicy::Manual)
            .unwrap()
            .with_listener(Arc::new(move |_: &CommitInfo| *counter.lock() += 1));

        assert!(writer.write(b"x").is_err());
        assert_eq!(*calls.lock(), 0);
        assert_eq!(writer.offset(), 0);
        assert_eq!(writer.active_segment().len().unwrap(), 0);
    }

    /// Writes the first few bytes of a real frame on the chosen call, then fails.
    struct TearOnce {
        inner: CounterFramer,
        calls: usize,
        tear_on: usize,
    }

    impl RecordFramer for TearOnce {
        fn write_framed(&mut self, out: &mut dyn Write, payload: &[u8]) -> Result<FrameInfo> {
            self.calls += 1;
            if self.calls != self.tear_on {
                return self.inner.write_framed(out, payload);
            }
            let mut frame = Vec::new();
            let info = self.inner.write_framed(&mut frame, payload)?;
            out.write_all(&frame[..10])
                .map_err(|source| crate::error::FrameError::Write { lsn: info.lsn, source })?;
            Err(crate::error::FrameError::Write {
                lsn: info.lsn,
                source: std::io::Error::other("device full"),
            }
            .into())
        }
    }

    #[test]
    fn test_failed_append_leaves_no_partial_frame() {
        let dir = tempdir().unwrap();
        let framer = TearOnce {
            inner: CounterFramer::new(),
            calls: 0,
            tear_on: 2,
        };
        let mut writer = SpilloverWriter::open(dir.path(), framer, 1 << 20, FsyncPolicy::Manual).unwrap();

        let first = writer.write(b"one").unwrap();
        assert!(writer.write(b"two").is_err());
        assert_eq!(writer.offset(), first.offset_after);

        let third = writer.write(b"three").unwrap();
        assert_eq!(third.offset_before, first.offset_after);
        writer.close().unwrap();

        let report = crate::wal::recovery::RecoveryScanner::recover(dir.path()).unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.truncated_bytes, 0);
        assert_eq!(report.last_lsn, third.lsn);
    }

    #[test]
    fn test_poisoned_writer_refuses_appends() {
        let dir = tempdir().unwrap();
        let mut writer =
            SpilloverWriter::open(dir.path(), CounterFramer::new(), 1 << 20, FsyncPolicy::Manual)
                .unwrap();
        writer.poisoned = true;

        let err = writer.write(b"x").unwrap_err();
        assert!(matches!(
            err,
            crate::error::RollwalError::Segment(SegmentError::Poisoned { .. })
        ));
        assert_eq!(writer.active_segment().len().unwrap(), 0);
    }

    #[test]
    fn test_reopen_appends_to_existing_segment() {
        let dir = tempdir().unwrap();
        let mut writer =
            SpilloverWriter::open(dir.path(), CounterFramer::new(), 1 << 20, FsyncPolicy::Manual)
                .unwrap();
        writer.write(b"one").unwrap();
        writer.close().unwrap();

        let writer =
            SpilloverWriter::open(dir.path(), CounterFramer::new(), 1 << 20, FsyncPolicy::Manual)
                .unwrap();
        assert_eq!(writer.active_segment().epoch, 1);
        assert_eq!(writer.offset(), framed_len(3) as u64);
    }

    #[test]
    fn test_bytes_policy_syncs_index() {
        let dir = tempdir().unwrap();
        let mut writer = SpilloverWriter::open(
            dir.path(),
            CounterFramer::new(),
            1 << 20,
            FsyncPolicy::Bytes { threshold: 1 },
        )
        .unwrap();
        writer.write(b"abc").unwrap();

        let index = SegmentIndex::load_or_new(writer.active_segment()).unwrap();
        assert_eq!(index.max_lsn, 1);
    }

    #[test]
    fn test_fsync_policy_validation() {
        assert!(FsyncPolicy::Interval { every: Duration::ZERO }.validate().is_err());
        assert!(FsyncPolicy::Bytes { threshold: 0 }.validate().is_err());
        assert!(FsyncPolicy::Manual.validate().is_ok());
    }
}
