//! Integration tests for the WAL pipeline.
//!
//! Appends through the spillover writer, advances the persisted watermark,
//! cleans covered segments, and replays what is left.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rollwal::cluster::ManualClock;
use rollwal::config::CleanerConfig;
use rollwal::error::FrameError;
use rollwal::wal::frame::FrameInfo;
use rollwal::wal::segment::list_segments;
use rollwal::wal::{
    CounterFramer, FsyncPolicy, ManualLsnFramer, PersistedLsnStore, RecordFramer, RecoveryScanner, SegmentCleaner,
    SegmentIndex, SpilloverWriter, StreamOptions, WalConsumer, WalStreamer,
};
use tempfile::tempdir;

const SEGMENT_BYTES: u64 = 256;

#[derive(Default)]
struct Collect {
    start: u64,
    records: Vec<(u64, Vec<u8>)>,
}

impl WalConsumer for Collect {
    fn consume(&mut self, lsn: u64, payload: &[u8]) -> rollwal::Result<()> {
        self.records.push((lsn, payload.to_vec()));
        Ok(())
    }

    fn last_applied_lsn(&self) -> u64 {
        self.start
    }
}

fn write_log(root: &Path, records: usize) {
    let mut writer = SpilloverWriter::open(root, CounterFramer::new(), SEGMENT_BYTES, FsyncPolicy::Manual).unwrap();
    for i in 0..records {
        writer.write(format!("payload-{i:04}").as_bytes()).unwrap();
    }
    writer.close().unwrap();
}

fn replay_after(root: &Path, start: u64) -> Vec<u64> {
    let mut consumer = Collect {
        start,
        ..Collect::default()
    };
    WalStreamer::new(root)
        .stream(&mut consumer, &StreamOptions::default())
        .unwrap();
    consumer.records.iter().map(|(lsn, _)| *lsn).collect()
}

fn cleaner(root: &Path, clock: Arc<ManualClock>) -> SegmentCleaner {
    let config = CleanerConfig {
        keep_last_sealed: 0,
        grace_period: Duration::from_secs(60),
        ..CleanerConfig::default()
    };
    SegmentCleaner::new(root, config, clock)
}

#[test]
fn test_append_rolls_over_and_indexes_segments() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("wal");
    write_log(&root, 40);

    let segments = list_segments(&root).unwrap();
    assert!(segments.len() >= 3, "expected rollover, got {} segment(s)", segments.len());

    // Every segment but the active one is sealed, and their ranges tile 1..=40.
    let mut next = 1;
    for (i, segment) in segments.iter().enumerate() {
        let index = SegmentIndex::load_or_new(segment).unwrap();
        assert_eq!(index.sealed, i + 1 < segments.len());
        assert_eq!(index.min_lsn, next);
        assert_eq!(index.record_count, index.max_lsn - index.min_lsn + 1);
        next = index.max_lsn + 1;
    }
    assert_eq!(next, 41);

    assert_eq!(replay_after(&root, 0), (1..=40).collect::<Vec<_>>());
}

#[test]
fn test_clean_then_replay_tail() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("wal");
    write_log(&root, 40);
    let before = list_segments(&root).unwrap().len();

    PersistedLsnStore::open(&root).write(20).unwrap();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let report = cleaner(&root, Arc::clone(&clock)).run().unwrap();
    assert_eq!(report.watermark, 20);
    assert!(!report.quarantined.is_empty());
    assert!(report.purged_batches.is_empty());

    let remaining = list_segments(&root).unwrap();
    assert_eq!(remaining.len() + report.quarantined.len(), before);
    for segment in &remaining {
        let index = SegmentIndex::load_or_new(segment).unwrap();
        assert!(!index.sealed || index.max_lsn > 20);
    }

    // Nothing past the watermark was lost.
    assert_eq!(replay_after(&root, 20), (21..=40).collect::<Vec<_>>());
}

#[test]
fn test_quarantine_purged_after_grace() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("wal");
    write_log(&root, 40);
    PersistedLsnStore::open(&root).write(40).unwrap();

    let clock = Arc::new(ManualClock::new(1_000_000));
    let cleaner = cleaner(&root, Arc::clone(&clock));
    let first = cleaner.run().unwrap();
    assert!(!first.quarantined.is_empty());
    assert!(cleaner.trash_root().is_dir());

    clock.advance(30_000);
    let early = cleaner.run().unwrap();
    assert!(early.quarantined.is_empty());
    assert!(early.purged_batches.is_empty());

    clock.advance(30_000);
    let late = cleaner.run().unwrap();
    assert_eq!(late.purged_batches.len(), 1);
    assert!(!cleaner.trash_root().exists());
}

#[test]
fn test_dry_run_touches_nothing() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("wal");
    write_log(&root, 40);
    let before = list_segments(&root).unwrap();

    let config = CleanerConfig {
        keep_last_sealed: 0,
        dry_run: true,
        ..CleanerConfig::default()
    };
    let cleaner = SegmentCleaner::new(&root, config, Arc::new(ManualClock::new(1)));
    let report = cleaner.run_at(40).unwrap();

    assert!(report.dry_run);
    assert!(!report.quarantined.is_empty());
    assert_eq!(list_segments(&root).unwrap(), before);
    assert!(!cleaner.trash_root().exists());
}

#[test]
fn test_repair_torn_tail_and_resume_appending() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("wal");
    write_log(&root, 5);

    let active = list_segments(&root).unwrap().pop().unwrap();
    let mut bytes = std::fs::read(&active.path).unwrap();
    bytes.extend_from_slice(&[0, 0, 0, 8, 0, 0]);
    std::fs::write(&active.path, &bytes).unwrap();

    let report = RecoveryScanner::recover(&root).unwrap();
    assert_eq!(report.last_lsn, 5);
    assert_eq!(report.truncated_bytes, 6);

    // A restarted writer picks up after the last durable LSN.
    let mut writer = SpilloverWriter::open(
        &root,
        ManualLsnFramer::starting_after(report.last_lsn),
        SEGMENT_BYTES,
        FsyncPolicy::EveryRecord,
    )
    .unwrap();
    writer.framer_mut().set_lsn(6);
    let commit = writer.write(b"after-repair").unwrap();
    assert_eq!(commit.lsn, 6);
    writer.close().unwrap();

    assert_eq!(replay_after(&root, 0), (1..=6).collect::<Vec<_>>());
}

#[test]
fn test_fenced_replay_stops_at_watermark() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("wal");
    write_log(&root, 12);
    PersistedLsnStore::open(&root).write(7).unwrap();

    let mut consumer = Collect::default();
    let options = StreamOptions {
        fence_to_persisted_lsn: true,
        ..StreamOptions::default()
    };
    let result = WalStreamer::new(&root).stream(&mut consumer, &options).unwrap();

    assert_eq!(result.records_delivered, 7);
    assert_eq!(result.last_delivered_lsn, 7);
    assert_eq!(consumer.records[0].1, b"payload-0000");
}

/// Writes the first ten bytes of one chosen record, then fails like a full disk.
struct FullDiskAt {
    inner: ManualLsnFramer,
    fail_lsn: u64,
}

impl RecordFramer for FullDiskAt {
    fn write_framed(&mut self, out: &mut dyn Write, payload: &[u8]) -> rollwal::Result<FrameInfo> {
        let mut frame = Vec::new();
        let info = self.inner.write_framed(&mut frame, payload)?;
        let lsn = info.lsn;
        if lsn == self.fail_lsn {
            out.write_all(&frame[..10])
                .map_err(|source| FrameError::Write { lsn, source })?;
            return Err(FrameError::Write {
                lsn,
                source: io::Error::other("no space left on device"),
            }
            .into());
        }
        out.write_all(&frame)
            .map_err(|source| FrameError::Write { lsn, source })?;
        Ok(info)
    }
}

#[test]
fn test_failed_append_does_not_hide_later_records() {
    let dir = tempdir().unwrap();
    let framer = FullDiskAt {
        inner: ManualLsnFramer::new(),
        fail_lsn: 3,
    };
    let mut writer = SpilloverWriter::open(dir.path(), framer, SEGMENT_BYTES, FsyncPolicy::Manual).unwrap();

    let mut acked = Vec::new();
    for lsn in 1..=15 {
        writer.framer_mut().inner.set_lsn(lsn);
        if writer.write(format!("payload-{lsn:04}").as_bytes()).is_ok() {
            acked.push(lsn);
        }
    }
    assert_eq!(acked.len(), 14);
    assert!(list_segments(dir.path()).unwrap().len() > 1);
    // Crash without closing: the active index was never written.
    drop(writer);

    let report = RecoveryScanner::recover(dir.path()).unwrap();
    assert_eq!(report.records, 14);
    assert_eq!(report.truncated_bytes, 0);
    assert_eq!(report.last_lsn, 15);
    assert_eq!(replay_after(dir.path(), 0), acked);
}
