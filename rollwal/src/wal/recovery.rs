//! Crash recovery and log replay.
//!
//! [`RecoveryScanner`] makes the on-disk log consistent after a crash: it
//! walks every segment, truncates a torn or checksum-failing record at the
//! very end of the last segment, and rebuilds all side indexes.
//!
//! [`WalStreamer`] delivers records after a starting LSN, in order, to a
//! [`WalConsumer`]. Corruption anywhere but the tail of the log is fatal.
//!
//! Only a record that runs to the end of the last segment counts as a
//! tail. A malformed header with bytes after it, or a checksum failure on
//! any record that is followed by another, is corruption.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::{FrameError, RecoveryError, Result, RollwalError};
use crate::wal::frame::{RecordRead, read_record};
use crate::wal::segment::{Segment, SegmentIndex, list_segments};
use crate::wal::watermark::PersistedLsnStore;

/// Outcome of a recovery scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Segments examined.
    pub segments: usize,
    /// Complete, valid records found.
    pub records: u64,
    /// Bytes cut from the tail of the last segment.
    pub truncated_bytes: u64,
    /// Highest LSN found, or 0 for an empty log.
    pub last_lsn: u64,
}

/// Repairs the tail of the log and rebuilds side indexes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryScanner;

impl RecoveryScanner {
    /// Scans every segment under `root`.
    ///
    /// All segments but the last are marked sealed. Only the last segment
    /// may be truncated; a bad record anywhere else is an error.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Corruption`] for a malformed header or a
    /// checksum failure that is not the final record of the log,
    /// [`RecoveryError::TornSealedSegment`]
    /// for a torn record in an earlier segment,
    /// [`RecoveryError::OutOfOrder`] if LSNs do not increase, and I/O errors.
    pub fn recover(root: &Path) -> Result<ScanReport> {
        let segments = list_segments(root)?;
        let mut report = ScanReport {
            segments: segments.len(),
            ..ScanReport::default()
        };

        let last_epoch = segments.last().map(|s| s.epoch);
        let mut previous = 0;
        for segment in &segments {
            let is_last = Some(segment.epoch) == last_epoch;
            let (index, truncated) = scan_segment(segment, is_last, &mut previous)?;
            report.records += index.record_count;
            report.truncated_bytes += truncated;
            index.save(segment)?;
        }
        report.last_lsn = previous;

        tracing::info!(
            "recovery scan: {} segment(s), {} record(s), last LSN {}, truncated {} byte(s)",
            report.segments,
            report.records,
            report.last_lsn,
            report.truncated_bytes
        );
        Ok(report)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> RollwalError {
    RecoveryError::Io {
        path: path.display().to_string(),
        source,
    }
    .into()
}

fn frame_error(path: &Path, offset: u64, source: FrameError) -> RollwalError {
    match source {
        FrameError::Read { source, .. } => io_error(path, source),
        other => RecoveryError::Corruption {
            path: path.display().to_string(),
            offset,
            source: other,
        }
        .into(),
    }
}

fn scan_segment(segment: &Segment, is_last: bool, previous: &mut u64) -> Result<(SegmentIndex, u64)> {
    let path = &segment.path;
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    let size = file.metadata().map_err(|e| io_error(path, e))?.len();
    let mut reader = BufReader::new(file);

    let mut index = SegmentIndex::new(segment.epoch);
    index.sealed = !is_last;
    let mut offset = 0;

    let cut_at = loop {
        let record = match read_record(&mut reader, offset).map_err(|e| frame_error(path, offset, e))? {
            RecordRead::End => break None,
            // read_record only reports Torn once the file has run out
            RecordRead::Torn { offset } => {
                if !is_last {
                    return Err(RecoveryError::TornSealedSegment {
                        path: path.display().to_string(),
                        offset,
                    }
                    .into());
                }
                break Some(offset);
            }
            RecordRead::Record(record) => record,
        };

        if let Err(e) = record.verify() {
            let trailing = record.offset + record.len == size;
            if is_last && trailing {
                break Some(record.offset);
            }
            return Err(frame_error(path, record.offset, e));
        }
        if record.lsn <= *previous {
            return Err(RecoveryError::OutOfOrder {
                path: path.display().to_string(),
                lsn: record.lsn,
                previous: *previous,
            }
            .into());
        }

        *previous = record.lsn;
        index.observe(record.lsn);
        offset += record.len;
    };

    let mut truncated = 0;
    if let Some(cut) = cut_at {
        truncated = size - cut;
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| io_error(path, e))?;
        file.set_len(cut).map_err(|e| io_error(path, e))?;
        file.sync_all().map_err(|e| io_error(path, e))?;
        tracing::warn!(
            "truncated {truncated} byte(s) of torn tail from {} at offset {cut}",
            path.display()
        );
    }
    Ok((index, truncated))
}

/// Receives replayed records.
pub trait WalConsumer {
    /// Applies one record.
    ///
    /// # Errors
    ///
    /// Any error aborts the stream.
    fn consume(&mut self, lsn: u64, payload: &[u8]) -> Result<()>;

    /// Highest LSN already reflected in the consumer's state.
    fn last_applied_lsn(&self) -> u64;

    /// Called once after the stream ends successfully.
    ///
    /// # Errors
    ///
    /// Any error is returned from the stream call.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Options for a replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Run [`RecoveryScanner::recover`] before reading.
    pub run_recovery: bool,
    /// Verify each record's checksum.
    pub verify_crc: bool,
    /// Stop at the persisted watermark when `up_to_lsn` is not set.
    pub fence_to_persisted_lsn: bool,
    /// Stop after this LSN.
    pub up_to_lsn: Option<u64>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            run_recovery: true,
            verify_crc: true,
            fence_to_persisted_lsn: false,
            up_to_lsn: None,
        }
    }
}

/// Summary of a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamResult {
    /// Records handed to the consumer.
    pub records_delivered: u64,
    /// LSN of the last delivered record, or the start LSN if none.
    pub last_delivered_lsn: u64,
    /// Segments that were opened.
    pub segments_visited: usize,
    /// Offset of an incomplete record the last segment ended in, if any.
    /// Only set when recovery ran first, which means a writer was still
    /// appending while the stream read.
    pub torn_at: Option<u64>,
}

/// Replays the log under a WAL directory.
#[derive(Debug, Clone)]
pub struct WalStreamer {
    root: PathBuf,
}

impl WalStreamer {
    /// Streamer over the WAL directory `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Streams records after `consumer.last_applied_lsn()` and then flushes
    /// the consumer.
    ///
    /// # Errors
    ///
    /// See [`WalStreamer::stream_from`]; also returns the consumer's flush error.
    pub fn stream(&self, consumer: &mut dyn WalConsumer, options: &StreamOptions) -> Result<StreamResult> {
        let start = consumer.last_applied_lsn();
        let result = self.stream_from(start, consumer, options)?;
        consumer.flush()?;
        Ok(result)
    }

    /// Streams records with LSN greater than `start_after`.
    ///
    /// Segment sizes are captured before reading, so records appended while
    /// the stream runs are not delivered. Sealed segments whose side index
    /// shows nothing above `start_after` are skipped without being opened.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError::Corruption`] on a malformed header or a
    /// checksum failure, [`RecoveryError::TornSealedSegment`] for a torn
    /// record before the last segment, [`RecoveryError::TornTail`] for a torn
    /// last record when `run_recovery` is off, [`RecoveryError::OutOfOrder`] if delivered LSNs would not
    /// increase, [`RecoveryError::Consumer`] if the consumer fails, and
    /// scanner or I/O errors.
    pub fn stream_from(
        &self,
        start_after: u64,
        consumer: &mut dyn WalConsumer,
        options: &StreamOptions,
    ) -> Result<StreamResult> {
        if options.run_recovery {
            RecoveryScanner::recover(&self.root)?;
        }

        let ceiling = match options.up_to_lsn {
            Some(limit) => Some(limit),
            None if options.fence_to_persisted_lsn => {
                let persisted = PersistedLsnStore::open(&self.root).read()?;
                (persisted > 0).then_some(persisted)
            }
            None => None,
        };

        let mut views = Vec::new();
        for segment in list_segments(&self.root)? {
            let size = segment.len()?;
            let index = SegmentIndex::load_or_new(&segment)?;
            views.push((segment, size, index));
        }

        let mut result = StreamResult {
            last_delivered_lsn: start_after,
            ..StreamResult::default()
        };
        let count = views.len();
        for (i, (segment, size, index)) in views.into_iter().enumerate() {
            if index.sealed && index.max_lsn != 0 && index.max_lsn <= start_after {
                continue;
            }
            result.segments_visited += 1;
            let is_last = i + 1 == count;
            let finished = self.stream_segment(
                &segment,
                size,
                is_last,
                start_after,
                ceiling,
                consumer,
                options,
                &mut result,
            )?;
            if finished {
                break;
            }
        }

        tracing::debug!(
            "streamed {} record(s) after LSN {start_after}, last {}",
            result.records_delivered,
            result.last_delivered_lsn
        );
        Ok(result)
    }

    /// Streams one segment; returns `true` once the ceiling has been reached.
    #[allow(clippy::too_many_arguments)]
    fn stream_segment(
        &self,
        segment: &Segment,
        size: u64,
        is_last: bool,
        start_after: u64,
        ceiling: Option<u64>,
        consumer: &mut dyn WalConsumer,
        options: &StreamOptions,
        result: &mut StreamResult,
    ) -> Result<bool> {
        let path = &segment.path;
        let file = File::open(path).map_err(|e| io_error(path, e))?;
        let mut reader = BufReader::new(file).take(size);
        let mut offset = 0;

        loop {
            let record = match read_record(&mut reader, offset).map_err(|e| frame_error(path, offset, e))? {
                RecordRead::End => return Ok(false),
                RecordRead::Torn { offset } if is_last && options.run_recovery => {
                    tracing::warn!("stopping at torn record in {} offset {offset}", path.display());
                    result.torn_at = Some(offset);
                    return Ok(false);
                }
                RecordRead::Torn { offset } if is_last => {
                    return Err(RecoveryError::TornTail {
                        path: path.display().to_string(),
                        offset,
                    }
                    .into());
                }
                RecordRead::Torn { offset } => {
                    return Err(RecoveryError::TornSealedSegment {
                        path: path.display().to_string(),
                        offset,
                    }
                    .into());
                }
                RecordRead::Record(record) => record,
            };
            offset += record.len;

            if options.verify_crc {
                record
                    .verify()
                    .map_err(|e| frame_error(path, record.offset, e))?;
            }
            if record.lsn <= start_after {
                continue;
            }
            if ceiling.is_some_and(|limit| record.lsn > limit) {
                return Ok(true);
            }
            if result.records_delivered > 0 && record.lsn <= result.last_delivered_lsn {
                return Err(RecoveryError::OutOfOrder {
                    path: path.display().to_string(),
                    lsn: record.lsn,
                    previous: result.last_delivered_lsn,
                }
                .into());
            }

            consumer
                .consume(record.lsn, &record.payload)
                .map_err(|e| RecoveryError::Consumer {
                    lsn: record.lsn,
                    reason: e.to_string(),
                })?;
            result.records_delivered += 1;
            result.last_delivered_lsn = record.lsn;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::frame::{CounterFramer, framed_len};
    use crate::wal::spillover::{FsyncPolicy, SpilloverWriter};
    use std::fs;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Collect {
        records: Vec<(u64, Vec<u8>)>,
        start: u64,
        flushed: bool,
    }

    impl WalConsumer for Collect {
        fn consume(&mut self, lsn: u64, payload: &[u8]) -> Result<()> {
            self.records.push((lsn, payload.to_vec()));
            Ok(())
        }
        fn last_applied_lsn(&self) -> u64 {
            self.records.last().map_or(self.start, |(lsn, _)| *lsn)
        }
        fn flush(&mut self) -> Result<()> {
            self.flushed = true;
            Ok(())
        }
    }

    fn write_log(root: &Path, records: usize, segment_bytes: u64) {
        let mut writer =
            SpilloverWriter::open(root, CounterFramer::new(), segment_bytes, FsyncPolicy::Manual)
                .unwrap();
        for i in 0..records {
            writer.write(format!("record-{i:03}").as_bytes()).unwrap();
        }
        writer.close().unwrap();
    }

    fn lsns(c: &Collect) -> Vec<u64> {
        c.records.iter().map(|(lsn, _)| *lsn).collect()
    }

    fn last_segment(root: &Path) -> PathBuf {
        list_segments(root).unwrap().pop().unwrap().path
    }

    #[test]
    fn test_stream_everything_across_segments() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), 10, (framed_len(10) * 3) as u64);
        assert!(list_segments(dir.path()).unwrap().len() >= 3);

        let mut consumer = Collect::default();
        let result = WalStreamer::new(dir.path())
            .stream(&mut consumer, &StreamOptions::default())
            .unwrap();

        assert_eq!(lsns(&consumer), (1..=10).collect::<Vec<_>>());
        assert_eq!(consumer.records[0].1, b"record-000");
        assert_eq!(result.records_delivered, 10);
        assert_eq!(result.last_delivered_lsn, 10);
        assert!(consumer.flushed);
    }

    #[test]
    fn test_resume_skips_covered_segments() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), 9, (framed_len(10) * 3) as u64);

        let mut consumer = Collect {
            start: 7,
            ..Collect::default()
        };
        let result = WalStreamer::new(dir.path())
            .stream(&mut consumer, &StreamOptions::default())
            .unwrap();

        assert_eq!(lsns(&consumer), vec![8, 9]);
        assert_eq!(result.segments_visited, 1);
    }

    #[test]
    fn test_up_to_lsn_stops_cleanly() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), 8, 1 << 20);

        let options = StreamOptions {
            up_to_lsn: Some(5),
            ..StreamOptions::default()
        };
        let mut consumer = Collect::default();
        let result = WalStreamer::new(dir.path())
            .stream_from(2, &mut consumer, &options)
            .unwrap();

        assert_eq!(lsns(&consumer), vec![3, 4, 5]);
        assert_eq!(result.last_delivered_lsn, 5);
    }

    #[test]
    fn test_fence_to_persisted_lsn() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), 8, 1 << 20);
        PersistedLsnStore::open(dir.path()).write(6).unwrap();

        let streamer = WalStreamer::new(dir.path());
        let mut consumer = Collect {
            start: 3,
            ..Collect::default()
        };
        let fenced = StreamOptions {
            fence_to_persisted_lsn: true,
            ..StreamOptions::default()
        };
        let result = streamer.stream(&mut consumer, &fenced).unwrap();
        assert_eq!(result.last_delivered_lsn, 6);

        let result = streamer
            .stream(&mut consumer, &StreamOptions::default())
            .unwrap();
        assert_eq!(result.last_delivered_lsn, 8);
        assert_eq!(lsns(&consumer), vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), 4, 1 << 20);
        let path = last_segment(dir.path());
        let full = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();

        let report = RecoveryScanner::recover(dir.path()).unwrap();
        assert_eq!(report.records, 3);
        assert_eq!(report.last_lsn, 3);
        assert_eq!(fs::metadata(&path).unwrap().len(), (framed_len(10) * 3) as u64);

        let mut consumer = Collect::default();
        WalStreamer::new(dir.path())
            .stream(&mut consumer, &StreamOptions::default())
            .unwrap();
        assert_eq!(lsns(&consumer), vec![1, 2, 3]);
    }

    #[test]
    fn test_bad_crc_on_last_record_is_truncated() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), 3, 1 << 20);
        let path = last_segment(dir.path());
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        fs::write(&path, &bytes).unwrap();

        let report = RecoveryScanner::recover(dir.path()).unwrap();
        assert_eq!(report.last_lsn, 2);
        assert_eq!(report.truncated_bytes, framed_len(10) as u64);
    }

    #[test]
    fn test_bad_crc_mid_log_is_fatal() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), 3, 1 << 20);
        let path = last_segment(dir.path());
        let mut bytes = fs::read(&path).unwrap();
        // last payload byte of the first record
        bytes[framed_len(10) - 1] ^= 0x55;
        fs::write(&path, &bytes).unwrap();

        let err = RecoveryScanner::recover(dir.path()).unwrap_err();
        assert!(matches!(err, RollwalError::Recovery(RecoveryError::Corruption { offset: 0, .. })));

        let options = StreamOptions {
            run_recovery: false,
            ..StreamOptions::default()
        };
        let mut consumer = Collect::default();
        assert!(
            WalStreamer::new(dir.path())
                .stream(&mut consumer, &options)
                .is_err()
        );
        assert!(consumer.records.is_empty());
    }

    #[test]
    fn test_bad_length_prefix_mid_segment_is_fatal() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), 3, 1 << 20);
        let path = last_segment(dir.path());
        let mut bytes = fs::read(&path).unwrap();
        let size = bytes.len() as u64;
        bytes[3] = 9;
        fs::write(&path, &bytes).unwrap();

        let err = RecoveryScanner::recover(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            RollwalError::Recovery(RecoveryError::Corruption {
                offset: 0,
                source: FrameError::Malformed { .. },
                ..
            })
        ));
        assert_eq!(fs::metadata(&path).unwrap().len(), size);

        // a malformed second record is just as fatal
        bytes[3] = 8;
        bytes[framed_len(10) + 15] = 0;
        fs::write(&path, &bytes).unwrap();
        let err = RecoveryScanner::recover(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            RollwalError::Recovery(RecoveryError::Corruption { offset, .. }) if offset == framed_len(10) as u64
        ));
        assert_eq!(fs::metadata(&path).unwrap().len(), size);
    }

    #[test]
    fn test_stream_without_recovery_rejects_torn_tail() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), 3, 1 << 20);
        let path = last_segment(dir.path());
        let full = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(full - 2).unwrap();

        let raw = StreamOptions {
            run_recovery: false,
            ..StreamOptions::default()
        };
        let mut consumer = Collect::default();
        let err = WalStreamer::new(dir.path())
            .stream(&mut consumer, &raw)
            .unwrap_err();
        assert!(matches!(
            err,
            RollwalError::Recovery(RecoveryError::TornTail { offset, .. }) if offset == 2 * framed_len(10) as u64
        ));
        assert_eq!(lsns(&consumer), vec![1, 2]);
        assert_eq!(fs::metadata(&path).unwrap().len(), full - 2);

        let mut consumer = Collect::default();
        let result = WalStreamer::new(dir.path())
            .stream(&mut consumer, &StreamOptions::default())
            .unwrap();
        assert_eq!(lsns(&consumer), vec![1, 2]);
        assert_eq!(result.torn_at, None, "recovery already cut the tail");
    }

    #[test]
    fn test_torn_sealed_segment_is_fatal() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), 6, (framed_len(10) * 3) as u64);
        let first = list_segments(dir.path()).unwrap().remove(0).path;
        let len = fs::metadata(&first).unwrap().len();
        let file = OpenOptions::new().write(true).open(&first).unwrap();
        file.set_len(len - 1).unwrap();

        let err = RecoveryScanner::recover(dir.path()).unwrap_err();
        assert!(matches!(err, RollwalError::Recovery(RecoveryError::TornSealedSegment { .. })));
    }

    #[test]
    fn test_recover_rebuilds_indexes() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), 7, (framed_len(10) * 3) as u64);
        for segment in list_segments(dir.path()).unwrap() {
            fs::remove_file(crate::wal::segment::index_path(&segment.path)).unwrap();
        }

        RecoveryScanner::recover(dir.path()).unwrap();
        let segments = list_segments(dir.path()).unwrap();
        let indexes: Vec<_> = segments
            .iter()
            .map(|s| SegmentIndex::load_or_new(s).unwrap())
            .collect();
        assert!(indexes[..indexes.len() - 1].iter().all(|i| i.sealed));
        assert!(!indexes.last().unwrap().sealed);
        assert_eq!(indexes[0].min_lsn, 1);
        assert_eq!(indexes.last().unwrap().max_lsn, 7);
    }

    #[test]
    fn test_consumer_failure_aborts() {
        struct Failing;
        impl WalConsumer for Failing {
            fn consume(&mut self, _: u64, _: &[u8]) -> Result<()> {
                Err(FrameError::LsnNotSet.into())
            }
            fn last_applied_lsn(&self) -> u64 {
                0
            }
        }

        let dir = tempdir().unwrap();
        write_log(dir.path(), 2, 1 << 20);
        let err = WalStreamer::new(dir.path())
            .stream(&mut Failing, &StreamOptions::default())
            .unwrap_err();
        assert!(matches!(err, RollwalError::Recovery(RecoveryError::Consumer { lsn: 1, .. })));
    }
}
