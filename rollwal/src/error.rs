//! Error types for the rollwal storage engine.

use thiserror::Error;

/// The main error type for all rollwal operations.
///
/// Each subsystem has its own error enum; this type wraps them so callers can
/// propagate any engine failure with `?` and still match on the origin.
#[derive(Error, Debug)]
pub enum RollwalError {
    /// Error managing segment files or their side indexes.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Error framing or reading a WAL record.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Error buffering events into batches.
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    /// Error reclaiming sealed segments.
    #[error("cleaner error: {0}")]
    Cleaner(#[from] CleanerError),

    /// Error scanning or replaying the log.
    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    /// Error reading or writing the persisted watermark.
    #[error("watermark error: {0}")]
    Watermark(#[from] WatermarkError),

    /// Error applying to or reading from the rollup store.
    #[error("rollup error: {0}")]
    Rollup(#[from] RollupError),

    /// Error writing or restoring a snapshot.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error in the write coordinator.
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
}

impl RollwalError {
    /// Returns `true` for malformed input the caller must fix before retrying.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Rollup(RollupError::LengthMismatch { .. } | RollupError::EmptyBatch)
                | Self::Batch(BatchError::RecordTooLarge { .. })
                | Self::Coordinator(CoordinatorError::NotOwner { .. })
        )
    }

    /// Returns `true` when the same request may succeed if retried later.
    ///
    /// Admission-window rejections are not retriable; the same stale
    /// timestamps always fail.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Coordinator(
                CoordinatorError::WalAppend { .. }
                    | CoordinatorError::NotReady { .. }
                    | CoordinatorError::NotConsuming
            )
        )
    }
}

/// Errors from the segment allocator and segment side indexes.
#[derive(Error, Debug)]
pub enum SegmentError {
    /// The WAL directory could not be created or listed.
    #[error("failed to access WAL directory '{path}': {source}")]
    DirectoryAccess {
        /// The directory path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A segment file could not be created or opened.
    #[error("failed to open segment '{path}': {source}")]
    Open {
        /// The segment path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A segment file could not be written, synced or truncated.
    #[error("I/O error on segment '{path}': {source}")]
    Io {
        /// The segment path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The side index of a segment could not be read or written.
    #[error("failed to access segment index '{path}': {source}")]
    IndexIo {
        /// The index path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The side index exists but is not valid JSON.
    #[error("corrupted segment index '{path}': {source}")]
    IndexCorrupted {
        /// The index path.
        path: String,
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A failed append could not be rolled back, so the active segment ends
    /// in a partial record and refuses further writes.
    #[error("segment '{path}' holds an unrecoverable partial record; reopen the log to repair it")]
    Poisoned {
        /// The segment path.
        path: String,
    },

    /// A file name did not follow the `wal_<epoch>.segment` pattern.
    #[error("not a segment file name: {name}")]
    InvalidName {
        /// The offending file name.
        name: String,
    },
}

/// Errors from record framing and parsing.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Writing the framed record to the channel failed.
    #[error("failed to write record with LSN {lsn}: {source}")]
    Write {
        /// The LSN being written.
        lsn: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Reading a record from a segment failed.
    #[error("failed to read record at offset {offset}: {source}")]
    Read {
        /// Byte offset of the record start.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A manual framer was asked to write without an LSN set.
    #[error("no LSN set on manual framer")]
    LsnNotSet,

    /// The manual LSN does not advance past the last one written.
    #[error("LSN {lsn} is not greater than last written LSN {last}")]
    LsnNotIncreasing {
        /// The LSN that was set.
        lsn: u64,
        /// The last LSN written by this framer.
        last: u64,
    },

    /// A record header holds a value no framer writes.
    #[error("malformed record at offset {offset}: {reason}")]
    Malformed {
        /// Byte offset of the record start.
        offset: u64,
        /// What was wrong.
        reason: String,
    },

    /// The stored checksum did not match the payload.
    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        /// Byte offset of the record start.
        offset: u64,
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },

    /// The payload could not be decoded into events.
    #[error("invalid payload: {reason}")]
    InvalidPayload {
        /// What was wrong.
        reason: String,
    },
}

/// Errors from the batch writer.
#[derive(Error, Debug)]
pub enum BatchError {
    /// A single event exceeds the configured batch byte limit.
    #[error("record too large: {size} bytes exceeds limit of {limit}")]
    RecordTooLarge {
        /// Conservative size of the event.
        size: usize,
        /// Configured byte limit.
        limit: usize,
    },

    /// The writer has been closed.
    #[error("batch writer is closed")]
    Closed,

    /// A background flush failed; the message is the original error.
    #[error("background flush failed: {reason}")]
    FlushFailed {
        /// Rendered error from the flush.
        reason: String,
    },
}

/// Errors from the segment cleaner.
#[derive(Error, Debug)]
pub enum CleanerError {
    /// The quarantine directory could not be created.
    #[error("failed to create quarantine directory '{path}': {source}")]
    Quarantine {
        /// The directory path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The quarantine root could not be listed.
    #[error("failed to list quarantine '{path}': {source}")]
    ListTrash {
        /// The directory path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from recovery scanning and streaming.
#[derive(Error, Debug)]
pub enum RecoveryError {
    /// A record before the tail of the log failed checksum verification.
    #[error("corrupt record in '{path}' at offset {offset}: {source}")]
    Corruption {
        /// The segment path.
        path: String,
        /// Byte offset of the record.
        offset: u64,
        /// The framing error that was detected.
        #[source]
        source: FrameError,
    },

    /// A segment ends in a torn record but is not the last segment.
    #[error("torn record in sealed segment '{path}' at offset {offset}")]
    TornSealedSegment {
        /// The segment path.
        path: String,
        /// Byte offset of the torn record.
        offset: u64,
    },

    /// The log ends in an incomplete record and recovery was not run.
    #[error("torn record at the end of '{path}' at offset {offset}; run recovery to truncate it")]
    TornTail {
        /// The segment path.
        path: String,
        /// Byte offset of the torn record.
        offset: u64,
    },

    /// Records were not in strictly increasing LSN order.
    #[error("LSN {lsn} in '{path}' does not follow previous LSN {previous}")]
    OutOfOrder {
        /// The segment path.
        path: String,
        /// The out-of-order LSN.
        lsn: u64,
        /// The previously seen LSN.
        previous: u64,
    },

    /// The consumer rejected a record.
    #[error("consumer failed at LSN {lsn}: {reason}")]
    Consumer {
        /// LSN of the record being delivered.
        lsn: u64,
        /// Rendered consumer error.
        reason: String,
    },

    /// A segment could not be read during the scan.
    #[error("failed to read segment '{path}': {source}")]
    Io {
        /// The segment path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The restored snapshot is older than the persisted watermark, so the
    /// log segments between them may already have been reclaimed.
    #[error("snapshot watermark {snapshot} is behind persisted watermark {persisted}")]
    SnapshotBehindWatermark {
        /// Watermark stored in the snapshot.
        snapshot: u64,
        /// Watermark read from the persisted store.
        persisted: u64,
    },
}

/// Errors from the persisted LSN watermark store.
#[derive(Error, Debug)]
pub enum WatermarkError {
    /// The watermark file could not be read or written.
    #[error("failed to access watermark file '{path}': {source}")]
    Io {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The watermark file does not contain an integer.
    #[error("corrupted watermark file '{path}': {content:?}")]
    Corrupted {
        /// The file path.
        path: String,
        /// What the file contained.
        content: String,
    },
}

/// Errors from the rollup store.
#[derive(Error, Debug)]
pub enum RollupError {
    /// Timestamp and value arrays differ in length.
    #[error("timestamps ({timestamps}) and values ({values}) differ in length")]
    LengthMismatch {
        /// Number of timestamps.
        timestamps: usize,
        /// Number of values.
        values: usize,
    },

    /// The batch has no points.
    #[error("batch contains no points")]
    EmptyBatch,

    /// A timestamp is older than the admission window allows.
    #[error("timestamp {timestamp} is older than admission window (now {now}, window {window_ms} ms)")]
    OutsideWindow {
        /// The rejected timestamp in milliseconds.
        timestamp: u64,
        /// The clock reading in milliseconds.
        now: u64,
        /// Admission window in milliseconds.
        window_ms: u64,
    },

    /// A query asked for an end time before its start time.
    #[error("invalid time range: start {start} > end {end}")]
    InvalidTimeRange {
        /// Range start in milliseconds.
        start: u64,
        /// Range end in milliseconds.
        end: u64,
    },

    /// A serialized statistics blob could not be decoded.
    #[error("corrupted statistics: {reason}")]
    CorruptedStatistics {
        /// What was wrong.
        reason: String,
    },
}

/// Errors from snapshot and checkpoint serialization.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Writing or reading snapshot bytes failed.
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot file could not be opened, synced or renamed.
    #[error("failed to access snapshot file '{path}': {source}")]
    File {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A magic marker was missing or wrong.
    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic {
        /// The expected marker.
        expected: &'static str,
        /// What was found instead.
        found: String,
    },

    /// The snapshot body could not be decoded.
    #[error("corrupted snapshot: {reason}")]
    Corrupted {
        /// What was wrong.
        reason: String,
    },
}

/// Errors from configuration handling.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read or written.
    #[error("failed to access config file '{path}': {source}")]
    Io {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::config::EngineConfig`].
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// The file path.
        path: String,
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A configuration value is out of range.
    #[error("invalid config: {reason}")]
    Invalid {
        /// What was wrong.
        reason: String,
    },
}

/// Errors from the write coordinator.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Writes were attempted before recovery completed.
    #[error("coordinator is not ready (state: {state})")]
    NotReady {
        /// The current state name.
        state: String,
    },

    /// The series is owned by another node.
    #[error("shard {shard} of series '{series}' is owned by node '{owner}'")]
    NotOwner {
        /// The series key.
        series: String,
        /// The resolved shard.
        shard: u32,
        /// The owning node.
        owner: String,
    },

    /// The cluster coordinator is not accepting writes right now.
    #[error("node is not accepting writes")]
    NotConsuming,

    /// The batch was applied in memory but could not be logged.
    ///
    /// The in-memory state already contains this batch. Until the next
    /// snapshot, a crash loses it.
    #[error("batch applied at LSN {lsn} but WAL append failed: {source}")]
    WalAppend {
        /// LSN assigned by the rollup store.
        lsn: u64,
        /// The WAL error.
        #[source]
        source: Box<RollwalError>,
    },

    /// The background snapshot scheduler has stopped.
    #[error("snapshot scheduler is not running")]
    SchedulerStopped,
}

/// Convenience type alias for Results with [`RollwalError`].
pub type Result<T> = std::result::Result<T, RollwalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err: RollwalError = RollupError::LengthMismatch {
            timestamps: 2,
            values: 3,
        }
        .into();
        assert!(err.is_client_error());
        assert!(!err.is_retriable());

        let err: RollwalError = RollupError::OutsideWindow {
            timestamp: 0,
            now: 10,
            window_ms: 5,
        }
        .into();
        assert!(!err.is_client_error());
        assert!(!err.is_retriable());

        let inner: RollwalError = FrameError::LsnNotSet.into();
        let err: RollwalError = CoordinatorError::WalAppend {
            lsn: 7,
            source: Box::new(inner),
        }
        .into();
        assert!(err.is_retriable());
    }

    #[test]
    fn test_error_display_includes_context() {
        let err: RollwalError = FrameError::ChecksumMismatch {
            offset: 40,
            expected: 0xdead_beef,
            actual: 0x1234_5678,
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("offset 40"));
        assert!(msg.contains("0xdeadbeef"));
    }
}
