//! The write-ahead log.
//!
//! The log is a directory of append-only segment files. Records carry an
//! LSN and a CRC32C checksum; see [`frame`] for the wire format.
//!
//! - [`segment`]: segment naming, side indexes, and the allocator
//! - [`frame`]: record framing and parsing
//! - [`batch`]: coalescing events into records
//! - [`spillover`]: appending with segment rollover and fsync policy
//! - [`cleaner`]: quarantining and purging covered segments
//! - [`recovery`]: tail repair and ordered replay
//! - [`watermark`]: the persisted snapshot watermark

pub mod batch;
pub mod cleaner;
pub mod frame;
pub mod recovery;
pub mod segment;
pub mod spillover;
pub mod watermark;

pub use batch::{BatchWriter, RecordSink, WalEvent};
pub use cleaner::{CleanerReport, SegmentCleaner};
pub use frame::{CounterFramer, ManualLsnFramer, RecordFramer};
pub use recovery::{RecoveryScanner, StreamOptions, StreamResult, WalConsumer, WalStreamer};
pub use segment::{Segment, SegmentAllocator, SegmentIndex};
pub use spillover::{CommitInfo, CommitListener, FsyncPolicy, SpilloverWriter};
pub use watermark::PersistedLsnStore;
