//! Segment files, their side indexes, and the segment allocator.
//!
//! Segments are named `wal_<10-digit epoch>.segment`. Each segment has a
//! JSON side index (`wal_<epoch>.segment.idx`) recording the LSN range it
//! holds and whether it has been sealed. The index lets the cleaner and the
//! streamer make decisions without reading segment bytes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SegmentError};

const SEGMENT_PREFIX: &str = "wal_";
const SEGMENT_SUFFIX: &str = ".segment";
const INDEX_SUFFIX: &str = ".idx";
const EPOCH_DIGITS: usize = 10;

/// Returns the file name for the segment with the given epoch.
pub fn segment_file_name(epoch: u64) -> String {
    format!("{SEGMENT_PREFIX}{epoch:010}{SEGMENT_SUFFIX}")
}

/// Parses the epoch out of a segment file name.
///
/// Returns `None` for anything that is not exactly `wal_<10 digits>.segment`,
/// including side index files.
pub fn parse_epoch(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    if digits.len() != EPOCH_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Path of the side index belonging to `segment`.
pub fn index_path(segment: &Path) -> PathBuf {
    let mut name = segment.as_os_str().to_owned();
    name.push(INDEX_SUFFIX);
    PathBuf::from(name)
}

/// A segment file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Monotonically increasing segment number.
    pub epoch: u64,
    /// Full path of the segment file.
    pub path: PathBuf,
}

impl Segment {
    fn new(root: &Path, epoch: u64) -> Self {
        Self {
            epoch,
            path: root.join(segment_file_name(epoch)),
        }
    }

    /// Current size of the segment file in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::Io`] if the file cannot be inspected.
    pub fn len(&self) -> Result<u64> {
        fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|source| {
                SegmentError::Io {
                    path: self.path.display().to_string(),
                    source,
                }
                .into()
            })
    }
}

/// Lists all segment files in `root`, sorted by epoch.
///
/// Files whose names do not match the segment pattern are ignored.
///
/// # Errors
///
/// Returns [`SegmentError::DirectoryAccess`] if the directory cannot be read.
pub fn list_segments(root: &Path) -> Result<Vec<Segment>> {
    let dir_err = |source| SegmentError::DirectoryAccess {
        path: root.display().to_string(),
        source,
    };

    let mut segments = Vec::new();
    for entry in fs::read_dir(root).map_err(dir_err)? {
        let entry = entry.map_err(dir_err)?;
        let name = entry.file_name();
        let Some(epoch) = name.to_str().and_then(parse_epoch) else {
            continue;
        };
        segments.push(Segment {
            epoch,
            path: entry.path(),
        });
    }
    segments.sort_by_key(|s| s.epoch);
    Ok(segments)
}

/// Side index describing the records held by one segment.
///
/// `min_lsn` and `max_lsn` are zero until the first record is observed;
/// LSNs start at 1 so zero never names a real record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentIndex {
    /// Epoch of the segment this index describes.
    pub epoch: u64,
    /// Smallest LSN in the segment, or 0 if empty.
    pub min_lsn: u64,
    /// Largest LSN in the segment, or 0 if empty.
    pub max_lsn: u64,
    /// Number of complete records in the segment.
    pub record_count: u64,
    /// Whether the segment has been rolled over and will receive no more writes.
    pub sealed: bool,
}

impl SegmentIndex {
    /// Creates an empty, unsealed index.
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            min_lsn: 0,
            max_lsn: 0,
            record_count: 0,
            sealed: false,
        }
    }

    /// Returns `true` if no record has been observed.
    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Records that a record with `lsn` was appended.
    pub fn observe(&mut self, lsn: u64) {
        if self.record_count == 0 || lsn < self.min_lsn {
            self.min_lsn = lsn;
        }
        self.max_lsn = self.max_lsn.max(lsn);
        self.record_count += 1;
    }

    /// Loads the index for `segment`, or a fresh unsealed one if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::IndexIo`] if the index exists but cannot be
    /// read, or [`SegmentError::IndexCorrupted`] if it is not valid JSON.
    pub fn load_or_new(segment: &Segment) -> Result<Self> {
        let path = index_path(&segment.path);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                SegmentError::IndexCorrupted {
                    path: path.display().to_string(),
                    source,
                }
                .into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(segment.epoch)),
            Err(source) => Err(SegmentError::IndexIo {
                path: path.display().to_string(),
                source,
            }
            .into()),
        }
    }

    /// Persists the index next to `segment`.
    ///
    /// The index is written to a temporary file, synced, then renamed over
    /// the old one, so readers see either the old or the new index.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::IndexIo`] if any step fails.
    pub fn save(&self, segment: &Segment) -> Result<()> {
        let path = index_path(&segment.path);
        let io_err = |source| SegmentError::IndexIo {
            path: path.display().to_string(),
            source,
        };

        let json = serde_json::to_vec(self).map_err(|source| SegmentError::IndexCorrupted {
            path: path.display().to_string(),
            source,
        })?;

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        Ok(())
    }
}

/// Owns the directory of segments and hands out the active one.
///
/// Exactly one segment is active at a time: the one with the highest epoch.
/// [`SegmentAllocator::allocate`] creates the next epoch and makes it active
/// without touching the previous segment.
#[derive(Debug)]
pub struct SegmentAllocator {
    root: PathBuf,
    active: Segment,
}

impl SegmentAllocator {
    /// Opens the segment directory, creating it and segment 1 if needed.
    ///
    /// # Arguments
    ///
    /// * `root` - Directory holding the segments
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::DirectoryAccess`] if the directory cannot be
    /// created or listed, or [`SegmentError::Open`] if the first segment
    /// cannot be created.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| SegmentError::DirectoryAccess {
            path: root.display().to_string(),
            source,
        })?;

        let active = match list_segments(&root)?.pop() {
            Some(segment) => segment,
            None => {
                let segment = Segment::new(&root, 1);
                create_segment_file(&segment)?;
                tracing::info!("created first WAL segment {}", segment.path.display());
                segment
            }
        };

        Ok(Self { root, active })
    }

    /// The directory holding the segments.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The segment currently receiving writes.
    pub fn active(&self) -> &Segment {
        &self.active
    }

    /// Creates the next segment and makes it active.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError::Open`] if the new file cannot be created.
    pub fn allocate(&mut self) -> Result<Segment> {
        let next = Segment::new(&self.root, self.active.epoch + 1);
        create_segment_file(&next)?;
        tracing::debug!(
            "allocated WAL segment {} (previous epoch {})",
            next.epoch,
            self.active.epoch
        );
        self.active = next.clone();
        Ok(next)
    }
}

fn create_segment_file(segment: &Segment) -> Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&segment.path)
        .map(drop)
        .map_err(|source| {
            SegmentError::Open {
                path: segment.path.display().to_string(),
                source,
            }
            .into()
        })
}
