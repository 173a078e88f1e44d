//! Reclaiming sealed segments.
//!
//! A segment is eligible once it is sealed and every LSN it holds is at or
//! below the persisted watermark. Eligible segments, minus the newest
//! `keep_last_sealed` of them, are moved with their side index into a
//! quarantine batch `<root>/<trash_dir>/<millis>/`. Quarantine batches older
//! than the grace period are deleted on a later run. The quarantine lives on
//! disk, so a restart neither forgets nor resurrects anything.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cluster::ClockSource;
use crate::config::CleanerConfig;
use crate::error::{CleanerError, Result};
use crate::wal::segment::{Segment, SegmentIndex, index_path, list_segments};
use crate::wal::watermark::PersistedLsnStore;

/// What a cleaner run did, or would do in dry-run mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanerReport {
    /// Watermark the run used.
    pub watermark: u64,
    /// Segments moved to quarantine.
    pub quarantined: Vec<PathBuf>,
    /// Quarantine batches permanently deleted.
    pub purged_batches: Vec<PathBuf>,
    /// Segments that vanished or failed to move and were skipped.
    pub skipped: usize,
    /// Whether the run only computed decisions.
    pub dry_run: bool,
}

/// Moves covered segments to quarantine and purges expired quarantine.
pub struct SegmentCleaner {
    root: PathBuf,
    config: CleanerConfig,
    clock: Arc<dyn ClockSource>,
    running: Mutex<()>,
}

impl SegmentCleaner {
    /// Creates a cleaner for the WAL directory `root`.
    pub fn new(root: impl Into<PathBuf>, config: CleanerConfig, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            root: root.into(),
            config,
            clock,
            running: Mutex::new(()),
        }
    }

    /// Directory holding quarantine batches.
    pub fn trash_root(&self) -> PathBuf {
        self.root.join(&self.config.trash_dir)
    }

    /// Runs one cleaning pass.
    ///
    /// Eligibility is recomputed from the directory and side indexes on
    /// every run, so an interrupted run is safe to repeat. Segments that
    /// disappear mid-run are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the watermark, the segment list, or the
    /// quarantine directory cannot be read or created.
    pub fn run(&self) -> Result<CleanerReport> {
        let watermark = PersistedLsnStore::open(&self.root).read()?;
        self.run_at(watermark)
    }

    /// Runs one cleaning pass against an explicit watermark instead of the
    /// persisted one.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment list or the quarantine directory
    /// cannot be read or created.
    pub fn run_at(&self, watermark: u64) -> Result<CleanerReport> {
        let _running = self.running.lock();
        let mut report = CleanerReport {
            watermark,
            dry_run: self.config.dry_run,
            ..CleanerReport::default()
        };

        let victims = if watermark == 0 {
            Vec::new()
        } else {
            self.eligible(watermark)?
        };

        if !victims.is_empty() {
            if self.config.dry_run {
                report.quarantined = victims.into_iter().map(|s| s.path).collect();
            } else {
                let batch = self.create_batch_dir()?;
                for segment in victims {
                    match quarantine(&segment, &batch) {
                        Ok(()) => report.quarantined.push(segment.path),
                        Err(e) => {
                            tracing::warn!(
                                "skipping segment {} during cleanup: {e}",
                                segment.path.display()
                            );
                            report.skipped += 1;
                        }
                    }
                }
            }
        }

        if !self.config.dry_run {
            report.purged_batches = self.purge_expired()?;
        }

        if !report.quarantined.is_empty() || !report.purged_batches.is_empty() {
            tracing::info!(
                "cleaner (watermark {watermark}{}): quarantined {} segment(s), purged {} batch(es), skipped {}",
                if report.dry_run { ", dry run" } else { "" },
                report.quarantined.len(),
                report.purged_batches.len(),
                report.skipped
            );
        }
        Ok(report)
    }

    fn eligible(&self, watermark: u64) -> Result<Vec<Segment>> {
        let mut eligible = Vec::new();
        for segment in list_segments(&self.root)? {
            let index = match SegmentIndex::load_or_new(&segment) {
                Ok(index) => index,
                Err(e) => {
                    tracing::warn!("ignoring segment {}: {e}", segment.path.display());
                    continue;
                }
            };
            if index.sealed && index.max_lsn != 0 && index.max_lsn <= watermark {
                eligible.push(segment);
            }
        }
        // list_segments sorts by epoch; the newest K stay as a cushion
        let keep = self.config.keep_last_sealed.min(eligible.len());
        eligible.truncate(eligible.len() - keep);
        Ok(eligible)
    }

    fn create_batch_dir(&self) -> Result<PathBuf> {
        let trash = self.trash_root();
        let now = self.clock.current_time_millis();
        let mut batch = trash.join(now.to_string());
        let mut suffix = 1;
        while batch.exists() {
            batch = trash.join(format!("{now}-{suffix}"));
            suffix += 1;
        }
        fs::create_dir_all(&batch).map_err(|source| CleanerError::Quarantine {
            path: batch.display().to_string(),
            source,
        })?;
        Ok(batch)
    }

    fn purge_expired(&self) -> Result<Vec<PathBuf>> {
        let trash = self.trash_root();
        if !trash.is_dir() {
            return Ok(Vec::new());
        }
        let list_err = |source| CleanerError::ListTrash {
            path: trash.display().to_string(),
            source,
        };

        let now = self.clock.current_time_millis();
        let grace = millis(self.config.grace_period);
        let mut purged = Vec::new();
        for entry in fs::read_dir(&trash).map_err(list_err)? {
            let entry = entry.map_err(list_err)?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(created) = batch_time(&path) else {
                tracing::warn!("unrecognized quarantine entry {}", path.display());
                continue;
            };
            if grace == 0 || now.saturating_sub(created) >= grace {
                match fs::remove_dir_all(&path) {
                    Ok(()) => purged.push(path),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!("failed to purge {}: {e}", path.display()),
                }
            }
        }

        let empty = fs::read_dir(&trash)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty && let Err(e) = fs::remove_dir(&trash) {
            tracing::debug!("could not remove empty quarantine root: {e}");
        }
        Ok(purged)
    }
}

#[allow(clippy::cast_possible_truncation)] // grace periods are far below u64 millis
fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Creation time of a quarantine batch, from its `<millis>[-n]` name.
fn batch_time(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.split('-').next()?.parse().ok()
}

fn quarantine(segment: &Segment, batch: &Path) -> io::Result<()> {
    let name = segment
        .path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "segment has no file name"))?;
    move_file(&segment.path, &batch.join(name))?;

    let index = index_path(&segment.path);
    if let Some(index_name) = index.file_name()
        && index.exists()
    {
        move_file(&index, &batch.join(index_name))?;
    }
    Ok(())
}

/// Renames `from` to `to`, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
