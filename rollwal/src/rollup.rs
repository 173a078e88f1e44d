//! Per-shard series store with secondly, minutely and hourly rollups.
//!
//! Every written point updates three [`Statistics`] buckets, one per
//! [`Resolution`]. Buckets are keyed `"<series>:<s|m|h>:<bucket index>"`
//! where the bucket index is the timestamp in milliseconds divided by the
//! resolution width.

use std::collections::BTreeSet;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::codec::{StreamReader, put_bytes, put_str, put_u32};
use crate::error::{RollupError, SnapshotError};
use crate::stats::{Aggregation, Statistics};

/// Marker written before a series checkpoint.
pub const CHECKPOINT_MAGIC: &str = "RollupSeriesStart";

/// Marker written after a series checkpoint.
pub const CHECKPOINT_MAGIC_END: &str = "RollupSeriesEnd";

const MAX_KEY_LEN: usize = 64 * 1024;
const MAX_STATS_LEN: usize = 64 * 1024 * 1024;

/// Rollup granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// One-second buckets.
    Secondly,
    /// One-minute buckets.
    Minutely,
    /// One-hour buckets.
    Hourly,
}

impl Resolution {
    /// Every resolution, finest first.
    pub const ALL: [Resolution; 3] = [Self::Secondly, Self::Minutely, Self::Hourly];

    /// Bucket width in milliseconds.
    pub fn increment_ms(self) -> u64 {
        match self {
            Self::Secondly => 1_000,
            Self::Minutely => 60_000,
            Self::Hourly => 3_600_000,
        }
    }

    /// Bucket index containing `ts`.
    pub fn quantize(self, ts: u64) -> u64 {
        ts / self.increment_ms()
    }

    /// Start of the bucket containing `ts`, in milliseconds.
    pub fn bucket_start(self, ts: u64) -> u64 {
        self.quantize(ts) * self.increment_ms()
    }

    /// Storage key of the bucket holding `ts` for `series`.
    pub fn key(self, series: &str, ts: u64) -> String {
        format!("{series}:{}:{}", self.tag(), self.quantize(ts))
    }

    fn tag(self) -> &'static str {
        match self {
            Self::Secondly => "s",
            Self::Minutely => "m",
            Self::Hourly => "h",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Secondly => "secondly",
            Self::Minutely => "minutely",
            Self::Hourly => "hourly",
        };
        f.write_str(name)
    }
}

/// Aggregated values of one series over a range, one entry per populated bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanResult {
    /// The series that was scanned.
    pub series: String,
    /// Bucket start times in milliseconds, ascending.
    pub timestamps: Vec<u64>,
    /// Aggregate value of each bucket.
    pub values: Vec<f64>,
}

impl ScanResult {
    /// Number of buckets returned.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether no buckets were populated.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// The rollups of every series routed to one shard.
///
/// Safe for concurrent writers; each bucket is updated under its own lock.
///
/// # Examples
///
/// ```rust
/// use rollwal::rollup::{Resolution, RollupSeries};
/// use rollwal::stats::Aggregation;
///
/// let series = RollupSeries::new();
/// series.write_batch("cpu", &[0, 1_000, 2_000], &[1.0, 2.0, 3.0])?;
///
/// let scan = series.scan("cpu", 0, 2_000, Aggregation::Sum, Resolution::Minutely)?;
/// assert_eq!(scan.values, vec![6.0]);
/// # Ok::<(), rollwal::error::RollwalError>(())
/// ```
#[derive(Debug, Default)]
pub struct RollupSeries {
    stats: DashMap<String, Arc<Statistics>>,
}

impl RollupSeries {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one point into all three resolutions.
    pub fn write(&self, series: &str, ts: u64, value: f64) {
        for res in Resolution::ALL {
            self.bucket(res.key(series, ts)).update(value);
        }
    }

    /// Records a batch of points for one series.
    ///
    /// # Errors
    ///
    /// Returns [`RollupError::LengthMismatch`] if the slices differ in length.
    pub fn write_batch(
        &self,
        series: &str,
        timestamps: &[u64],
        values: &[f64],
    ) -> Result<(), RollupError> {
        if timestamps.len() != values.len() {
            return Err(RollupError::LengthMismatch {
                timestamps: timestamps.len(),
                values: values.len(),
            });
        }
        for (ts, value) in timestamps.iter().zip(values) {
            self.write(series, *ts, *value);
        }
        Ok(())
    }

    fn bucket(&self, key: String) -> Arc<Statistics> {
        if let Some(existing) = self.stats.get(&key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.stats.entry(key).or_default().value())
    }

    /// Aggregates each populated bucket of `series` between `start` and `end`
    /// inclusive. Empty buckets are omitted rather than reported as zero.
    ///
    /// # Errors
    ///
    /// Returns [`RollupError::InvalidTimeRange`] if `start > end`.
    pub fn scan(
        &self,
        series: &str,
        start: u64,
        end: u64,
        agg: Aggregation,
        res: Resolution,
    ) -> Result<ScanResult, RollupError> {
        if start > end {
            return Err(RollupError::InvalidTimeRange { start, end });
        }
        let mut out = ScanResult {
            series: series.to_string(),
            ..ScanResult::default()
        };
        for (ts, stats) in self.populated(series, start, end, res) {
            out.timestamps.push(ts);
            out.values.push(stats.aggregate(agg));
        }
        Ok(out)
    }

    /// Number of points recorded for `series` between `start` and `end`.
    pub fn count(&self, series: &str, start: u64, end: u64, res: Resolution) -> u64 {
        if start > end {
            return 0;
        }
        self.populated(series, start, end, res)
            .into_iter()
            .map(|(_, stats)| stats.count())
            .sum()
    }

    /// Populated buckets of `series` in `[start, end]`, ordered by bucket start.
    ///
    /// Looks up bucket by bucket when the range is narrower than the store,
    /// otherwise filters the stored keys, so cost is bounded by the smaller
    /// of the two.
    fn populated(&self, series: &str, start: u64, end: u64, res: Resolution) -> Vec<(u64, Arc<Statistics>)> {
        let step = res.increment_ms();
        let (first, last) = (res.quantize(start), res.quantize(end));
        let stored = u64::try_from(self.stats.len()).unwrap_or(u64::MAX);
        if last - first < stored {
            return (first..=last)
                .filter_map(|bucket| {
                    let ts = bucket * step;
                    self.statistics(series, ts, res).map(|stats| (ts, stats))
                })
                .collect();
        }

        let prefix = format!("{series}:{}:", res.tag());
        let mut hits: Vec<(u64, Arc<Statistics>)> = self
            .stats
            .iter()
            .filter_map(|entry| {
                let bucket: u64 = entry.key().strip_prefix(&prefix)?.parse().ok()?;
                (first..=last)
                    .contains(&bucket)
                    .then(|| (bucket * step, Arc::clone(entry.value())))
            })
            .collect();
        hits.sort_unstable_by_key(|(ts, _)| *ts);
        hits
    }

    /// Bucket of `series` containing `ts` at resolution `res`.
    pub fn statistics(&self, series: &str, ts: u64, res: Resolution) -> Option<Arc<Statistics>> {
        self.stats
            .get(&res.key(series, ts))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Secondly bucket of `series` containing `ts`.
    pub fn secondly(&self, series: &str, ts: u64) -> Option<Arc<Statistics>> {
        self.statistics(series, ts, Resolution::Secondly)
    }

    /// Minutely bucket of `series` containing `ts`.
    pub fn minutely(&self, series: &str, ts: u64) -> Option<Arc<Statistics>> {
        self.statistics(series, ts, Resolution::Minutely)
    }

    /// Hourly bucket of `series` containing `ts`.
    pub fn hourly(&self, series: &str, ts: u64) -> Option<Arc<Statistics>> {
        self.statistics(series, ts, Resolution::Hourly)
    }

    /// Distinct series names held by this store.
    pub fn metric_paths(&self) -> BTreeSet<String> {
        self.stats
            .iter()
            .filter_map(|entry| series_of_key(entry.key()).map(str::to_owned))
            .collect()
    }

    /// All bucket keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.stats.iter().map(|e| e.key().clone()).collect();
        keys.sort_unstable();
        keys
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    /// Whether no points have been written.
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Serialized statistics of one bucket key.
    pub fn serialized_stats(&self, key: &str) -> Option<Vec<u8>> {
        self.stats.get(key).map(|entry| entry.value().serialize())
    }

    /// Writes every bucket, sorted by key.
    ///
    /// Each bucket is serialized atomically; buckets written concurrently
    /// with the checkpoint may or may not include the concurrent update.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if writing to `out` fails.
    pub fn checkpoint(&self, out: &mut impl Write) -> Result<(), SnapshotError> {
        let entries: Vec<(String, Arc<Statistics>)> = self
            .stats
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        write_entries(entries, out)
    }

    /// Writes only the listed bucket keys that exist.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if writing to `out` fails.
    pub fn checkpoint_subset<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
        out: &mut impl Write,
    ) -> Result<(), SnapshotError> {
        let entries: Vec<(String, Arc<Statistics>)> = keys
            .into_iter()
            .filter_map(|k| {
                self.stats
                    .get(k)
                    .map(|e| (k.to_string(), Arc::clone(e.value())))
            })
            .collect();
        write_entries(entries, out)
    }

    /// Writes every bucket whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if writing to `out` fails.
    pub fn write_metric(&self, prefix: &str, out: &mut impl Write) -> Result<(), SnapshotError> {
        let entries: Vec<(String, Arc<Statistics>)> = self
            .stats
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        write_entries(entries, out)
    }

    /// Reads a store written by [`RollupSeries::checkpoint`].
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the input is truncated, lacks its
    /// markers, or holds undecodable statistics.
    pub fn from_checkpoint(input: &mut impl Read) -> Result<Self, SnapshotError> {
        let mut reader = StreamReader::new(input);
        expect_magic(&mut reader, CHECKPOINT_MAGIC)?;
        let count = reader.u32()?;
        let stats = DashMap::with_capacity(count.min(1 << 16) as usize);
        for _ in 0..count {
            let key = reader.string(MAX_KEY_LEN)?;
            let bytes = reader.bytes(MAX_STATS_LEN)?;
            let decoded = Statistics::deserialize(&bytes).map_err(|e| SnapshotError::Corrupted {
                reason: format!("bucket '{key}': {e}"),
            })?;
            stats.insert(key, Arc::new(decoded));
        }
        expect_magic(&mut reader, CHECKPOINT_MAGIC_END)?;
        Ok(Self { stats })
    }
}

fn write_entries(
    mut entries: Vec<(String, Arc<Statistics>)>,
    out: &mut impl Write,
) -> Result<(), SnapshotError> {
    entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    let count = u32::try_from(entries.len()).map_err(|_| SnapshotError::Corrupted {
        reason: format!("{} buckets exceed checkpoint limit", entries.len()),
    })?;

    put_str(out, CHECKPOINT_MAGIC)?;
    put_u32(out, count)?;
    for (key, stats) in &entries {
        put_str(out, key)?;
        put_bytes(out, &stats.serialize())?;
    }
    put_str(out, CHECKPOINT_MAGIC_END)?;
    Ok(())
}

/// Reads a length-prefixed marker and checks it equals `magic`.
pub(crate) fn expect_magic<R: Read>(
    reader: &mut StreamReader<R>,
    magic: &'static str,
) -> Result<(), SnapshotError> {
    let found = reader.string(256)?;
    if found != magic {
        return Err(SnapshotError::BadMagic {
            expected: magic,
            found,
        });
    }
    Ok(())
}

/// Series name of a bucket key, i.e. the key without its `:<res>:<bucket>` suffix.
fn series_of_key(key: &str) -> Option<&str> {
    let mut parts = key.rsplitn(3, ':');
    let _bucket = parts.next()?;
    let _res = parts.next()?;
    parts.next()
}
