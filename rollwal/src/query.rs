//! Composable queries over rollups.
//!
//! A [`Slice`] names one series, a time range, an aggregation and a
//! resolution. [`QueryProcessor`] scans slices through a [`SeriesReader`]
//! and combines them. Buckets with no data are absent from results rather
//! than zero, except where an operation has an identity: [`QueryProcessor::sum`]
//! treats a bucket missing on one side as contributing nothing, and the
//! moving sums emit `0.0` for windows with no points.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use rollwal::query::{QueryProcessor, Slice};
//! use rollwal::rollup::{Resolution, RollupSeries};
//! use rollwal::stats::Aggregation;
//!
//! let store = RollupSeries::new();
//! store.write_batch("cpu", &[0, 1_000, 2_000], &[1.0, 2.0, 3.0])?;
//!
//! let slice = Slice::new("cpu", 0, 2_000, Aggregation::Sum, Resolution::Secondly);
//! let avg = QueryProcessor.moving_average(&store, &slice, Duration::from_secs(1))?;
//! assert_eq!(avg.values, vec![1.0, 1.5, 2.5]);
//! # Ok::<(), rollwal::error::RollwalError>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::rollup::{Resolution, RollupSeries, ScanResult};
use crate::stats::Aggregation;

/// One series over a time range at a fixed aggregation and resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    /// Series name.
    pub series: String,
    /// Range start in milliseconds, inclusive.
    pub from: u64,
    /// Range end in milliseconds, inclusive.
    pub to: u64,
    /// Aggregate read from each bucket.
    pub aggregation: Aggregation,
    /// Bucket width.
    pub resolution: Resolution,
}

impl Slice {
    /// Creates a slice.
    pub fn new(
        series: impl Into<String>,
        from: u64,
        to: u64,
        aggregation: Aggregation,
        resolution: Resolution,
    ) -> Self {
        Self {
            series: series.into(),
            from,
            to,
            aggregation,
            resolution,
        }
    }
}

/// Output of a query: aligned timestamps and values.
pub type QueryResult = ScanResult;

/// Pointwise function applied by [`QueryProcessor::transform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    /// Natural logarithm.
    Log,
    /// Logistic function `1 / (1 + e^-x)`.
    Sigmoid,
}

impl Transform {
    fn apply(self, x: f64) -> f64 {
        match self {
            Self::Log => x.ln(),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

/// Source of bucket scans.
pub trait SeriesReader {
    /// Aggregates each populated bucket of the slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is invalid or the series cannot be read.
    fn scan(&self, slice: &Slice) -> Result<ScanResult>;
}

impl SeriesReader for RollupSeries {
    fn scan(&self, slice: &Slice) -> Result<ScanResult> {
        Ok(RollupSeries::scan(
            self,
            &slice.series,
            slice.from,
            slice.to,
            slice.aggregation,
            slice.resolution,
        )?)
    }
}

/// Stateless query operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryProcessor;

impl QueryProcessor {
    /// Raw bucket values.
    ///
    /// # Errors
    ///
    /// Propagates reader errors.
    pub fn scan(&self, reader: &dyn SeriesReader, slice: &Slice) -> Result<QueryResult> {
        reader.scan(slice)
    }

    /// Bucket values multiplied by `factor`.
    ///
    /// # Errors
    ///
    /// Propagates reader errors.
    pub fn scale(&self, reader: &dyn SeriesReader, slice: &Slice, factor: f64) -> Result<QueryResult> {
        let mut result = reader.scan(slice)?;
        result.values.iter_mut().for_each(|v| *v *= factor);
        Ok(result)
    }

    /// Pointwise sum of two slices aligned on bucket timestamps.
    ///
    /// A bucket present on only one side passes through unchanged. The
    /// result is named `"<left>+<right>"`.
    ///
    /// # Errors
    ///
    /// Propagates reader errors.
    pub fn sum(&self, reader: &dyn SeriesReader, left: &Slice, right: &Slice) -> Result<QueryResult> {
        let l = reader.scan(left)?;
        let r = reader.scan(right)?;
        let mut out = QueryResult {
            series: format!("{}+{}", left.series, right.series),
            timestamps: Vec::with_capacity(l.len().max(r.len())),
            values: Vec::with_capacity(l.len().max(r.len())),
        };

        let (mut i, mut j) = (0, 0);
        while i < l.len() || j < r.len() {
            let take_left = j >= r.len() || (i < l.len() && l.timestamps[i] <= r.timestamps[j]);
            let take_right = i >= l.len() || (j < r.len() && r.timestamps[j] <= l.timestamps[i]);
            match (take_left, take_right) {
                (true, true) => {
                    out.timestamps.push(l.timestamps[i]);
                    out.values.push(l.values[i] + r.values[j]);
                    i += 1;
                    j += 1;
                }
                (true, false) => {
                    out.timestamps.push(l.timestamps[i]);
                    out.values.push(l.values[i]);
                    i += 1;
                }
                _ => {
                    out.timestamps.push(r.timestamps[j]);
                    out.values.push(r.values[j]);
                    j += 1;
                }
            }
        }
        Ok(out)
    }

    /// Number of points recorded in the slice's range.
    ///
    /// # Errors
    ///
    /// Propagates reader errors.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // counts are exact integers
    pub fn count(&self, reader: &dyn SeriesReader, slice: &Slice) -> Result<u64> {
        let counted = Slice {
            aggregation: Aggregation::Count,
            ..slice.clone()
        };
        Ok(reader.scan(&counted)?.values.iter().map(|c| *c as u64).sum())
    }

    /// Applies `transform` to every bucket value.
    ///
    /// # Errors
    ///
    /// Propagates reader errors.
    pub fn transform(
        &self,
        reader: &dyn SeriesReader,
        slice: &Slice,
        transform: Transform,
    ) -> Result<QueryResult> {
        let mut result = reader.scan(slice)?;
        result.values.iter_mut().for_each(|v| *v = transform.apply(*v));
        Ok(result)
    }

    /// Mean of the buckets within `window` before each step of the range.
    ///
    /// Steps whose window holds no buckets are omitted.
    ///
    /// # Errors
    ///
    /// Propagates reader errors.
    #[allow(clippy::cast_precision_loss)]
    pub fn moving_average(
        &self,
        reader: &dyn SeriesReader,
        slice: &Slice,
        window: Duration,
    ) -> Result<QueryResult> {
        moving_window(reader, slice, window_ms(window), |sum, count| {
            (count > 0).then(|| sum / count as f64)
        })
    }

    /// Sum of the buckets within `window` before each step of the range.
    ///
    /// # Errors
    ///
    /// Propagates reader errors.
    pub fn moving_sum(
        &self,
        reader: &dyn SeriesReader,
        slice: &Slice,
        window: Duration,
    ) -> Result<QueryResult> {
        moving_window(reader, slice, window_ms(window), |sum, _| Some(sum))
    }

    /// Running total from the start of the range to each step.
    ///
    /// # Errors
    ///
    /// Propagates reader errors.
    pub fn aggregate_sum(&self, reader: &dyn SeriesReader, slice: &Slice) -> Result<QueryResult> {
        let span = slice.to.saturating_sub(slice.from);
        moving_window(reader, slice, span, |sum, _| Some(sum))
    }

    /// Change per millisecond between consecutive populated buckets,
    /// stamped at the later bucket.
    ///
    /// # Errors
    ///
    /// Propagates reader errors.
    #[allow(clippy::cast_precision_loss)]
    pub fn first_derivative(&self, reader: &dyn SeriesReader, slice: &Slice) -> Result<QueryResult> {
        let scan = reader.scan(slice)?;
        let mut out = QueryResult {
            series: scan.series.clone(),
            ..QueryResult::default()
        };
        for i in 1..scan.len() {
            let dt = (scan.timestamps[i] - scan.timestamps[i - 1]) as f64;
            out.timestamps.push(scan.timestamps[i]);
            out.values.push((scan.values[i] - scan.values[i - 1]) / dt);
        }
        Ok(out)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn window_ms(window: Duration) -> u64 {
    window.as_millis() as u64
}

/// Steps through every bucket start in the slice, keeping a running sum of
/// the scanned buckets whose timestamp lies in `[step - window, step]`.
fn moving_window(
    reader: &dyn SeriesReader,
    slice: &Slice,
    window: u64,
    emit: impl Fn(f64, usize) -> Option<f64>,
) -> Result<QueryResult> {
    let scan = reader.scan(slice)?;
    let mut out = QueryResult {
        series: slice.series.clone(),
        ..QueryResult::default()
    };
    if scan.is_empty() {
        return Ok(out);
    }

    let res = slice.resolution;
    let step = res.increment_ms();
    let last = res.bucket_start(slice.to);
    let (mut win_start, mut win_end) = (0, 0);
    let (mut sum, mut count) = (0.0, 0usize);

    let mut ts = res.bucket_start(slice.from);
    while ts <= last {
        while win_end < scan.len() && scan.timestamps[win_end] <= ts {
            sum += scan.values[win_end];
            count += 1;
            win_end += 1;
        }
        while win_start < win_end && scan.timestamps[win_start].saturating_add(window) < ts {
            sum -= scan.values[win_start];
            count -= 1;
            win_start += 1;
        }
        if let Some(value) = emit(sum, count) {
            out.timestamps.push(ts);
            out.values.push(value);
        }
        match ts.checked_add(step) {
            Some(next) => ts = next,
            None => break,
        }
    }
    Ok(out)
}
