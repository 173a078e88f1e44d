//! Mergeable per-bucket statistics.
//!
//! [`Statistics`] keeps exact count, sum, min, max and Welford mean/M2, plus
//! a bounded-memory quantile sketch. Two instances can be merged in any
//! order: the exact aggregates come out identical and the sketch yields the
//! same quantile estimates, although its internal item order may differ.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::codec::SliceReader;
use crate::error::{Result, RollupError};

const FORMAT_VERSION: u8 = 1;

/// Items a sketch level holds before it is compacted.
pub const DEFAULT_SKETCH_K: u32 = 256;

/// An aggregate that can be read out of a [`Statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Sum of values.
    Sum,
    /// Number of values.
    Count,
    /// Arithmetic mean.
    Avg,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Median estimate.
    P50,
    /// 75th percentile estimate.
    P75,
    /// 90th percentile estimate.
    P90,
    /// 95th percentile estimate.
    P95,
    /// 99th percentile estimate.
    P99,
}

impl Aggregation {
    /// The quantile for percentile aggregations.
    pub fn quantile(self) -> Option<f64> {
        match self {
            Self::P50 => Some(0.50),
            Self::P75 => Some(0.75),
            Self::P90 => Some(0.90),
            Self::P95 => Some(0.95),
            Self::P99 => Some(0.99),
            _ => None,
        }
    }
}

/// Compacting quantile sketch.
///
/// Level `h` holds items of weight `2^h`. When a level reaches `k` items it
/// is sorted and every other item is promoted to the next level; the
/// starting parity alternates between compactions so promotion is unbiased
/// on average. All decisions depend only on level sizes and sorted content,
/// which keeps merges order-independent.
#[derive(Debug, Clone, PartialEq)]
struct QuantileSketch {
    k: u32,
    levels: Vec<Vec<f64>>,
    compactions: u64,
}

impl QuantileSketch {
    fn new(k: u32) -> Self {
        Self {
            k: k.max(2),
            levels: vec![Vec::new()],
            compactions: 0,
        }
    }

    fn insert(&mut self, value: f64) {
        self.levels[0].push(value);
        self.compress();
    }

    fn merge(&mut self, other: &Self) {
        if other.levels.len() > self.levels.len() {
            self.levels.resize_with(other.levels.len(), Vec::new);
        }
        for (level, items) in self.levels.iter_mut().zip(&other.levels) {
            level.extend_from_slice(items);
        }
        self.compactions += other.compactions;
        self.compress();
    }

    fn compress(&mut self) {
        let k = self.k as usize;
        let mut h = 0;
        while h < self.levels.len() {
            if self.levels[h].len() >= k {
                self.compact(h);
            }
            h += 1;
        }
    }

    fn compact(&mut self, h: usize) {
        let mut items = std::mem::take(&mut self.levels[h]);
        items.sort_by(f64::total_cmp);
        if items.len() % 2 == 1
            && let Some(odd) = items.pop()
        {
            self.levels[h].push(odd);
        }
        let offset = usize::from(self.compactions % 2 == 1);
        self.compactions += 1;

        if self.levels.len() == h + 1 {
            self.levels.push(Vec::new());
        }
        self.levels[h + 1].extend(items.into_iter().skip(offset).step_by(2));
    }

    fn total_weight(&self) -> u64 {
        self.levels
            .iter()
            .enumerate()
            .map(|(h, items)| (items.len() as u64) << h)
            .sum()
    }

    #[allow(clippy::cast_precision_loss)] // weights far below 2^52
    fn quantile(&self, q: f64) -> f64 {
        let total = self.total_weight();
        if total == 0 {
            return f64::NAN;
        }
        let mut weighted: Vec<(f64, u64)> = self
            .levels
            .iter()
            .enumerate()
            .flat_map(|(h, items)| items.iter().map(move |v| (*v, 1u64 << h)))
            .collect();
        weighted.sort_by(|a, b| a.0.total_cmp(&b.0));

        let target = q.clamp(0.0, 1.0) * total as f64;
        let mut cumulative = 0u64;
        for (value, weight) in &weighted {
            cumulative += weight;
            if cumulative as f64 >= target {
                return *value;
            }
        }
        weighted.last().map_or(f64::NAN, |(v, _)| *v)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Moments {
    count: u64,
    mean: f64,
    m2: f64,
    sum: f64,
    min: f64,
    max: f64,
    sketch: QuantileSketch,
}

impl Moments {
    fn new(k: u32) -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sketch: QuantileSketch::new(k),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sketch.insert(value);
    }

    #[allow(clippy::cast_precision_loss)]
    fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            let k = self.sketch.k;
            *self = other.clone();
            self.sketch.k = k.max(other.sketch.k);
            return;
        }
        let (na, nb) = (self.count as f64, other.count as f64);
        let n = na + nb;
        let delta = other.mean - self.mean;
        self.mean = (self.mean * na + other.mean * nb) / n;
        self.m2 += other.m2 + delta * delta * na * nb / n;
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sketch.merge(&other.sketch);
    }
}

/// Thread-safe mergeable statistics for one time bucket.
///
/// Non-finite values are ignored.
///
/// # Examples
///
/// ```rust
/// use rollwal::stats::{Aggregation, Statistics};
///
/// let stats = Statistics::new();
/// for v in [1.0, 2.0, 3.0, 4.0] {
///     stats.update(v);
/// }
/// assert_eq!(stats.count(), 4);
/// assert_eq!(stats.aggregate(Aggregation::Sum), 10.0);
/// assert_eq!(stats.aggregate(Aggregation::Max), 4.0);
/// ```
#[derive(Debug)]
pub struct Statistics {
    inner: RwLock<Moments>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Statistics {
    fn clone(&self) -> Self {
        Self {
            inner: RwLock::new(self.inner.read().clone()),
        }
    }
}

impl Statistics {
    /// Empty statistics with the default sketch size.
    pub fn new() -> Self {
        Self::with_sketch_k(DEFAULT_SKETCH_K)
    }

    /// Empty statistics whose sketch compacts levels at `k` items.
    pub fn with_sketch_k(k: u32) -> Self {
        Self {
            inner: RwLock::new(Moments::new(k)),
        }
    }

    /// Adds one value.
    pub fn update(&self, value: f64) {
        if value.is_finite() {
            self.inner.write().update(value);
        }
    }

    /// Folds `other` into `self`.
    pub fn merge(&self, other: &Statistics) {
        if std::ptr::eq(self, other) {
            let copy = self.inner.read().clone();
            self.inner.write().merge(&copy);
            return;
        }
        let theirs = other.inner.read().clone();
        self.inner.write().merge(&theirs);
    }

    /// Number of values.
    pub fn count(&self) -> u64 {
        self.inner.read().count
    }

    /// Sum of values.
    pub fn sum(&self) -> f64 {
        self.inner.read().sum
    }

    /// Mean of values, NaN when empty.
    #[allow(clippy::cast_precision_loss)]
    pub fn avg(&self) -> f64 {
        let m = self.inner.read();
        if m.count == 0 {
            f64::NAN
        } else {
            m.sum / m.count as f64
        }
    }

    /// Smallest value, NaN when empty.
    pub fn min(&self) -> f64 {
        let m = self.inner.read();
        if m.count == 0 { f64::NAN } else { m.min }
    }

    /// Largest value, NaN when empty.
    pub fn max(&self) -> f64 {
        let m = self.inner.read();
        if m.count == 0 { f64::NAN } else { m.max }
    }

    /// Population variance, NaN when empty.
    #[allow(clippy::cast_precision_loss)]
    pub fn variance(&self) -> f64 {
        let m = self.inner.read();
        if m.count == 0 {
            f64::NAN
        } else {
            m.m2 / m.count as f64
        }
    }

    /// Estimated value at quantile `q` in `[0, 1]`, NaN when empty.
    pub fn percentile(&self, q: f64) -> f64 {
        self.inner.read().sketch.quantile(q)
    }

    /// Reads one aggregate.
    #[allow(clippy::cast_precision_loss)]
    pub fn aggregate(&self, agg: Aggregation) -> f64 {
        match agg {
            Aggregation::Sum => self.sum(),
            Aggregation::Count => self.count() as f64,
            Aggregation::Avg => self.avg(),
            Aggregation::Min => self.min(),
            Aggregation::Max => self.max(),
            p => p.quantile().map_or(f64::NAN, |q| self.percentile(q)),
        }
    }

    /// Encodes the full state.
    ///
    /// Equal update sequences produce byte-identical output.
    pub fn serialize(&self) -> Vec<u8> {
        let m = self.inner.read();
        let mut buf = Vec::with_capacity(64 + 8 * m.sketch.levels.iter().map(Vec::len).sum::<usize>());
        buf.push(FORMAT_VERSION);
        encode_moments(&m, &mut buf);
        buf
    }

    /// Decodes state produced by [`Statistics::serialize`].
    ///
    /// # Errors
    ///
    /// Returns [`RollupError::CorruptedStatistics`] if the bytes are not a
    /// valid encoding.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: &str| RollupError::CorruptedStatistics {
            reason: reason.to_string(),
        };
        let (&version, rest) = bytes.split_first().ok_or_else(|| corrupt("empty input"))?;
        if version != FORMAT_VERSION {
            return Err(corrupt("unknown format version").into());
        }
        let mut r = SliceReader::new(rest);
        let truncated = || corrupt("truncated");

        let count = r.u64().ok_or_else(truncated)?;
        let mean = r.f64().ok_or_else(truncated)?;
        let m2 = r.f64().ok_or_else(truncated)?;
        let sum = r.f64().ok_or_else(truncated)?;
        let min = r.f64().ok_or_else(truncated)?;
        let max = r.f64().ok_or_else(truncated)?;
        let k = r.u32().ok_or_else(truncated)?;
        let compactions = r.u64().ok_or_else(truncated)?;
        let level_count = r.u32().ok_or_else(truncated)? as usize;
        if level_count == 0 || level_count > 64 {
            return Err(corrupt("invalid sketch level count").into());
        }

        let mut levels = Vec::with_capacity(level_count);
        for _ in 0..level_count {
            let len = r.u32().ok_or_else(truncated)? as usize;
            if len * 8 > r.remaining() {
                return Err(truncated().into());
            }
            let items = (0..len).filter_map(|_| r.f64()).collect();
            levels.push(items);
        }
        if r.remaining() != 0 {
            return Err(corrupt("trailing bytes").into());
        }

        Ok(Self {
            inner: RwLock::new(Moments {
                count,
                mean,
                m2,
                sum,
                min,
                max,
                sketch: QuantileSketch {
                    k: k.max(2),
                    levels,
                    compactions,
                },
            }),
        })
    }
}

// Sketch levels compact at a few times k items, far below u32::MAX.
#[allow(clippy::cast_possible_truncation)]
fn encode_moments(m: &Moments, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&m.count.to_be_bytes());
    for v in [m.mean, m.m2, m.sum, m.min, m.max] {
        buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }
    buf.extend_from_slice(&m.sketch.k.to_be_bytes());
    buf.extend_from_slice(&m.sketch.compactions.to_be_bytes());
    buf.extend_from_slice(&(m.sketch.levels.len() as u32).to_be_bytes());
    for level in &m.sketch.levels {
        buf.extend_from_slice(&(level.len() as u32).to_be_bytes());
        for v in level {
            buf.extend_from_slice(&v.to_bits().to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(values: impl IntoIterator<Item = f64>) -> Statistics {
        let stats = Statistics::new();
        for v in values {
            stats.update(v);
        }
        stats
    }

    #[test]
    fn test_exact_aggregates() {
        let stats = filled([4.0, 1.0, 3.0, 2.0]);
        assert_eq!(stats.count(), 4);
        assert_eq!(stats.sum(), 10.0);
        assert_eq!(stats.avg(), 2.5);
        assert_eq!(stats.min(), 1.0);
        assert_eq!(stats.max(), 4.0);
        assert!((stats.variance() - 1.25).abs() < 1e-12);
        assert_eq!(stats.aggregate(Aggregation::Count), 4.0);
    }

    #[test]
    fn test_empty_reads_nan() {
        let stats = Statistics::new();
        assert_eq!(stats.count(), 0);
        assert!(stats.avg().is_nan());
        assert!(stats.min().is_nan());
        assert!(stats.percentile(0.5).is_nan());
    }

    #[test]
    fn test_non_finite_values_ignored() {
        let stats = filled([1.0, f64::NAN, f64::INFINITY, 3.0]);
        assert_eq!(stats.count(), 2);
        assert_eq!(stats.max(), 3.0);
    }

    #[test]
    fn test_small_percentiles_are_exact() {
        let stats = filled((1..=100).map(f64::from));
        assert_eq!(stats.percentile(0.5), 50.0);
        assert_eq!(stats.percentile(0.99), 99.0);
        assert_eq!(stats.percentile(0.0), 1.0);
        assert_eq!(stats.percentile(1.0), 100.0);
    }

    #[test]
    fn test_large_percentiles_within_tolerance() {
        let n: u32 = 100_000;
        // deterministic shuffle of 0..n
        let stats = filled((0..n).map(|i| f64::from((i * 7919) % n)));
        for (q, expected) in [(0.5, 50_000.0), (0.9, 90_000.0), (0.99, 99_000.0)] {
            let estimate = stats.percentile(q);
            let error = (estimate - expected).abs() / f64::from(n);
            assert!(error < 0.02, "q={q}: estimate {estimate}, error {error}");
        }
        assert_eq!(stats.count(), u64::from(n));
    }

    #[test]
    fn test_merge_is_commutative() {
        let a_values: Vec<f64> = (0..5_000).map(|i| f64::from(i % 977)).collect();
        let b_values: Vec<f64> = (0..3_000).map(|i| f64::from(i % 131) * 3.5).collect();

        let ab = filled(a_values.iter().copied());
        ab.merge(&filled(b_values.iter().copied()));
        let ba = filled(b_values.iter().copied());
        ba.merge(&filled(a_values.iter().copied()));

        for agg in [
            Aggregation::Sum,
            Aggregation::Count,
            Aggregation::Avg,
            Aggregation::Min,
            Aggregation::Max,
        ] {
            assert_eq!(ab.aggregate(agg), ba.aggregate(agg), "{agg:?}");
        }
        for agg in [Aggregation::P50, Aggregation::P90, Aggregation::P99] {
            let (x, y) = (ab.aggregate(agg), ba.aggregate(agg));
            assert!((x - y).abs() <= 0.02 * x.abs().max(1.0), "{agg:?}: {x} vs {y}");
        }
    }

    #[test]
    fn test_merge_matches_combined_stream() {
        let left = filled((0..500).map(f64::from));
        let right = filled((500..1000).map(f64::from));
        left.merge(&right);
        let whole = filled((0..1000).map(f64::from));

        assert_eq!(left.count(), whole.count());
        assert_eq!(left.sum(), whole.sum());
        assert!((left.variance() - whole.variance()).abs() < 1e-6);
        assert!((left.percentile(0.5) - whole.percentile(0.5)).abs() <= 20.0);
    }

    #[test]
    fn test_merge_into_empty_and_self() {
        let empty = Statistics::new();
        let data = filled([5.0, 7.0]);
        empty.merge(&data);
        assert_eq!(empty.count(), 2);
        assert_eq!(empty.min(), 5.0);

        data.merge(&data);
        assert_eq!(data.count(), 4);
        assert_eq!(data.sum(), 24.0);
    }

    #[test]
    fn test_serialize_is_deterministic_and_complete() {
        let values: Vec<f64> = (0..2_000).map(|i| f64::from(i) * 0.25).collect();
        let a = filled(values.iter().copied());
        let b = filled(values.iter().copied());
        assert_eq!(a.serialize(), b.serialize());

        let restored = Statistics::deserialize(&a.serialize()).unwrap();
        assert_eq!(restored.serialize(), a.serialize());
        assert_eq!(restored.percentile(0.9), a.percentile(0.9));
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(Statistics::deserialize(&[]).is_err());
        assert!(Statistics::deserialize(&[9, 0, 0]).is_err());
        let bytes = filled([1.0]).serialize();
        assert!(Statistics::deserialize(&bytes[..bytes.len() - 4]).is_err());
    }
}
