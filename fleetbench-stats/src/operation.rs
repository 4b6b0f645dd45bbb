use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sketches_ddsketch::DDSketch;

use crate::{StatsError, StatsResult};

/// Selects which accumulator is created for each recorded operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsKind {
    /// Fixed memory footprint, moments only. See [`BasicStats`].
    #[default]
    Basic,
    /// Keeps every sample. See [`RecordingStats`].
    Recording,
    /// Keeps a relative-error quantile sketch. See [`SketchStats`].
    Sketch,
}

impl StatsKind {
    /// Creates an empty accumulator of this kind.
    pub fn new_stats(self) -> OperationStats {
        match self {
            StatsKind::Basic => OperationStats::Basic(BasicStats::default()),
            StatsKind::Recording => OperationStats::Recording(RecordingStats::default()),
            StatsKind::Sketch => OperationStats::Sketch(SketchStats::default()),
        }
    }
}

impl fmt::Display for StatsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatsKind::Basic => "basic",
            StatsKind::Recording => "recording",
            StatsKind::Sketch => "sketch",
        };
        f.write_str(name)
    }
}

/// Accumulator for the outcomes of a single named operation.
///
/// An accumulator is owned by exactly one execution unit while it records. Once the unit has
/// stopped, accumulators are combined with [`merge`](Self::merge). Failed requests count towards
/// both the request and the error count, and their durations are part of the latency data.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationStats {
    /// See [`BasicStats`].
    Basic(BasicStats),
    /// See [`RecordingStats`].
    Recording(RecordingStats),
    /// See [`SketchStats`].
    Sketch(SketchStats),
}

impl OperationStats {
    /// Returns the kind of this accumulator.
    pub fn kind(&self) -> StatsKind {
        match self {
            OperationStats::Basic(_) => StatsKind::Basic,
            OperationStats::Recording(_) => StatsKind::Recording,
            OperationStats::Sketch(_) => StatsKind::Sketch,
        }
    }

    /// Records one request that took `duration`.
    pub fn record(&mut self, duration: Duration, success: bool) {
        let nanos = duration_nanos(duration);
        match self {
            OperationStats::Basic(stats) => stats.record(nanos, success),
            OperationStats::Recording(stats) => stats.record(nanos, success),
            OperationStats::Sketch(stats) => stats.record(nanos, success),
        }
    }

    /// Merges `other` into this accumulator, leaving `other` unchanged.
    ///
    /// Fails without modifying `self` if the two accumulators are of different kinds.
    pub fn merge(&mut self, other: &OperationStats) -> StatsResult<()> {
        match (self, other) {
            (OperationStats::Basic(left), OperationStats::Basic(right)) => left.merge(right),
            (OperationStats::Recording(left), OperationStats::Recording(right)) => {
                left.merge(right)
            }
            (OperationStats::Sketch(left), OperationStats::Sketch(right)) => left.merge(right)?,
            (left, right) => {
                return Err(StatsError::IncompatibleKinds {
                    left: left.kind(),
                    right: right.kind(),
                });
            }
        }
        Ok(())
    }

    /// Consumes this accumulator and returns it merged with `other`.
    pub fn merged(mut self, other: &OperationStats) -> StatsResult<Self> {
        self.merge(other)?;
        Ok(self)
    }

    /// Total number of recorded requests, including failed ones.
    pub fn requests(&self) -> u64 {
        match self {
            OperationStats::Basic(stats) => stats.requests,
            OperationStats::Recording(stats) => stats.samples.len() as u64,
            OperationStats::Sketch(stats) => stats.sketch.count() as u64,
        }
    }

    /// Number of failed requests.
    pub fn errors(&self) -> u64 {
        match self {
            OperationStats::Basic(stats) => stats.errors,
            OperationStats::Recording(stats) => stats.errors,
            OperationStats::Sketch(stats) => stats.errors,
        }
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.requests() == 0
    }

    /// Mean latency in nanoseconds, `0` when empty.
    pub(crate) fn mean(&self) -> f64 {
        match self {
            OperationStats::Basic(stats) => stats.mean,
            OperationStats::Recording(stats) => stats.mean(),
            OperationStats::Sketch(stats) => stats.mean(),
        }
    }

    /// Maximum latency in nanoseconds, `0` when empty.
    pub(crate) fn max(&self) -> u64 {
        match self {
            OperationStats::Basic(stats) => stats.max,
            OperationStats::Recording(stats) => stats.samples.iter().copied().max().unwrap_or(0),
            OperationStats::Sketch(stats) => stats.sketch.max().map_or(0, |max| max as u64),
        }
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Fixed-size latency summary.
///
/// The mean and the second central moment are maintained with Welford's online update. Merging
/// uses Chan's pairwise combination, so merge results agree with sequential recording up to
/// floating point rounding, independent of the merge order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicStats {
    requests: u64,
    errors: u64,
    max: u64,
    sum: u64,
    mean: f64,
    m2: f64,
}

impl BasicStats {
    fn record(&mut self, nanos: u64, success: bool) {
        self.requests += 1;
        if !success {
            self.errors += 1;
        }
        self.max = self.max.max(nanos);
        self.sum = self.sum.saturating_add(nanos);

        let value = nanos as f64;
        let delta = value - self.mean;
        self.mean += delta / self.requests as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn merge(&mut self, other: &BasicStats) {
        let total = self.requests + other.requests;
        if total > 0 {
            let own = self.requests as f64;
            let theirs = other.requests as f64;
            let delta = other.mean - self.mean;
            self.m2 += other.m2 + delta * delta * own * theirs / total as f64;
            self.mean = (self.mean * own + other.mean * theirs) / total as f64;
        }

        self.requests = total;
        self.errors += other.errors;
        self.max = self.max.max(other.max);
        self.sum = self.sum.saturating_add(other.sum);
    }

    /// Sum of all recorded latencies in nanoseconds.
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Sample standard deviation, `0` for fewer than two samples.
    pub fn std_dev(&self) -> f64 {
        if self.requests < 2 {
            return 0.0;
        }
        (self.m2 / (self.requests - 1) as f64).sqrt()
    }
}

/// Keeps every recorded latency sample.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingStats {
    samples: Vec<u64>,
    errors: u64,
}

impl RecordingStats {
    fn record(&mut self, nanos: u64, success: bool) {
        self.samples.push(nanos);
        if !success {
            self.errors += 1;
        }
    }

    fn merge(&mut self, other: &RecordingStats) {
        self.samples.extend_from_slice(&other.samples);
        self.errors += other.errors;
    }

    /// The recorded samples in nanoseconds, in recording order.
    pub fn samples(&self) -> &[u64] {
        &self.samples
    }

    /// Returns a sorted copy of all samples.
    pub fn sorted_samples(&self) -> Vec<u64> {
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        sorted
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|&s| s as f64).sum();
        sum / self.samples.len() as f64
    }

    /// Sample standard deviation, `0` for fewer than two samples.
    pub fn std_dev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let m2: f64 = self
            .samples
            .iter()
            .map(|&s| (s as f64 - mean).powi(2))
            .sum();
        (m2 / (n - 1) as f64).sqrt()
    }
}

/// Keeps a DDSketch of the recorded latencies.
///
/// Quantiles have a relative error of at most 1% with the default sketch configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SketchStats {
    sketch: DDSketch,
    errors: u64,
}

impl fmt::Debug for SketchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SketchStats")
            .field("count", &self.sketch.count())
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

impl SketchStats {
    fn record(&mut self, nanos: u64, success: bool) {
        self.sketch.add(nanos as f64);
        if !success {
            self.errors += 1;
        }
    }

    fn merge(&mut self, other: &SketchStats) -> StatsResult<()> {
        self.sketch
            .merge(&other.sketch)
            .map_err(|err| StatsError::Sketch(format!("{err:?}")))?;
        self.errors += other.errors;
        Ok(())
    }

    fn mean(&self) -> f64 {
        match (self.sketch.sum(), self.sketch.count()) {
            (Some(sum), count) if count > 0 => sum / count as f64,
            _ => 0.0,
        }
    }

    /// Estimated latency at quantile `q` in `[0, 1]`.
    pub(crate) fn quantile(&self, q: f64) -> StatsResult<Option<f64>> {
        self.sketch
            .quantile(q)
            .map_err(|err| StatsError::Sketch(format!("{err:?}")))
    }
}
