//! Read-only views derived from [`OperationStats`].
//!
//! Representations are computed on demand and never modify their source. Each representation
//! returns `None` when the accumulator kind cannot answer it, for example a percentile of a
//! [`BasicStats`](crate::BasicStats) accumulator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{OperationStats, StatsError, StatsResult};

/// z-score of the 97.5th percentile of the standard normal distribution.
const INVERSE_NORMAL_95: f64 = 1.96;
/// z-score of the 75th percentile of the standard normal distribution.
const INVERSE_NORMAL_50: f64 = 0.67448;

const NANOS_PER_SEC: f64 = 1e9;

/// A derived view of a single [`OperationStats`] accumulator.
pub trait Representation: Sized {
    /// Additional arguments needed for the computation.
    type Args;

    /// Computes the representation, or returns `None` if the accumulator cannot provide it.
    fn compute(stats: &OperationStats, args: Self::Args) -> StatsResult<Option<Self>>;
}

/// Request and error counts together with the mean and maximum latency.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefaultOutcome {
    /// Total requests, including failed ones.
    pub requests: u64,
    /// Failed requests.
    pub errors: u64,
    /// Mean latency in nanoseconds.
    pub mean: f64,
    /// Maximum latency in nanoseconds.
    pub max: u64,
}

impl Representation for DefaultOutcome {
    type Args = ();

    fn compute(stats: &OperationStats, _args: ()) -> StatsResult<Option<Self>> {
        Ok(Some(DefaultOutcome {
            requests: stats.requests(),
            errors: stats.errors(),
            mean: stats.mean(),
            max: stats.max(),
        }))
    }
}

/// Mean latency and its sample standard deviation, in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeanAndDev {
    /// Mean latency.
    pub mean: f64,
    /// Sample standard deviation.
    pub dev: f64,
}

impl Representation for MeanAndDev {
    type Args = ();

    fn compute(stats: &OperationStats, _args: ()) -> StatsResult<Option<Self>> {
        let dev = match stats {
            OperationStats::Basic(basic) => basic.std_dev(),
            OperationStats::Recording(recording) => recording.std_dev(),
            OperationStats::Sketch(_) => return Ok(None),
        };
        Ok(Some(MeanAndDev {
            mean: stats.mean(),
            dev,
        }))
    }
}

/// Latency at a given percentile, in nanoseconds.
///
/// For recorded samples this is the smallest sample such that at least `p`% of all samples are
/// less than or equal to it. Sketches return an estimate within their relative error bound.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Percentile {
    /// The requested percentile in `[0, 100]`.
    pub percentile: f64,
    /// The latency at that percentile.
    pub value: f64,
}

impl Representation for Percentile {
    type Args = f64;

    fn compute(stats: &OperationStats, percentile: f64) -> StatsResult<Option<Self>> {
        check_percentile(percentile)?;
        let value = match stats {
            OperationStats::Basic(_) => None,
            OperationStats::Recording(recording) => {
                value_at_percentile(&recording.sorted_samples(), percentile).map(|v| v as f64)
            }
            OperationStats::Sketch(sketch) => sketch.quantile(percentile / 100.0)?,
        };
        Ok(value.map(|value| Percentile { percentile, value }))
    }
}

fn check_percentile(percentile: f64) -> StatsResult<()> {
    if (0.0..=100.0).contains(&percentile) {
        Ok(())
    } else {
        Err(StatsError::InvalidPercentile(percentile))
    }
}

/// Returns the smallest value in `sorted` with at least `percentile`% of values at or below it.
fn value_at_percentile(sorted: &[u64], percentile: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (percentile * sorted.len() as f64 / 100.0).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    Some(sorted[index])
}

/// Arguments for [`Histogram`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistogramArgs {
    /// Number of buckets, at least one.
    pub buckets: usize,
    /// Samples above the latency at this percentile are dropped as outliers.
    pub cutoff_percentile: f64,
}

impl Default for HistogramArgs {
    fn default() -> Self {
        Self {
            buckets: 32,
            cutoff_percentile: 99.0,
        }
    }
}

/// Latency distribution over logarithmically sized buckets.
///
/// `counts[i]` is the number of samples in `[ranges[i], ranges[i + 1])`, except for the last bucket
/// which also includes `ranges[buckets]`. There is always one more range boundary than buckets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    /// Bucket boundaries in nanoseconds, non-decreasing.
    pub ranges: Vec<u64>,
    /// Samples per bucket.
    pub counts: Vec<u64>,
}

impl Histogram {
    /// Total number of samples contained in the histogram.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

impl Representation for Histogram {
    type Args = HistogramArgs;

    fn compute(stats: &OperationStats, args: HistogramArgs) -> StatsResult<Option<Self>> {
        if args.buckets == 0 {
            return Err(StatsError::NoBuckets);
        }
        check_percentile(args.cutoff_percentile)?;

        let OperationStats::Recording(recording) = stats else {
            return Ok(None);
        };
        let sorted = recording.sorted_samples();
        let (Some(&min), Some(max)) = (
            sorted.first(),
            value_at_percentile(&sorted, args.cutoff_percentile),
        ) else {
            return Ok(None);
        };

        let ranges = log_ranges(min, max, args.buckets);
        let inner = &ranges[1..args.buckets];
        let mut counts = vec![0; args.buckets];
        for &sample in sorted.iter().take_while(|&&s| s <= max) {
            let bucket = inner.partition_point(|&boundary| boundary <= sample);
            counts[bucket] += 1;
        }

        Ok(Some(Histogram { ranges, counts }))
    }
}

/// Produces `buckets + 1` boundaries from `min` to `max`, growing by a constant factor.
fn log_ranges(min: u64, max: u64, buckets: usize) -> Vec<u64> {
    let low = min.max(1) as f64;
    let factor = (max.max(1) as f64 / low).powf(1.0 / buckets as f64);

    let mut ranges = Vec::with_capacity(buckets + 1);
    ranges.push(min);
    for i in 1..buckets {
        let boundary = (low * factor.powi(i as i32)).round() as u64;
        let previous = ranges[i - 1];
        ranges.push(boundary.clamp(previous, max));
    }
    ranges.push(max);
    ranges
}

/// Box plot of the latency distribution, in nanoseconds.
///
/// Accumulators with recorded samples or a sketch use the 2.5th, 25th, 50th, 75th and 97.5th
/// percentiles. Basic accumulators assume a normal distribution around the mean.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoxAndWhiskers {
    /// Upper whisker.
    pub max_regular: f64,
    /// Upper quartile.
    pub upper_quartile: f64,
    /// Median, or mean for basic accumulators.
    pub midpoint: f64,
    /// Lower quartile.
    pub lower_quartile: f64,
    /// Lower whisker.
    pub min_regular: f64,
}

impl Representation for BoxAndWhiskers {
    type Args = ();

    fn compute(stats: &OperationStats, _args: ()) -> StatsResult<Option<Self>> {
        if let OperationStats::Basic(basic) = stats {
            let mean = stats.mean();
            let dev = basic.std_dev();
            return Ok(Some(BoxAndWhiskers {
                max_regular: mean + INVERSE_NORMAL_95 * dev,
                upper_quartile: mean + INVERSE_NORMAL_50 * dev,
                midpoint: mean,
                lower_quartile: mean - INVERSE_NORMAL_50 * dev,
                min_regular: mean - INVERSE_NORMAL_95 * dev,
            }));
        }

        let at = |p: f64| -> StatsResult<Option<f64>> {
            Ok(Percentile::compute(stats, p)?.map(|percentile| percentile.value))
        };
        let values = (at(97.5)?, at(75.0)?, at(50.0)?, at(25.0)?, at(2.5)?);
        let (Some(max_regular), Some(upper), Some(mid), Some(lower), Some(min_regular)) = values
        else {
            return Ok(None);
        };

        Ok(Some(BoxAndWhiskers {
            max_regular,
            upper_quartile: upper,
            midpoint: mid,
            lower_quartile: lower,
            min_regular,
        }))
    }
}

/// Requests per second.
///
/// The theoretical throughput is what `threads` units would achieve if every request took the mean
/// latency. The actual throughput divides the request count by the measured wall clock time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    /// `threads / mean latency`, in requests per second.
    pub theoretical: f64,
    /// `requests / duration`, in requests per second.
    pub actual: f64,
}

impl Throughput {
    /// Computes throughput, or `None` if the duration or the mean latency is zero.
    pub fn compute(
        requests: u64,
        mean_latency_nanos: f64,
        threads: usize,
        duration: Duration,
    ) -> Option<Self> {
        let duration_nanos = duration.as_nanos() as f64;
        if duration_nanos <= 0.0 || mean_latency_nanos <= 0.0 {
            return None;
        }
        Some(Throughput {
            theoretical: NANOS_PER_SEC * threads as f64 / mean_latency_nanos,
            actual: NANOS_PER_SEC * requests as f64 / duration_nanos,
        })
    }
}

/// Payload bytes per second.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataThroughput {
    /// Bytes transferred per second of wall clock time.
    pub bytes_per_sec: f64,
}

impl DataThroughput {
    /// Computes data throughput, or `None` if the duration is zero.
    pub fn compute(requests: u64, bytes_per_request: u64, duration: Duration) -> Option<Self> {
        let secs = duration.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(DataThroughput {
            bytes_per_sec: requests as f64 * bytes_per_request as f64 / secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::StatsKind;

    fn recorded(kind: StatsKind, samples: &[u64]) -> OperationStats {
        let mut stats = kind.new_stats();
        for &nanos in samples {
            stats.record(Duration::from_nanos(nanos), true);
        }
        stats
    }

    fn percentile(stats: &OperationStats, p: f64) -> f64 {
        Percentile::compute(stats, p).unwrap().unwrap().value
    }

    #[test]
    fn percentile_is_inclusive() {
        let stats = recorded(StatsKind::Recording, &[3, 1, 2, 1, 1]);

        assert_eq!(percentile(&stats, 0.0), 1.0);
        assert_eq!(percentile(&stats, 60.0), 1.0);
        assert_eq!(percentile(&stats, 70.0), 2.0);
        assert_eq!(percentile(&stats, 100.0), 3.0);
    }

    #[test]
    fn percentile_requires_samples() {
        let basic = recorded(StatsKind::Basic, &[1, 2, 3]);
        assert_eq!(Percentile::compute(&basic, 50.0).unwrap(), None);

        let empty = StatsKind::Recording.new_stats();
        assert_eq!(Percentile::compute(&empty, 50.0).unwrap(), None);

        let err = Percentile::compute(&empty, 101.0).unwrap_err();
        assert!(matches!(err, StatsError::InvalidPercentile(_)));
    }

    #[test]
    fn sketch_percentile_within_relative_error() {
        let samples: Vec<u64> = (1..=10_000).map(|i| i * 1_000).collect();
        let stats = recorded(StatsKind::Sketch, &samples);

        let p50 = percentile(&stats, 50.0);
        assert!((p50 - 5_000_000.0).abs() / 5_000_000.0 <= 0.02, "{p50}");
    }

    #[test]
    fn histogram_counts_every_sample() {
        let mut rng = SmallRng::seed_from_u64(42);
        let samples: Vec<u64> = (0..1000).map(|_| rng.random_range(0..1_000_000)).collect();
        let stats = recorded(StatsKind::Recording, &samples);

        for buckets in [1, 2, 7, 32] {
            let args = HistogramArgs {
                buckets,
                cutoff_percentile: 100.0,
            };
            let histogram = Histogram::compute(&stats, args).unwrap().unwrap();

            assert_eq!(histogram.ranges.len(), histogram.counts.len() + 1);
            assert_eq!(histogram.counts.len(), buckets);
            assert_eq!(histogram.total(), samples.len() as u64);
            assert!(histogram.ranges.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(histogram.ranges.first(), samples.iter().min());
            assert_eq!(histogram.ranges.last(), samples.iter().max());
        }
    }

    #[test]
    fn histogram_drops_outliers_above_cutoff() {
        let mut samples: Vec<u64> = (1..=99).collect();
        samples.push(1_000_000);
        let stats = recorded(StatsKind::Recording, &samples);

        let args = HistogramArgs {
            buckets: 4,
            cutoff_percentile: 99.0,
        };
        let histogram = Histogram::compute(&stats, args).unwrap().unwrap();

        assert_eq!(histogram.ranges.last(), Some(&99));
        assert_eq!(histogram.total(), 99);
    }

    #[test]
    fn histogram_with_identical_samples() {
        let stats = recorded(StatsKind::Recording, &[7, 7, 7]);
        let histogram = Histogram::compute(&stats, HistogramArgs::default())
            .unwrap()
            .unwrap();

        assert_eq!(histogram.total(), 3);
        assert_eq!(histogram.counts.last(), Some(&3));
    }

    #[test]
    fn histogram_rejects_zero_buckets() {
        let stats = recorded(StatsKind::Recording, &[1]);
        let args = HistogramArgs {
            buckets: 0,
            cutoff_percentile: 100.0,
        };
        assert!(matches!(
            Histogram::compute(&stats, args),
            Err(StatsError::NoBuckets)
        ));
    }

    #[test]
    fn box_and_whiskers_for_basic_uses_normal_approximation() {
        let stats = recorded(StatsKind::Basic, &[2, 4, 6]);
        let boxed = BoxAndWhiskers::compute(&stats, ()).unwrap().unwrap();

        assert_eq!(boxed.midpoint, 4.0);
        assert!((boxed.max_regular - (4.0 + 1.96 * 2.0)).abs() < 1e-9);
        assert!((boxed.lower_quartile - (4.0 - 0.67448 * 2.0)).abs() < 1e-9);
    }

    #[test]
    fn box_and_whiskers_for_recording_uses_percentiles() {
        let samples: Vec<u64> = (1..=100).collect();
        let stats = recorded(StatsKind::Recording, &samples);
        let boxed = BoxAndWhiskers::compute(&stats, ()).unwrap().unwrap();

        assert_eq!(boxed.midpoint, 50.0);
        assert_eq!(boxed.upper_quartile, 75.0);
        assert_eq!(boxed.min_regular, 3.0);
        assert_eq!(boxed.max_regular, 98.0);
    }

    #[test]
    fn default_outcome_and_mean_and_dev() {
        let stats = recorded(StatsKind::Recording, &[2, 4, 6]);

        let outcome = DefaultOutcome::compute(&stats, ()).unwrap().unwrap();
        assert_eq!(outcome.requests, 3);
        assert_eq!(outcome.errors, 0);
        assert_eq!(outcome.mean, 4.0);
        assert_eq!(outcome.max, 6);

        let mean_and_dev = MeanAndDev::compute(&stats, ()).unwrap().unwrap();
        assert_eq!(mean_and_dev.dev, 2.0);
    }

    #[test]
    fn throughput_without_duration_has_no_value() {
        assert_eq!(Throughput::compute(100, 1_000.0, 4, Duration::ZERO), None);
        assert_eq!(DataThroughput::compute(100, 10, Duration::ZERO), None);
    }

    #[test]
    fn throughput_from_latency_and_duration() {
        let throughput = Throughput::compute(500, 2_000_000.0, 2, Duration::from_secs(1)).unwrap();
        assert_eq!(throughput.theoretical, 1000.0);
        assert_eq!(throughput.actual, 500.0);

        let data = DataThroughput::compute(500, 1000, Duration::from_secs(2)).unwrap();
        assert_eq!(data.bytes_per_sec, 250_000.0);
    }
}
